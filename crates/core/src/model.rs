//! The acoustic-model interface and the shared convolutional front-end.
//!
//! Every architecture consumes padded `(batch, frames, dim)` spectrograms
//! plus per-sample frame counts, and emits `(batch, frames', classes)`
//! log-probabilities plus the subsampled frame counts. The CTC criterion and
//! the greedy decoder only ever see this contract.

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};

use asr_common::ModelKind;

use crate::deepspeech::{DeepSpeech, DeepSpeechTransformer};
use crate::gated_cnn::GatedCnn;
use crate::transformer::DeepTransformer;

/// A trainable sequence-to-sequence acoustic network.
pub trait AcousticModel {
    /// Forward pass. `features` is `(batch, frames, dim)` zero-padded past
    /// each sample's length; returns `(batch, frames', classes)`
    /// log-probabilities and the per-sample output frame counts.
    fn forward(&self, features: &Tensor, input_lengths: &[usize]) -> Result<(Tensor, Vec<usize>)>;
}

/// Construct the architecture for `kind` over `vb`'s variables.
pub fn build_model(
    kind: ModelKind,
    feat_dim: usize,
    num_classes: usize,
    vb: VarBuilder,
) -> Result<Box<dyn AcousticModel>> {
    Ok(match kind {
        ModelKind::DeepSpeech => Box::new(DeepSpeech::new(feat_dim, num_classes, vb)?),
        ModelKind::DeepSpeechTransformer => {
            Box::new(DeepSpeechTransformer::new(feat_dim, num_classes, vb)?)
        }
        ModelKind::DeepTransformer => Box::new(DeepTransformer::new(feat_dim, num_classes, vb)?),
        ModelKind::GatedCnn => Box::new(GatedCnn::new(feat_dim, num_classes, vb)?),
    })
}

// ── Conv front-end ──────────────────────────────────────────────────────────

const CONV_CHANNELS: usize = 32;
const CONV_KERNEL: usize = 3;
const CONV_STRIDE: usize = 2;
const CONV_PADDING: usize = 1;

/// Output length of one stride-2 convolution over an axis of length `l`.
fn conv_out_len(l: usize) -> usize {
    if l == 0 {
        return 0;
    }
    (l + 2 * CONV_PADDING - CONV_KERNEL) / CONV_STRIDE + 1
}

/// Two-layer 2-D convolutional subsampler shared by the recurrent and
/// attention architectures. Halves both the time and frequency axes twice
/// and folds channels × frequency into one model dimension.
pub struct ConvFrontend {
    conv1: Conv2d,
    conv2: Conv2d,
}

impl ConvFrontend {
    pub fn new(vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: CONV_PADDING,
            stride: CONV_STRIDE,
            ..Default::default()
        };
        let conv1 = conv2d(1, CONV_CHANNELS, CONV_KERNEL, cfg, vb.pp("conv1"))?;
        let conv2 = conv2d(CONV_CHANNELS, CONV_CHANNELS, CONV_KERNEL, cfg, vb.pp("conv2"))?;
        Ok(Self { conv1, conv2 })
    }

    /// `(batch, frames, dim)` → `(batch, frames', CONV_CHANNELS × dim')`.
    pub fn forward(&self, features: &Tensor) -> Result<Tensor> {
        let (b, t, f) = features.dims3()?;
        let x = features.reshape((b, 1, t, f))?;
        let x = self.conv1.forward(&x)?.relu()?;
        let x = self.conv2.forward(&x)?.relu()?;
        let (_, c, t2, f2) = x.dims4()?;
        let x = x.permute((0, 2, 1, 3))?.contiguous()?;
        x.reshape((b, t2, c * f2))
    }

    /// Model dimension produced for an input feature dimension.
    pub fn out_dim(&self, feat_dim: usize) -> usize {
        CONV_CHANNELS * conv_out_len(conv_out_len(feat_dim))
    }

    /// Frame count produced for an input frame count.
    pub fn out_len(&self, frames: usize) -> usize {
        conv_out_len(conv_out_len(frames))
    }

    /// Map every sample's input length through the subsampling arithmetic.
    pub fn out_lens(&self, input_lengths: &[usize]) -> Vec<usize> {
        input_lengths.iter().map(|&l| self.out_len(l)).collect()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
