//! `GatedCnn`: a stack of gated (GLU) 1-D convolutions over time.
//!
//! No subsampling; every input frame produces an output frame, so output
//! lengths equal input lengths.

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{conv1d, linear, Conv1d, Conv1dConfig, Linear, VarBuilder};

use crate::model::AcousticModel;

const GATED_HIDDEN: usize = 256;
const GATED_LAYERS: usize = 5;
const GATED_KERNEL: usize = 3;

/// One gated convolution: `conv → split channels → a ⊙ σ(b)`.
struct GatedConv {
    conv: Conv1d,
    out_channels: usize,
}

impl GatedConv {
    fn new(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv1dConfig {
            padding: GATED_KERNEL / 2,
            ..Default::default()
        };
        let conv = conv1d(in_channels, 2 * out_channels, GATED_KERNEL, cfg, vb.pp("conv"))?;
        Ok(Self { conv, out_channels })
    }

    /// `(batch, channels, frames)` → `(batch, out_channels, frames)`.
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = self.conv.forward(x)?;
        let a = y.narrow(1, 0, self.out_channels)?;
        let b = y.narrow(1, self.out_channels, self.out_channels)?;
        a * candle_nn::ops::sigmoid(&b)?
    }
}

/// Gated convolutional acoustic model.
pub struct GatedCnn {
    layers: Vec<GatedConv>,
    fc: Linear,
}

impl GatedCnn {
    pub fn new(feat_dim: usize, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let mut layers = Vec::with_capacity(GATED_LAYERS);
        let mut in_channels = feat_dim;
        for i in 0..GATED_LAYERS {
            layers.push(GatedConv::new(
                in_channels,
                GATED_HIDDEN,
                vb.pp(format!("layer{i}")),
            )?);
            in_channels = GATED_HIDDEN;
        }
        let fc = linear(GATED_HIDDEN, num_classes, vb.pp("fc"))?;
        Ok(Self { layers, fc })
    }
}

impl AcousticModel for GatedCnn {
    fn forward(&self, features: &Tensor, input_lengths: &[usize]) -> Result<(Tensor, Vec<usize>)> {
        // Convolutions run channel-first.
        let mut x = features.transpose(1, 2)?.contiguous()?;
        for (i, layer) in self.layers.iter().enumerate() {
            let y = layer.forward(&x)?;
            // Residual once the channel count stabilises.
            x = if i == 0 { y } else { (x + y)? };
        }
        let x = x.transpose(1, 2)?.contiguous()?;
        let logits = self.fc.forward(&x)?;
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
        Ok((log_probs, input_lengths.to_vec()))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
