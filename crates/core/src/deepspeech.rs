//! Recurrent architectures: `DeepSpeech` and `DeepSpeechTransformer`.
//!
//! Both run the shared conv front-end, then a GRU stack; the transformer
//! variant finishes with self-attention encoder layers instead of more
//! recurrence.

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{gru, linear, Linear, VarBuilder, GRU, GRUConfig, RNN};

use crate::model::{AcousticModel, ConvFrontend};
use crate::transformer::EncoderLayer;

/// GRU width of the DeepSpeech stack.
const DEEP_SPEECH_HIDDEN: usize = 750;
const DEEP_SPEECH_LAYERS: usize = 3;

/// Width shared by the GRU and encoder layers of the hybrid model.
const HYBRID_HIDDEN: usize = 512;
const HYBRID_ENCODER_LAYERS: usize = 2;
const HYBRID_HEADS: usize = 8;

fn run_gru(g: &GRU, x: &Tensor) -> Result<Tensor> {
    let states = g.seq(x)?;
    g.states_to_tensor(&states)
}

// ── DeepSpeech ──────────────────────────────────────────────────────────────

/// Conv front-end + stacked GRUs + linear classifier.
pub struct DeepSpeech {
    frontend: ConvFrontend,
    grus: Vec<GRU>,
    fc: Linear,
}

impl DeepSpeech {
    pub fn new(feat_dim: usize, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let frontend = ConvFrontend::new(vb.pp("frontend"))?;
        let mut grus = Vec::with_capacity(DEEP_SPEECH_LAYERS);
        let mut in_dim = frontend.out_dim(feat_dim);
        for i in 0..DEEP_SPEECH_LAYERS {
            grus.push(gru(
                in_dim,
                DEEP_SPEECH_HIDDEN,
                GRUConfig::default(),
                vb.pp(format!("gru{i}")),
            )?);
            in_dim = DEEP_SPEECH_HIDDEN;
        }
        let fc = linear(DEEP_SPEECH_HIDDEN, num_classes, vb.pp("fc"))?;
        Ok(Self { frontend, grus, fc })
    }
}

impl AcousticModel for DeepSpeech {
    fn forward(&self, features: &Tensor, input_lengths: &[usize]) -> Result<(Tensor, Vec<usize>)> {
        let mut x = self.frontend.forward(features)?;
        for g in &self.grus {
            x = run_gru(g, &x)?;
        }
        let logits = self.fc.forward(&x)?;
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
        Ok((log_probs, self.frontend.out_lens(input_lengths)))
    }
}

// ── DeepSpeechTransformer ───────────────────────────────────────────────────

/// Conv front-end + one GRU + self-attention encoder layers.
pub struct DeepSpeechTransformer {
    frontend: ConvFrontend,
    gru: GRU,
    encoder: Vec<EncoderLayer>,
    fc: Linear,
}

impl DeepSpeechTransformer {
    pub fn new(feat_dim: usize, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let frontend = ConvFrontend::new(vb.pp("frontend"))?;
        let g = gru(
            frontend.out_dim(feat_dim),
            HYBRID_HIDDEN,
            GRUConfig::default(),
            vb.pp("gru"),
        )?;
        let mut encoder = Vec::with_capacity(HYBRID_ENCODER_LAYERS);
        for i in 0..HYBRID_ENCODER_LAYERS {
            encoder.push(EncoderLayer::new(
                HYBRID_HIDDEN,
                HYBRID_HEADS,
                vb.pp(format!("encoder{i}")),
            )?);
        }
        let fc = linear(HYBRID_HIDDEN, num_classes, vb.pp("fc"))?;
        Ok(Self {
            frontend,
            gru: g,
            encoder,
            fc,
        })
    }
}

impl AcousticModel for DeepSpeechTransformer {
    fn forward(&self, features: &Tensor, input_lengths: &[usize]) -> Result<(Tensor, Vec<usize>)> {
        let x = self.frontend.forward(features)?;
        let mut x = run_gru(&self.gru, &x)?;
        for layer in &self.encoder {
            x = layer.forward(&x)?;
        }
        let logits = self.fc.forward(&x)?;
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
        Ok((log_probs, self.frontend.out_lens(input_lengths)))
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn deepspeech_emits_normalized_log_probs() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = DeepSpeech::new(6, 4, vb).unwrap();

        let features = Tensor::zeros((1, 12, 6), DType::F32, &device).unwrap();
        let (log_probs, out_lens) = model.forward(&features, &[12]).unwrap();
        let (b, t, c) = log_probs.dims3().unwrap();
        assert_eq!((b, c), (1, 4));
        assert_eq!(out_lens, vec![t]);

        // Rows sum to one in probability space.
        let sums = log_probs.exp().unwrap().sum(D::Minus1).unwrap();
        let sums = sums.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for s in sums {
            assert!((s - 1.0).abs() < 1e-4, "row sum {s}");
        }
    }
}
