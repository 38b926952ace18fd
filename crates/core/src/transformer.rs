//! Self-attention encoder blocks and the `DeepTransformer` architecture.
//!
//! Encoder attention is bidirectional: every frame may attend to every
//! other, so there is no causal mask. Blocks are pre-norm residual
//! (norm → sublayer → add), with a fused Q/K/V projection.

use candle_core::{DType, IndexOp, Module, Result, Tensor, D};
use candle_nn::{layer_norm, linear, LayerNorm, Linear, VarBuilder};

use crate::model::{AcousticModel, ConvFrontend};

const DEEP_TRANSFORMER_DIM: usize = 512;
const DEEP_TRANSFORMER_LAYERS: usize = 6;
const DEEP_TRANSFORMER_HEADS: usize = 8;
const FFN_EXPANSION: usize = 4;
const NORM_EPS: f64 = 1e-5;

// ── Encoder attention ───────────────────────────────────────────────────────

/// Multi-head bidirectional self-attention with fused Q/K/V projection.
pub struct EncoderAttention {
    c_attn: Linear,
    c_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl EncoderAttention {
    pub fn new(hidden: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        assert!(
            hidden % num_heads == 0,
            "hidden ({hidden}) must be divisible by num_heads ({num_heads})"
        );
        let head_dim = hidden / num_heads;
        let c_attn = linear(hidden, 3 * hidden, vb.pp("c_attn"))?;
        let c_proj = linear(hidden, hidden, vb.pp("c_proj"))?;
        Ok(Self {
            c_attn,
            c_proj,
            num_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, t, c) = x.dims3()?;

        let qkv = self.c_attn.forward(x)?;
        let qkv = qkv.reshape((b, t, 3, self.num_heads, self.head_dim))?;
        let qkv = qkv.permute((0, 3, 1, 4, 2))?; // (b, heads, t, head_dim, 3)

        let q = qkv.i((.., .., .., .., 0))?.contiguous()?;
        let k = qkv.i((.., .., .., .., 1))?.contiguous()?;
        let v = qkv.i((.., .., .., .., 2))?.contiguous()?;

        let scores = (q.matmul(&k.t()?)? * self.scale)?;
        let att = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let y = att.contiguous()?.matmul(&v)?;
        let y = y.transpose(1, 2)?; // (b, t, heads, head_dim)
        let y = y.reshape((b, t, c))?;

        self.c_proj.forward(&y)
    }
}

// ── Encoder layer ───────────────────────────────────────────────────────────

/// Pre-norm residual block: attention sub-layer then a ReLU FFN sub-layer.
pub struct EncoderLayer {
    attn: EncoderAttention,
    ln1: LayerNorm,
    ffn_up: Linear,
    ffn_down: Linear,
    ln2: LayerNorm,
}

impl EncoderLayer {
    pub fn new(hidden: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let attn = EncoderAttention::new(hidden, num_heads, vb.pp("attn"))?;
        let ln1 = layer_norm(hidden, NORM_EPS, vb.pp("ln1"))?;
        let ffn_up = linear(hidden, FFN_EXPANSION * hidden, vb.pp("mlp.up"))?;
        let ffn_down = linear(FFN_EXPANSION * hidden, hidden, vb.pp("mlp.down"))?;
        let ln2 = layer_norm(hidden, NORM_EPS, vb.pp("ln2"))?;
        Ok(Self {
            attn,
            ln1,
            ffn_up,
            ffn_down,
            ln2,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let normed = self.ln1.forward(x)?;
        let x = (x + self.attn.forward(&normed)?)?;

        let normed = self.ln2.forward(&x)?;
        let ff = self.ffn_down.forward(&self.ffn_up.forward(&normed)?.relu()?)?;
        &x + ff
    }
}

// ── Positional encoding ─────────────────────────────────────────────────────

/// Fixed sinusoidal position table, shape `(frames, dim)`.
pub fn sinusoidal_positions(
    frames: usize,
    dim: usize,
    device: &candle_core::Device,
) -> Result<Tensor> {
    let mut table = Vec::with_capacity(frames * dim);
    for pos in 0..frames {
        for i in 0..dim {
            let angle = pos as f32 / 10000f32.powf((2 * (i / 2)) as f32 / dim as f32);
            table.push(if i % 2 == 0 { angle.sin() } else { angle.cos() });
        }
    }
    Tensor::from_vec(table, (frames, dim), device)
}

// ── DeepTransformer ─────────────────────────────────────────────────────────

/// Conv front-end + linear projection + sinusoidal positions + deep
/// bidirectional encoder. The architecture trained under the warmup
/// schedule.
pub struct DeepTransformer {
    frontend: ConvFrontend,
    proj: Linear,
    encoder: Vec<EncoderLayer>,
    fc: Linear,
}

impl DeepTransformer {
    pub fn new(feat_dim: usize, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let frontend = ConvFrontend::new(vb.pp("frontend"))?;
        let proj = linear(
            frontend.out_dim(feat_dim),
            DEEP_TRANSFORMER_DIM,
            vb.pp("proj"),
        )?;
        let mut encoder = Vec::with_capacity(DEEP_TRANSFORMER_LAYERS);
        for i in 0..DEEP_TRANSFORMER_LAYERS {
            encoder.push(EncoderLayer::new(
                DEEP_TRANSFORMER_DIM,
                DEEP_TRANSFORMER_HEADS,
                vb.pp(format!("encoder{i}")),
            )?);
        }
        let fc = linear(DEEP_TRANSFORMER_DIM, num_classes, vb.pp("fc"))?;
        Ok(Self {
            frontend,
            proj,
            encoder,
            fc,
        })
    }
}

impl AcousticModel for DeepTransformer {
    fn forward(&self, features: &Tensor, input_lengths: &[usize]) -> Result<(Tensor, Vec<usize>)> {
        let x = self.frontend.forward(features)?;
        let x = self.proj.forward(&x)?;

        let (_, t, d) = x.dims3()?;
        let pe = sinusoidal_positions(t, d, x.device())?.to_dtype(DType::F32)?;
        let mut x = x.broadcast_add(&pe.unsqueeze(0)?)?;

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
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn sinusoidal_table_shape_and_range() {
        let pe = sinusoidal_positions(7, 8, &Device::Cpu).unwrap();
        assert_eq!(pe.dims(), &[7, 8]);
        let vals = pe.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(vals.iter().all(|v| v.abs() <= 1.0 + 1e-6));
        // Position 0 is sin(0)/cos(0) interleaved.
        assert_eq!(vals[0], 0.0);
        assert_eq!(vals[1], 1.0);
    }

    #[test]
    fn encoder_layer_preserves_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let layer = EncoderLayer::new(16, 4, vb).unwrap();

        let x = Tensor::zeros((2, 5, 16), DType::F32, &device).unwrap();
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.dims(), x.dims());
    }
}
