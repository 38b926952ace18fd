//! Best-path decoding of CTC posteriors.

use candle_core::{Result, Tensor, D};

use asr_common::BLANK;

/// Turns model posteriors into label sequences for accuracy scoring.
/// Implementations hold no state across calls.
pub trait Decoder {
    /// `log_probs` is `(batch, frames, classes)`; each sample is decoded
    /// over its first `output_lengths[b]` frames only.
    fn decode(&self, log_probs: &Tensor, output_lengths: &[usize]) -> Result<Vec<Vec<u32>>>;
}

/// Greedy best-path decoder: per-frame argmax, collapse consecutive
/// repeats, strip blanks.
#[derive(Debug, Clone, Copy)]
pub struct GreedyDecoder {
    blank: u32,
}

impl Default for GreedyDecoder {
    fn default() -> Self {
        Self { blank: BLANK }
    }
}

impl GreedyDecoder {
    pub fn new(blank: u32) -> Self {
        Self { blank }
    }

    fn collapse(&self, frames: &[u32]) -> Vec<u32> {
        let mut out = Vec::new();
        let mut prev = None;
        for &id in frames {
            if Some(id) != prev && id != self.blank {
                out.push(id);
            }
            prev = Some(id);
        }
        out
    }
}

impl Decoder for GreedyDecoder {
    fn decode(&self, log_probs: &Tensor, output_lengths: &[usize]) -> Result<Vec<Vec<u32>>> {
        let best = log_probs.argmax(D::Minus1)?; // (batch, frames) u32
        let best = best.to_vec2::<u32>()?;
        let mut out = Vec::with_capacity(best.len());
        for (b, frames) in best.iter().enumerate() {
            let len = output_lengths.get(b).copied().unwrap_or(frames.len());
            let len = len.min(frames.len());
            out.push(self.collapse(&frames[..len]));
        }
        Ok(out)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
