//! Connectionist temporal classification loss.
//!
//! Log-space forward algorithm over candle ops, so autograd supplies the
//! gradients. Sum reduction across the batch. Two failure modes are values,
//! never panics or unwinding:
//!
//! * **zero-infinity** — a sample with no feasible alignment (target longer
//!   than its input, or repeats that cannot fit) contributes zero loss and
//!   zero gradient; the rest of the batch still trains.
//! * **[`LossOutcome::Skip`]** — malformed batch geometry (label ids outside
//!   the class range, length bookkeeping that does not add up, or a batch
//!   with no feasible sample at all) discards the whole batch.

use std::fmt;

use anyhow::Result;
use candle_core::{Device, IndexOp, Result as CandleResult, Tensor};

use asr_common::{Batch, BLANK};

/// Finite stand-in for log(0). Large enough that `exp` underflows cleanly,
/// small enough that sums of a few of these never overflow f32.
const LOG_ZERO: f32 = -1e10;

/// A per-sample negative log-likelihood at or above this is an alignment
/// the forward pass proved infeasible, not a real loss value.
const INFEASIBLE_CUTOFF: f32 = 1e9;

/// Why a batch contributed no update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Batch shape or label content is incompatible with the posteriors.
    Geometry(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Geometry(msg) => write!(f, "batch geometry: {msg}"),
        }
    }
}

/// Result of a loss computation: a differentiable scalar, or a reason the
/// batch must be discarded.
pub enum LossOutcome {
    Loss(Tensor),
    Skip(SkipReason),
}

/// The loss interface the batch trainer drives. Implementations must not
/// mutate any training state.
pub trait Criterion {
    /// `log_probs` is `(batch, frames, classes)` as produced by the model;
    /// `output_lengths` are the model's subsampled per-sample frame counts.
    fn loss(
        &self,
        log_probs: &Tensor,
        batch: &Batch,
        output_lengths: &[usize],
    ) -> Result<LossOutcome>;
}

/// CTC loss with sum reduction and the zero-infinity policy.
#[derive(Debug, Clone, Copy)]
pub struct CtcLoss {
    blank: u32,
}

impl Default for CtcLoss {
    fn default() -> Self {
        Self { blank: BLANK }
    }
}

impl CtcLoss {
    pub fn new(blank: u32) -> Self {
        Self { blank }
    }

    fn validate(
        &self,
        dims: (usize, usize, usize),
        batch: &Batch,
        output_lengths: &[usize],
    ) -> Option<SkipReason> {
        let (b, frames, classes) = dims;
        if b != batch.batch_size {
            return Some(SkipReason::Geometry(format!(
                "posterior batch {b} != data batch {}",
                batch.batch_size
            )));
        }
        if output_lengths.len() != b || batch.target_lengths.len() != b {
            return Some(SkipReason::Geometry("length vectors out of step".into()));
        }
        let total_targets: usize = batch.target_lengths.iter().sum();
        if batch.labels.len() != total_targets {
            return Some(SkipReason::Geometry(format!(
                "{} labels but target lengths sum to {total_targets}",
                batch.labels.len()
            )));
        }
        if let Some(&bad) = batch
            .labels
            .iter()
            .find(|&&l| l == self.blank || l as usize >= classes)
        {
            return Some(SkipReason::Geometry(format!(
                "label id {bad} outside class range 1..{classes}"
            )));
        }
        if let Some(&long) = output_lengths.iter().find(|&&l| l > frames) {
            return Some(SkipReason::Geometry(format!(
                "output length {long} exceeds {frames} posterior frames"
            )));
        }
        None
    }

    /// Forward algorithm for one sample. Returns the scalar negative
    /// log-likelihood, differentiable w.r.t. `log_probs`.
    fn sample_loss(
        &self,
        log_probs: &Tensor,
        sample: usize,
        frames: usize,
        labels: &[u32],
    ) -> CandleResult<Tensor> {
        let device = log_probs.device();
        let lp = log_probs.i(sample)?; // (frames, classes)

        // Extended label sequence: blanks interleaved around every target.
        let s = 2 * labels.len() + 1;
        let mut ext = Vec::with_capacity(s);
        for &l in labels {
            ext.push(self.blank);
            ext.push(l);
        }
        ext.push(self.blank);
        let ext_t = Tensor::from_vec(ext.clone(), (s,), device)?;

        // The s-2 transition is legal only onto a non-blank state that
        // differs from the state two back.
        let mut skip = vec![LOG_ZERO; s];
        for (i, mask) in skip.iter_mut().enumerate() {
            if i >= 2 && ext[i] != self.blank && ext[i] != ext[i - 2] {
                *mask = 0.0;
            }
        }
        let skip_mask = Tensor::from_vec(skip, (s,), device)?;

        // Only the first blank and the first label are reachable at t = 0.
        let mut init = vec![LOG_ZERO; s];
        init[0] = 0.0;
        if s > 1 {
            init[1] = 0.0;
        }
        let init_mask = Tensor::from_vec(init, (s,), device)?;

        let emit0 = lp.i(0)?.index_select(&ext_t, 0)?;
        let mut alpha = (emit0 + init_mask)?;

        for t in 1..frames {
            let emit = lp.i(t)?.index_select(&ext_t, 0)?;
            let prev1 = shift_states(&alpha, 1, device)?;
            let prev2 = (shift_states(&alpha, 2, device)? + &skip_mask)?;
            let merged = log_add(&log_add(&alpha, &prev1)?, &prev2)?;
            alpha = (merged + emit)?;
        }

        // Valid terminals: final blank, or final label.
        let tail = if s >= 2 {
            alpha.narrow(0, s - 2, 2)?
        } else {
            alpha
        };
        log_sum_exp(&tail)?.neg()
    }
}

impl Criterion for CtcLoss {
    fn loss(
        &self,
        log_probs: &Tensor,
        batch: &Batch,
        output_lengths: &[usize],
    ) -> Result<LossOutcome> {
        let dims = log_probs.dims3()?;
        if let Some(reason) = self.validate(dims, batch, output_lengths) {
            return Ok(LossOutcome::Skip(reason));
        }

        let mut total: Option<Tensor> = None;
        for i in 0..batch.batch_size {
            let frames = output_lengths[i];
            let labels = batch.labels_for(i);
            // Cheap infeasibility screen before building any graph.
            if frames == 0 || labels.len() > frames {
                continue;
            }
            let loss_i = self.sample_loss(log_probs, i, frames, labels)?;
            // Repeated labels can still make the alignment infeasible even
            // when the length screen passes; the forward pass then bottoms
            // out at the log-zero sentinel.
            if loss_i.to_scalar::<f32>()? >= INFEASIBLE_CUTOFF {
                continue;
            }
            total = Some(match total {
                None => loss_i,
                Some(prev) => (prev + loss_i)?,
            });
        }

        match total {
            Some(loss) => Ok(LossOutcome::Loss(loss)),
            None => Ok(LossOutcome::Skip(SkipReason::Geometry(
                "no feasible alignment in batch".into(),
            ))),
        }
    }
}

// ── Log-space helpers ───────────────────────────────────────────────────────

/// Elementwise log(exp(a) + exp(b)), stable around the log-zero sentinel.
fn log_add(a: &Tensor, b: &Tensor) -> CandleResult<Tensor> {
    let m = a.maximum(b)?;
    let sum = ((a - &m)?.exp()? + (b - &m)?.exp()?)?;
    &m + sum.log()?
}

/// log Σ exp over a rank-1 tensor, reduced to a scalar.
fn log_sum_exp(x: &Tensor) -> CandleResult<Tensor> {
    let m = x.max(0)?;
    let sum = x.broadcast_sub(&m)?.exp()?.sum(0)?;
    &m + sum.log()?
}

/// Shift state values toward higher indices by `n`, padding the front with
/// the log-zero sentinel.
fn shift_states(alpha: &Tensor, n: usize, device: &Device) -> CandleResult<Tensor> {
    let s = alpha.dim(0)?;
    if n >= s {
        return Tensor::full(LOG_ZERO, (s,), device);
    }
    let pad = Tensor::full(LOG_ZERO, (n,), device)?;
    let body = alpha.narrow(0, 0, s - n)?;
    Tensor::cat(&[&pad, &body], 0)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Batch of one sample with the given label sequence; feature content is
    /// irrelevant to the criterion.
    fn batch_for(labels: &[u32], frames: usize) -> Batch {
        Batch {
            features: vec![0.0; frames],
            batch_size: 1,
            max_frames: frames,
            feat_dim: 1,
            labels: labels.to_vec(),
            input_lengths: vec![frames],
            target_lengths: vec![labels.len()],
        }
    }

    /// `(1, frames, classes)` log-probs from per-frame probability rows.
    fn posteriors(rows: &[&[f32]]) -> Tensor {
        let classes = rows[0].len();
        let mut data = Vec::with_capacity(rows.len() * classes);
        for row in rows {
            for &p in *row {
                data.push(p.ln());
            }
        }
        Tensor::from_vec(data, (1, rows.len(), classes), &Device::Cpu).unwrap()
    }

    fn loss_value(outcome: LossOutcome) -> f32 {
        match outcome {
            LossOutcome::Loss(t) => t.to_scalar::<f32>().unwrap(),
            LossOutcome::Skip(reason) => panic!("unexpected skip: {reason}"),
        }
    }

    #[test]
    fn single_frame_single_label() {
        let ctc = CtcLoss::default();
        let lp = posteriors(&[&[0.25, 0.75]]);
        let batch = batch_for(&[1], 1);
        let loss = loss_value(ctc.loss(&lp, &batch, &[1]).unwrap());
        assert!((loss - (-0.75f32.ln())).abs() < 1e-5);
    }

    #[test]
    fn two_frames_one_label_matches_closed_form() {
        let ctc = CtcLoss::default();
        // Paths: (blank, l), (l, blank), (l, l)
        // p = .6·.4 + .4·.6 + .4·.4 = .64
        let lp = posteriors(&[&[0.6, 0.4], &[0.6, 0.4]]);
        let batch = batch_for(&[1], 2);
        let loss = loss_value(ctc.loss(&lp, &batch, &[2]).unwrap());
        assert!((loss - (-0.64f32.ln())).abs() < 1e-5);
    }

    #[test]
    fn sum_reduction_over_batch() {
        let ctc = CtcLoss::default();
        let single = posteriors(&[&[0.6, 0.4], &[0.6, 0.4]]);
        let single_loss = loss_value(ctc.loss(&single, &batch_for(&[1], 2), &[2]).unwrap());

        let mut data = single.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        data.extend(data.clone());
        let pair = Tensor::from_vec(data, (2, 2, 2), &Device::Cpu).unwrap();
        let batch = Batch {
            features: vec![0.0; 4],
            batch_size: 2,
            max_frames: 2,
            feat_dim: 1,
            labels: vec![1, 1],
            input_lengths: vec![2, 2],
            target_lengths: vec![1, 1],
        };
        let pair_loss = loss_value(ctc.loss(&pair, &batch, &[2, 2]).unwrap());
        assert!((pair_loss - 2.0 * single_loss).abs() < 1e-4);
    }

    #[test]
    fn overlong_target_is_zero_infinity() {
        let ctc = CtcLoss::default();
        // Sample 0 is feasible, sample 1's target exceeds its input length;
        // the batch loss must equal the feasible sample alone.
        let row: &[f32] = &[0.6, 0.4];
        let mut data = Vec::new();
        for _ in 0..4 {
            for &p in row {
                data.push(p.ln());
            }
        }
        let lp = Tensor::from_vec(data, (2, 2, 2), &Device::Cpu).unwrap();
        let batch = Batch {
            features: vec![0.0; 4],
            batch_size: 2,
            max_frames: 2,
            feat_dim: 1,
            labels: vec![1, 1, 1, 1], // sample 1 wants 3 labels in 2 frames
            input_lengths: vec![2, 2],
            target_lengths: vec![1, 3],
        };
        let loss = loss_value(ctc.loss(&lp, &batch, &[2, 2]).unwrap());

        let single = posteriors(&[&[0.6, 0.4], &[0.6, 0.4]]);
        let expected = loss_value(ctc.loss(&single, &batch_for(&[1], 2), &[2]).unwrap());
        assert!((loss - expected).abs() < 1e-5);
    }

    #[test]
    fn fully_infeasible_batch_skips() {
        let ctc = CtcLoss::default();
        let lp = posteriors(&[&[0.6, 0.4]]);
        let batch = batch_for(&[1, 1], 1); // two labels, one frame
        match ctc.loss(&lp, &batch, &[1]).unwrap() {
            LossOutcome::Skip(SkipReason::Geometry(_)) => {}
            LossOutcome::Loss(_) => panic!("expected skip"),
        }
    }

    #[test]
    fn repeated_label_needs_separating_frame() {
        let ctc = CtcLoss::default();
        // "11" needs at least 3 frames (l, blank, l); 2 frames is infeasible
        // even though the length screen passes.
        let lp = posteriors(&[&[0.5, 0.5], &[0.5, 0.5]]);
        let batch = batch_for(&[1, 1], 2);
        match ctc.loss(&lp, &batch, &[2]).unwrap() {
            LossOutcome::Skip(SkipReason::Geometry(_)) => {}
            LossOutcome::Loss(_) => panic!("expected skip"),
        }
    }

    #[test]
    fn out_of_range_label_skips() {
        let ctc = CtcLoss::default();
        let lp = posteriors(&[&[0.6, 0.4]]);
        let mut batch = batch_for(&[1], 1);
        batch.labels = vec![7];
        match ctc.loss(&lp, &batch, &[1]).unwrap() {
            LossOutcome::Skip(SkipReason::Geometry(msg)) => {
                assert!(msg.contains("label id 7"));
            }
            LossOutcome::Loss(_) => panic!("expected skip"),
        }
    }

    #[test]
    fn blank_label_in_targets_skips() {
        let ctc = CtcLoss::default();
        let lp = posteriors(&[&[0.6, 0.4]]);
        let mut batch = batch_for(&[1], 1);
        batch.labels = vec![0];
        assert!(matches!(
            ctc.loss(&lp, &batch, &[1]).unwrap(),
            LossOutcome::Skip(_)
        ));
    }

    #[test]
    fn loss_is_differentiable() {
        use candle_core::Var;

        let ctc = CtcLoss::default();
        let var = Var::new(vec![0.1f32, -0.1, 0.2, -0.2], &Device::Cpu).unwrap();
        let logits = var.as_tensor().reshape((1, 2, 2)).unwrap();
        let lp = candle_nn::ops::log_softmax(&logits, 2).unwrap();
        let batch = batch_for(&[1], 2);
        let loss = match ctc.loss(&lp, &batch, &[2]).unwrap() {
            LossOutcome::Loss(l) => l,
            LossOutcome::Skip(r) => panic!("{r}"),
        };
        let grads = loss.backward().unwrap();
        let g = grads.get(var.as_tensor()).expect("gradient for logits");
        let g = g.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(g.iter().any(|v| v.abs() > 0.0), "gradient is all zero");
    }
}
