//! Accuracy evaluation over held-out and training subsamples.
//!
//! Pure inference: no backward pass, no optimizer, no schedule advance.
//! Accuracy is token accuracy, `1 − total_edit_distance / total_ref_len`,
//! clamped to `[0, 1]`. A stream with no reference tokens scores 1.0.

use anyhow::Result;
use candle_core::Device;

use asr_common::BatchSource;
use asr_core::{AcousticModel, Decoder};

/// Score `model` over one pass of `batches`, decoding with `decoder`.
///
/// Mutates nothing: the model is borrowed shared and the optimizer never
/// enters the picture, so running this twice in a row yields identical
/// numbers.
pub fn evaluate(
    model: &dyn AcousticModel,
    batches: &mut dyn BatchSource,
    decoder: &dyn Decoder,
    device: &Device,
) -> Result<f32> {
    let mut edits = 0usize;
    let mut ref_len = 0usize;
    for batch in batches.batches() {
        let features = batch.features_tensor(device)?;
        let (log_probs, output_lengths) = model.forward(&features, &batch.input_lengths)?;
        let decoded = decoder.decode(&log_probs, &output_lengths)?;
        for (b, hypothesis) in decoded.iter().enumerate() {
            let reference = batch.labels_for(b);
            edits += levenshtein(hypothesis, reference);
            ref_len += reference.len();
        }
    }
    if ref_len == 0 {
        return Ok(1.0);
    }
    Ok((1.0 - edits as f32 / ref_len as f32).max(0.0))
}

/// The two accuracy passes run at every epoch boundary: a subsample of the
/// training set and a held-out set.
pub struct EvalHarness {
    train_source: Box<dyn BatchSource>,
    heldout_source: Box<dyn BatchSource>,
    decoder: Box<dyn Decoder>,
    device: Device,
}

impl EvalHarness {
    pub fn new(
        train_source: Box<dyn BatchSource>,
        heldout_source: Box<dyn BatchSource>,
        decoder: Box<dyn Decoder>,
        device: Device,
    ) -> Self {
        Self {
            train_source,
            heldout_source,
            decoder,
            device,
        }
    }

    /// `(train_accuracy, heldout_accuracy)`.
    pub fn run(&mut self, model: &dyn AcousticModel) -> Result<(f32, f32)> {
        let train = evaluate(
            model,
            self.train_source.as_mut(),
            self.decoder.as_ref(),
            &self.device,
        )?;
        let heldout = evaluate(
            model,
            self.heldout_source.as_mut(),
            self.decoder.as_ref(),
            &self.device,
        )?;
        Ok((train, heldout))
    }
}

/// Edit distance between two label sequences (two-row DP).
fn levenshtein(a: &[u32], b: &[u32]) -> usize {
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let sub = prev[j] + usize::from(ca != cb);
            curr[j + 1] = sub.min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Result as CandleResult, Tensor};

    use asr_common::Batch;
    use asr_core::GreedyDecoder;

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein(&[], &[]), 0);
        assert_eq!(levenshtein(&[1, 2, 3], &[1, 2, 3]), 0);
        assert_eq!(levenshtein(&[1, 2, 3], &[1, 3]), 1);
        assert_eq!(levenshtein(&[1, 2], &[2, 1]), 2);
        assert_eq!(levenshtein(&[], &[5, 5, 5]), 3);
    }

    /// Emits, for every frame `t`, a one-hot posterior on class
    /// `(t % (classes − 1)) + 1`; deterministic in the input shape alone.
    struct CyclingModel {
        classes: usize,
    }

    impl AcousticModel for CyclingModel {
        fn forward(
            &self,
            features: &Tensor,
            input_lengths: &[usize],
        ) -> CandleResult<(Tensor, Vec<usize>)> {
            let (b, t, _) = features.dims3()?;
            let mut data = vec![-20f32; b * t * self.classes];
            for bi in 0..b {
                for ti in 0..t {
                    let class = (ti % (self.classes - 1)) + 1;
                    data[(bi * t + ti) * self.classes + class] = 0.0;
                }
            }
            let lp = Tensor::from_vec(data, (b, t, self.classes), features.device())?;
            Ok((lp, input_lengths.to_vec()))
        }
    }

    struct VecSource(Vec<Batch>);

    impl BatchSource for VecSource {
        fn batches(&mut self) -> Box<dyn Iterator<Item = Batch> + '_> {
            Box::new(self.0.iter().cloned())
        }
    }

    fn batch(labels: Vec<u32>, frames: usize) -> Batch {
        Batch {
            features: vec![0.0; frames * 2],
            batch_size: 1,
            max_frames: frames,
            feat_dim: 2,
            input_lengths: vec![frames],
            target_lengths: vec![labels.len()],
            labels,
        }
    }

    #[test]
    fn perfect_hypotheses_score_one() {
        // CyclingModel over 3 classes emits 1 2 1 2 …; a 2-frame sample
        // decodes to [1, 2].
        let model = CyclingModel { classes: 3 };
        let mut source = VecSource(vec![batch(vec![1, 2], 2)]);
        let acc = evaluate(
            &model,
            &mut source,
            &GreedyDecoder::default(),
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(acc, 1.0);
    }

    #[test]
    fn evaluation_is_repeatable() {
        let model = CyclingModel { classes: 4 };
        let batches = vec![batch(vec![1, 2, 3], 5), batch(vec![2, 2], 3)];
        let first = evaluate(
            &model,
            &mut VecSource(batches.clone()),
            &GreedyDecoder::default(),
            &Device::Cpu,
        )
        .unwrap();
        let second = evaluate(
            &model,
            &mut VecSource(batches),
            &GreedyDecoder::default(),
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn empty_stream_scores_one() {
        let model = CyclingModel { classes: 3 };
        let mut source = VecSource(Vec::new());
        let acc = evaluate(
            &model,
            &mut source,
            &GreedyDecoder::default(),
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(acc, 1.0);
    }
}
