//! The training loop: per-batch step and epoch orchestration.
//!
//! [`BatchTrainer::step`] runs forward → loss → backward → clip → update
//! for one batch and absorbs every recoverable failure: a geometry skip
//! from the criterion and a non-finite loss both leave model and optimizer
//! untouched and surface as `None`. Anything else (device failure mid
//! forward/backward) propagates and aborts the run before a checkpoint for
//! the in-progress epoch can be written.
//!
//! [`EpochController::run`] drives whole epochs: it streams batches,
//! reports windowed mean losses, evaluates at every epoch boundary, and
//! persists a checkpoint under the *absolute* epoch index so resumed runs
//! report continuous epoch numbers.

use std::path::PathBuf;

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{Device, Var};
use candle_nn::VarMap;

use asr_common::{Batch, BatchSource, ModelKind};
use asr_core::AcousticModel;

use crate::checkpoint;
use crate::ctc::{Criterion, LossOutcome};
use crate::eval::EvalHarness;
use crate::optim::Optimizer;

// ── Gradient utilities ──────────────────────────────────────────────────────

/// Total L2 norm of gradients.
pub fn grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(total.sqrt().max(1e-12))
}

/// Clip gradients so their global L2 norm ≤ `max_norm`.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<()> {
    let norm = grad_norm(grads, vars)?;
    let scale = if norm > max_norm { max_norm / norm } else { 1.0 };
    if scale == 1.0 {
        return Ok(());
    }
    for var in vars {
        if let Some(g) = grads.remove(var.as_tensor()) {
            let clipped = g.affine(scale, 0.0)?;
            grads.insert(var.as_tensor(), clipped);
        }
    }
    Ok(())
}

// ── Windowed loss ───────────────────────────────────────────────────────────

/// Rolling sum over the batches of one reporting window. Skipped batches
/// never enter; the mean divides by the number of applied batches.
#[derive(Debug, Default)]
pub struct RunningLoss {
    sum: f64,
    applied: usize,
}

impl RunningLoss {
    pub fn add(&mut self, loss: f32) {
        self.sum += loss as f64;
        self.applied += 1;
    }

    pub fn mean(&self) -> Option<f64> {
        (self.applied > 0).then(|| self.sum / self.applied as f64)
    }

    pub fn applied(&self) -> usize {
        self.applied
    }

    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.applied = 0;
    }
}

// ── BatchTrainer ────────────────────────────────────────────────────────────

/// Runs one optimizer update per batch.
pub struct BatchTrainer {
    device: Device,
    vars: Vec<Var>,
    clip_norm: f64,
}

impl BatchTrainer {
    /// `vars` must be the same list (same order) the optimizer was built
    /// over.
    pub fn new(device: Device, vars: Vec<Var>, clip_norm: f64) -> Self {
        Self {
            device,
            vars,
            clip_norm,
        }
    }

    /// Train on one batch. Returns the applied per-sample loss, or `None`
    /// if the batch contributed no update (geometry skip or non-finite
    /// loss). Model and optimizer state mutate only on the `Some` path.
    pub fn step(
        &self,
        model: &dyn AcousticModel,
        batch: &Batch,
        optimizer: &mut dyn Optimizer,
        criterion: &dyn Criterion,
    ) -> Result<Option<f32>> {
        let features = batch.features_tensor(&self.device)?;
        let (log_probs, output_lengths) = model.forward(&features, &batch.input_lengths)?;

        let loss = match criterion.loss(&log_probs, batch, &output_lengths)? {
            LossOutcome::Loss(loss) => loss,
            LossOutcome::Skip(_) => return Ok(None),
        };

        let total = loss.to_scalar::<f32>()?;
        if !total.is_finite() {
            tracing::warn!(loss = total, "received nan loss; discarding batch");
            return Ok(None);
        }

        // Mean per sample; the summed value stays the reporting figure's
        // numerator.
        let mean = (loss / batch.batch_size as f64)?;
        let mut grads = mean.backward()?;
        clip_grad_norm(&mut grads, &self.vars, self.clip_norm)?;
        optimizer.step(&grads)?;

        Ok(Some(total / batch.batch_size as f32))
    }
}

// ── EpochController ─────────────────────────────────────────────────────────

/// What one epoch reported: windowed means, accuracies, checkpoint path.
#[derive(Debug)]
pub struct EpochSummary {
    pub epoch: usize,
    pub window_means: Vec<f64>,
    pub train_accuracy: f32,
    pub heldout_accuracy: f32,
    pub checkpoint: PathBuf,
}

/// Drives training across epochs.
pub struct EpochController {
    kind: ModelKind,
    log_window: usize,
    checkpoint_root: PathBuf,
    batch_trainer: BatchTrainer,
}

impl EpochController {
    pub fn new(
        kind: ModelKind,
        log_window: usize,
        checkpoint_root: PathBuf,
        batch_trainer: BatchTrainer,
    ) -> Self {
        Self {
            kind,
            log_window: log_window.max(1),
            checkpoint_root,
            batch_trainer,
        }
    }

    /// Run `total_epochs` epochs starting at absolute epoch `start_epoch`.
    ///
    /// Per epoch: stream every batch through the batch trainer, report the
    /// windowed mean loss every `log_window` batches (plus a final partial
    /// window), evaluate both subsamples, then persist the checkpoint for
    /// the absolute epoch index.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        model: &dyn AcousticModel,
        varmap: &VarMap,
        data: &mut dyn BatchSource,
        optimizer: &mut dyn Optimizer,
        criterion: &dyn Criterion,
        eval: &mut EvalHarness,
        total_epochs: usize,
        start_epoch: usize,
    ) -> Result<Vec<EpochSummary>> {
        let mut summaries = Vec::with_capacity(total_epochs);
        for offset in 0..total_epochs {
            let epoch = start_epoch + offset;
            let mut window = RunningLoss::default();
            let mut window_means = Vec::new();
            let mut processed = 0usize;

            for batch in data.batches() {
                if let Some(loss) =
                    self.batch_trainer
                        .step(model, &batch, optimizer, criterion)?
                {
                    window.add(loss);
                }
                processed += 1;
                if processed % self.log_window == 0 {
                    if let Some(mean) = window.mean() {
                        tracing::info!(epoch, batch = processed, loss = mean, "training loss");
                        window_means.push(mean);
                    }
                    window.reset();
                }
            }
            if let Some(mean) = window.mean() {
                tracing::info!(epoch, batch = processed, loss = mean, "training loss");
                window_means.push(mean);
            }

            let (train_accuracy, heldout_accuracy) = eval.run(model)?;
            tracing::info!(epoch, train_accuracy, heldout_accuracy, "epoch complete");

            let path = checkpoint::checkpoint_path(&self.checkpoint_root, self.kind, epoch);
            checkpoint::save(&path, varmap, optimizer)?;
            tracing::info!(epoch, checkpoint = %path.display(), "checkpoint written");

            summaries.push(EpochSummary {
                epoch,
                window_means,
                train_accuracy,
                heldout_accuracy,
                checkpoint: path,
            });
        }
        Ok(summaries)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
