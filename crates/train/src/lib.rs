//! # asr-train — Training Orchestration
//!
//! The training core for CTC acoustic models:
//!
//! * **[`EpochController`]** / **[`BatchTrainer`]** — the epoch/batch loop:
//!   forward, CTC loss, NaN guard, backward, gradient clipping, optimizer
//!   step, windowed loss reporting, per-epoch evaluation and checkpointing.
//! * **[`CtcLoss`]** — log-space CTC with sum reduction and the
//!   zero-infinity policy; recoverable failures are [`LossOutcome::Skip`]
//!   values, never unwinding.
//! * **[`TransformerOptimizer`]** — warmup / inverse-square-root schedule
//!   wrapping a base optimizer by composition.
//! * **[`Adam`]** / **[`Sgd`]** — optimizers with externalisable state.
//! * **[`checkpoint`]** — atomic `{model, optimizer}` bundles keyed by
//!   (model kind, absolute epoch).
//! * **[`evaluate`]** / **[`EvalHarness`]** — mutation-free accuracy
//!   passes.

pub mod checkpoint;
pub mod ctc;
pub mod eval;
pub mod optim;
pub mod scheduler;
pub mod trainer;

pub use ctc::{Criterion, CtcLoss, LossOutcome, SkipReason};
pub use eval::{evaluate, EvalHarness};
pub use optim::{trainable_vars, Adam, Optimizer, ParamsAdam, Sgd};
pub use scheduler::TransformerOptimizer;
pub use trainer::{
    clip_grad_norm, grad_norm, BatchTrainer, EpochController, EpochSummary, RunningLoss,
};
