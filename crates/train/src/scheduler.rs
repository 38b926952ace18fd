//! Warmup / inverse-square-root learning-rate scheduling.
//!
//! [`TransformerOptimizer`] owns a base optimizer and re-exposes the same
//! [`Optimizer`] contract; every `step` computes the step-indexed rate and
//! writes it into the base optimizer before delegating the update. Keeping
//! the composition explicit (rather than poking a shared learning-rate
//! field) lets tests substitute the base optimizer freely.

use std::collections::HashMap;

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor};

use crate::optim::Optimizer;

/// The warmup-then-decay schedule:
///
/// `rate = scale_factor · min(step⁻⁰·⁵, step · warmup⁻¹·⁵)`
///
/// Rate rises linearly for the first `warmup_steps` steps, peaks where the
/// two branches meet, then falls as the inverse square root of the step
/// count. The step counter survives save/resume so a resumed run continues
/// the same curve instead of restarting warmup.
pub struct TransformerOptimizer<O: Optimizer> {
    inner: O,
    step_count: usize,
    scale_factor: f64,
    warmup_steps: usize,
}

impl<O: Optimizer> TransformerOptimizer<O> {
    pub fn new(inner: O, scale_factor: f64, warmup_steps: usize) -> Self {
        Self {
            inner,
            step_count: 0,
            scale_factor,
            warmup_steps,
        }
    }

    /// Rate the schedule assigns to step `step` (clamped to ≥ 1).
    pub fn rate_at(&self, step: usize) -> f64 {
        let s = step.max(1) as f64;
        let w = self.warmup_steps.max(1) as f64;
        self.scale_factor * f64::min(s.powf(-0.5), s * w.powf(-1.5))
    }

    /// Steps applied since construction or resume.
    pub fn step_count(&self) -> usize {
        self.step_count
    }

    pub fn inner(&self) -> &O {
        &self.inner
    }
}

impl<O: Optimizer> Optimizer for TransformerOptimizer<O> {
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_count += 1;
        let rate = self.rate_at(self.step_count);
        self.inner.set_learning_rate(rate);
        self.inner.step(grads)
    }

    fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    /// Takes effect until the next `step`, which recomputes the scheduled
    /// rate.
    fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr);
    }

    fn state(&self) -> Result<HashMap<String, Tensor>> {
        let mut state = self.inner.state()?;
        state.insert(
            "sched.step".to_string(),
            Tensor::from_vec(vec![self.step_count as u32], (1,), &Device::Cpu)?,
        );
        Ok(state)
    }

    fn load_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        let t = state.get("sched.step").context("missing sched.step")?;
        self.step_count = t.to_vec1::<u32>().context("decode sched.step")?[0] as usize;
        self.inner.load_state(state)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
