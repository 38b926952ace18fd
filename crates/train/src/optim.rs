//! Gradient-descent optimizers with externalisable state.
//!
//! The stock candle optimizers keep their moment buffers private, which
//! makes a bit-exact save/resume impossible; these implementations expose
//! every buffer as a flat `name → Tensor` map the checkpoint store can
//! bundle. State keys are indexed by the position of each parameter in the
//! variable list, so callers must build that list in a deterministic order
//! (see [`trainable_vars`]).

use std::collections::HashMap;

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use candle_nn::VarMap;

/// Shared contract of every optimizer in the workspace, scheduler wrappers
/// included. `step` consumes the gradients of one backward pass; `state`
/// and `load_state` round-trip every buffer needed to resume bit-for-bit.
pub trait Optimizer {
    fn step(&mut self, grads: &GradStore) -> Result<()>;
    fn learning_rate(&self) -> f64;
    fn set_learning_rate(&mut self, lr: f64);
    fn state(&self) -> Result<HashMap<String, Tensor>>;
    fn load_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()>;
}

/// Trainable variables of a `VarMap` in deterministic (name) order.
///
/// `VarMap` iteration order is arbitrary; optimizer state buffers are keyed
/// by index, so the order must be reproducible across processes for resume
/// to restore the right buffer onto the right parameter.
pub fn trainable_vars(varmap: &VarMap) -> Vec<Var> {
    let data = varmap.data().lock().unwrap();
    let mut named: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    named.sort_by(|a, b| a.0.cmp(&b.0));
    named.into_iter().map(|(_, var)| var).collect()
}

fn scalar_u32(value: usize, device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_vec(vec![value as u32], (1,), device)?)
}

fn scalar_f64(value: f64, device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_vec(vec![value], (1,), device)?)
}

fn read_u32(state: &HashMap<String, Tensor>, key: &str) -> Result<usize> {
    let t = state.get(key).with_context(|| format!("missing {key}"))?;
    Ok(t.to_vec1::<u32>().with_context(|| format!("decode {key}"))?[0] as usize)
}

fn read_f64(state: &HashMap<String, Tensor>, key: &str) -> Result<f64> {
    let t = state.get(key).with_context(|| format!("missing {key}"))?;
    Ok(t.to_dtype(candle_core::DType::F64)?
        .to_vec1::<f64>()
        .with_context(|| format!("decode {key}"))?[0])
}

fn read_buffer(
    state: &HashMap<String, Tensor>,
    key: &str,
    like: &Tensor,
) -> Result<Tensor> {
    let t = state.get(key).with_context(|| format!("missing {key}"))?;
    if t.shape() != like.shape() {
        anyhow::bail!(
            "{key}: shape {:?} does not match parameter {:?}",
            t.dims(),
            like.dims()
        );
    }
    Ok(t.clone())
}

// ── Adam ────────────────────────────────────────────────────────────────────

/// Hyper-parameters for [`Adam`].
#[derive(Debug, Clone, Copy)]
pub struct ParamsAdam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for ParamsAdam {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.98,
            eps: 1e-9,
        }
    }
}

/// Adam with bias correction. The reference configuration for the
/// transformer architectures: β = (0.9, 0.98), ε = 1e-9.
pub struct Adam {
    vars: Vec<Var>,
    m: Vec<Tensor>,
    v: Vec<Tensor>,
    params: ParamsAdam,
    step_t: usize,
    device: Device,
}

impl Adam {
    pub fn new(vars: Vec<Var>, params: ParamsAdam) -> Result<Self> {
        let device = vars
            .first()
            .map(|v| v.device().clone())
            .unwrap_or(Device::Cpu);
        let m = vars
            .iter()
            .map(|v| v.as_tensor().zeros_like())
            .collect::<candle_core::Result<Vec<_>>>()?;
        let v_ = vars
            .iter()
            .map(|v| v.as_tensor().zeros_like())
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            vars,
            m,
            v: v_,
            params,
            step_t: 0,
            device,
        })
    }

    /// Number of applied steps since construction (or resume).
    pub fn step_count(&self) -> usize {
        self.step_t
    }
}

impl Optimizer for Adam {
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let bc1 = 1.0 - self.params.beta1.powi(self.step_t as i32);
        let bc2 = 1.0 - self.params.beta2.powi(self.step_t as i32);
        for (i, var) in self.vars.iter().enumerate() {
            let theta = var.as_tensor();
            let Some(g) = grads.get(theta) else { continue };
            let m = ((&self.m[i] * self.params.beta1)? + (g * (1.0 - self.params.beta1))?)?;
            let v = ((&self.v[i] * self.params.beta2)? + (g.sqr()? * (1.0 - self.params.beta2))?)?;
            let m_hat = (&m / bc1)?;
            let v_hat = (&v / bc2)?;
            let denom = (v_hat.sqrt()? + self.params.eps)?;
            let delta = ((m_hat / denom)? * self.params.lr)?;
            var.set(&theta.sub(&delta)?)?;
            self.m[i] = m;
            self.v[i] = v;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    fn state(&self) -> Result<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        state.insert("adam.step".to_string(), scalar_u32(self.step_t, &self.device)?);
        state.insert("adam.lr".to_string(), scalar_f64(self.params.lr, &self.device)?);
        for (i, (m, v)) in self.m.iter().zip(&self.v).enumerate() {
            state.insert(format!("adam.m.{i}"), m.clone());
            state.insert(format!("adam.v.{i}"), v.clone());
        }
        Ok(state)
    }

    fn load_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        self.step_t = read_u32(state, "adam.step")?;
        self.params.lr = read_f64(state, "adam.lr")?;
        for i in 0..self.vars.len() {
            let theta = self.vars[i].as_tensor();
            self.m[i] = read_buffer(state, &format!("adam.m.{i}"), theta)?;
            self.v[i] = read_buffer(state, &format!("adam.v.{i}"), theta)?;
        }
        Ok(())
    }
}

// ── SGD ─────────────────────────────────────────────────────────────────────

/// SGD with Nesterov momentum. The fixed-rate optimizer for the
/// non-transformer architectures (lr 0.01, momentum 0.9).
pub struct Sgd {
    vars: Vec<Var>,
    velocity: Vec<Tensor>,
    lr: f64,
    momentum: f64,
    device: Device,
}

impl Sgd {
    pub fn new(vars: Vec<Var>, lr: f64, momentum: f64) -> Result<Self> {
        let device = vars
            .first()
            .map(|v| v.device().clone())
            .unwrap_or(Device::Cpu);
        let velocity = vars
            .iter()
            .map(|v| v.as_tensor().zeros_like())
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            vars,
            velocity,
            lr,
            momentum,
            device,
        })
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        for (i, var) in self.vars.iter().enumerate() {
            let theta = var.as_tensor();
            let Some(g) = grads.get(theta) else { continue };
            let v = ((&self.velocity[i] * self.momentum)? + g)?;
            // Nesterov: look ahead along the updated velocity.
            let direction = (g + (&v * self.momentum)?)?;
            var.set(&theta.sub(&(direction * self.lr)?)?)?;
            self.velocity[i] = v;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn state(&self) -> Result<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        state.insert("sgd.lr".to_string(), scalar_f64(self.lr, &self.device)?);
        for (i, v) in self.velocity.iter().enumerate() {
            state.insert(format!("sgd.v.{i}"), v.clone());
        }
        Ok(state)
    }

    fn load_state(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        self.lr = read_f64(state, "sgd.lr")?;
        for i in 0..self.vars.len() {
            let theta = self.vars[i].as_tensor();
            self.velocity[i] = read_buffer(state, &format!("sgd.v.{i}"), theta)?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn quadratic_grads(var: &Var) -> GradStore {
        // loss = ½‖x‖² → ∇ = x
        let loss = (var.as_tensor().sqr().unwrap() * 0.5)
            .unwrap()
            .sum_all()
            .unwrap();
        loss.backward().unwrap()
    }

    fn values(var: &Var) -> Vec<f32> {
        var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn adam_descends_a_quadratic() {
        let var = Var::new(vec![5.0f32, -3.0], &Device::Cpu).unwrap();
        let mut adam = Adam::new(vec![var.clone()], ParamsAdam::default()).unwrap();
        for _ in 0..200 {
            let grads = quadratic_grads(&var);
            adam.step(&grads).unwrap();
        }
        let v = values(&var);
        assert!(v[0].abs() < 5.0 && v[1].abs() < 3.0, "did not descend: {v:?}");
        assert_eq!(adam.step_count(), 200);
    }

    #[test]
    fn adam_first_step_is_lr_sized() {
        // Bias correction makes the first update ≈ lr · sign(g) regardless of
        // gradient magnitude.
        let var = Var::new(vec![1000.0f32], &Device::Cpu).unwrap();
        let mut adam = Adam::new(
            vec![var.clone()],
            ParamsAdam {
                lr: 0.1,
                ..Default::default()
            },
        )
        .unwrap();
        let grads = quadratic_grads(&var);
        adam.step(&grads).unwrap();
        let moved = 1000.0 - values(&var)[0];
        assert!((moved - 0.1).abs() < 1e-3, "moved {moved}");
    }

    #[test]
    fn sgd_descends_a_quadratic() {
        let var = Var::new(vec![5.0f32], &Device::Cpu).unwrap();
        let mut sgd = Sgd::new(vec![var.clone()], 0.01, 0.9).unwrap();
        for _ in 0..50 {
            let grads = quadratic_grads(&var);
            sgd.step(&grads).unwrap();
        }
        assert!(values(&var)[0].abs() < 5.0);
    }

    #[test]
    fn adam_state_round_trip_is_exact() {
        let var_a = Var::new(vec![2.0f32, -1.0], &Device::Cpu).unwrap();
        let mut a = Adam::new(vec![var_a.clone()], ParamsAdam::default()).unwrap();
        for _ in 0..3 {
            a.step(&quadratic_grads(&var_a)).unwrap();
        }
        let snapshot = a.state().unwrap();

        // Fresh optimizer over a fresh parameter copy, restored from the
        // snapshot; both must evolve identically from here on.
        let var_b = Var::new(values(&var_a), &Device::Cpu).unwrap();
        let mut b = Adam::new(vec![var_b.clone()], ParamsAdam::default()).unwrap();
        b.load_state(&snapshot).unwrap();
        assert_eq!(b.step_count(), 3);

        a.step(&quadratic_grads(&var_a)).unwrap();
        b.step(&quadratic_grads(&var_b)).unwrap();
        assert_eq!(values(&var_a), values(&var_b));
    }

    #[test]
    fn load_state_rejects_shape_mismatch() {
        let var = Var::new(vec![1.0f32, 2.0], &Device::Cpu).unwrap();
        let mut adam = Adam::new(vec![var], ParamsAdam::default()).unwrap();
        let mut state = adam.state().unwrap();
        state.insert(
            "adam.m.0".to_string(),
            Tensor::zeros((3,), candle_core::DType::F32, &Device::Cpu).unwrap(),
        );
        assert!(adam.load_state(&state).is_err());
    }

    #[test]
    fn missing_state_key_is_an_error() {
        let var = Var::new(vec![1.0f32], &Device::Cpu).unwrap();
        let mut adam = Adam::new(vec![var], ParamsAdam::default()).unwrap();
        assert!(adam.load_state(&HashMap::new()).is_err());
    }
}
