//! Checkpoint store: one atomic bundle per (model kind, epoch).
//!
//! A checkpoint holds exactly two namespaces in a single safetensors file:
//! `model.*` (parameter mapping) and `optimizer.*` (optimizer state,
//! scheduler step counter included). Paths are deterministic —
//! `checkpoints_<ModelKind>/model<epoch>.pt` — and a save never overwrites
//! an existing file in place: it writes a sibling temp file and renames.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{safetensors, Device, Tensor};
use candle_nn::VarMap;

use asr_common::ModelKind;

use crate::optim::Optimizer;

const MODEL_PREFIX: &str = "model.";
const OPTIMIZER_PREFIX: &str = "optimizer.";

/// Directory holding every checkpoint of one architecture.
pub fn checkpoint_dir(root: &Path, kind: ModelKind) -> PathBuf {
    root.join(format!("checkpoints_{}", kind.name()))
}

/// Path of the checkpoint written after `epoch` completed.
pub fn checkpoint_path(root: &Path, kind: ModelKind, epoch: usize) -> PathBuf {
    checkpoint_dir(root, kind).join(format!("model{epoch}.pt"))
}

/// Persist `{ModelState, OptimizerState}` atomically at `path`.
pub fn save(path: &Path, model: &VarMap, optimizer: &dyn Optimizer) -> Result<()> {
    let mut bundle: HashMap<String, Tensor> = HashMap::new();
    {
        let data = model.data().lock().unwrap();
        for (name, var) in data.iter() {
            bundle.insert(format!("{MODEL_PREFIX}{name}"), var.as_tensor().clone());
        }
    }
    for (name, tensor) in optimizer.state()? {
        bundle.insert(format!("{OPTIMIZER_PREFIX}{name}"), tensor);
    }

    let parent = path
        .parent()
        .with_context(|| format!("checkpoint path {} has no parent", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("create checkpoint dir {}", parent.display()))?;

    let tmp = path.with_extension("pt.tmp");
    safetensors::save(&bundle, &tmp)
        .with_context(|| format!("write checkpoint {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("publish checkpoint {}", path.display()))?;
    Ok(())
}

/// Read a checkpoint back, split into its two namespaces. Any read or
/// format problem is an error; there is no fallback.
pub fn load(
    path: &Path,
    device: &Device,
) -> Result<(HashMap<String, Tensor>, HashMap<String, Tensor>)> {
    let tensors = safetensors::load(path, device)
        .with_context(|| format!("read checkpoint {}", path.display()))?;
    let mut model_state = HashMap::new();
    let mut optimizer_state = HashMap::new();
    for (key, tensor) in tensors {
        if let Some(name) = key.strip_prefix(MODEL_PREFIX) {
            model_state.insert(name.to_string(), tensor);
        } else if let Some(name) = key.strip_prefix(OPTIMIZER_PREFIX) {
            optimizer_state.insert(name.to_string(), tensor);
        } else {
            anyhow::bail!("checkpoint {}: unexpected key {key}", path.display());
        }
    }
    if model_state.is_empty() {
        anyhow::bail!("checkpoint {} holds no model parameters", path.display());
    }
    Ok((model_state, optimizer_state))
}

/// Install a loaded checkpoint into the live model and optimizer. Every
/// parameter the model owns must be present in `model_state`.
pub fn restore(
    model: &VarMap,
    optimizer: &mut dyn Optimizer,
    model_state: &HashMap<String, Tensor>,
    optimizer_state: &HashMap<String, Tensor>,
) -> Result<()> {
    {
        let data = model.data().lock().unwrap();
        for (name, var) in data.iter() {
            let tensor = model_state
                .get(name)
                .with_context(|| format!("checkpoint missing parameter {name}"))?;
            var.set(tensor)
                .with_context(|| format!("restore parameter {name}"))?;
        }
    }
    optimizer.load_state(optimizer_state)
}

// ── Tests ───────────────────────────────────────────────────────────────────
