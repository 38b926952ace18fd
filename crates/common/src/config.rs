//! Run configuration for CTC training.
//!
//! Serialised as JSON so a run can be reproduced from a config file. Every
//! tunable has a default matching the reference hyper-parameters; missing
//! fields in an old JSON fall back via `#[serde(default)]`.

use std::fmt;
use std::str::FromStr;

use candle_core::Device;
use serde::{Deserialize, Serialize};

/// The fixed set of acoustic architectures this trainer knows how to build.
///
/// Parsing an unknown name is an error; there is no silent fallback to a
/// default architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    DeepSpeech,
    DeepSpeechTransformer,
    DeepTransformer,
    GatedCnn,
}

impl ModelKind {
    /// All kinds, for help text and validation messages.
    pub const ALL: [ModelKind; 4] = [
        ModelKind::DeepSpeech,
        ModelKind::DeepSpeechTransformer,
        ModelKind::DeepTransformer,
        ModelKind::GatedCnn,
    ];

    /// Name used in checkpoint directory paths (`checkpoints_<name>`).
    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::DeepSpeech => "DeepSpeech",
            ModelKind::DeepSpeechTransformer => "DeepSpeechTransformer",
            ModelKind::DeepTransformer => "DeepTransformer",
            ModelKind::GatedCnn => "GatedCNN",
        }
    }

    /// Whether this kind trains under the warmup/inverse-square-root
    /// schedule. The others use fixed-rate Nesterov SGD.
    pub fn uses_warmup_schedule(&self) -> bool {
        matches!(self, ModelKind::DeepTransformer)
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        for kind in ModelKind::ALL {
            if s.eq_ignore_ascii_case(kind.name()) {
                return Ok(kind);
            }
        }
        let known: Vec<&str> = ModelKind::ALL.iter().map(|k| k.name()).collect();
        Err(format!(
            "unknown model kind {s:?}; expected one of {}",
            known.join(", ")
        ))
    }
}

/// All training hyper-parameters. Built once at process start and passed by
/// reference into every component; never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Architecture to train.
    pub model: ModelKind,
    /// Epoch to resume from; 0 starts fresh. A nonzero value requires the
    /// checkpoint written after epoch `from_epoch - 1` to exist.
    #[serde(default)]
    pub from_epoch: usize,
    /// Number of epochs to run (on top of `from_epoch`).
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    /// Apply time/frequency masking to training features.
    #[serde(default)]
    pub augment: bool,
    /// Scale factor `k` of the warmup schedule.
    #[serde(default = "default_scale_factor")]
    pub scale_factor: f64,
    /// Warmup step count of the schedule.
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,
    /// Global gradient-norm clip applied before every optimizer step.
    #[serde(default = "default_clip_norm")]
    pub clip_norm: f64,
    /// Training batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Batch size for the accuracy evaluation passes.
    #[serde(default = "default_eval_batch_size")]
    pub eval_batch_size: usize,
    /// Worker-thread degree of the prefetching loader.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Batches per windowed-loss progress report.
    #[serde(default = "default_log_window")]
    pub log_window: usize,
    /// Seed for device RNG and feature masking.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_epochs() -> usize {
    100
}
fn default_scale_factor() -> f64 {
    0.1
}
fn default_warmup_steps() -> usize {
    4000
}
fn default_clip_norm() -> f64 {
    1.0
}
fn default_batch_size() -> usize {
    8
}
fn default_eval_batch_size() -> usize {
    4
}
fn default_num_workers() -> usize {
    4
}
fn default_log_window() -> usize {
    1000
}
fn default_seed() -> u64 {
    123_456
}

impl TrainingConfig {
    /// Config with defaults for every tunable of the given architecture.
    pub fn new(model: ModelKind) -> Self {
        Self {
            model,
            from_epoch: 0,
            epochs: default_epochs(),
            augment: false,
            scale_factor: default_scale_factor(),
            warmup_steps: default_warmup_steps(),
            clip_norm: default_clip_norm(),
            batch_size: default_batch_size(),
            eval_batch_size: default_eval_batch_size(),
            num_workers: default_num_workers(),
            log_window: default_log_window(),
            seed: default_seed(),
        }
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

/// Seed the compute device's RNG. Idempotent; call once at process entry
/// before any parameter initialisation.
pub fn set_deterministic(device: &Device, seed: u64) -> candle_core::Result<()> {
    device.set_seed(seed)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_kind_parses_known_names() {
        assert_eq!("DeepSpeech".parse::<ModelKind>(), Ok(ModelKind::DeepSpeech));
        assert_eq!(
            "deeptransformer".parse::<ModelKind>(),
            Ok(ModelKind::DeepTransformer)
        );
        assert_eq!("GatedCNN".parse::<ModelKind>(), Ok(ModelKind::GatedCnn));
    }

    #[test]
    fn model_kind_rejects_unknown_names() {
        let err = "WaveNet".parse::<ModelKind>().unwrap_err();
        assert!(err.contains("unknown model kind"));
        assert!(err.contains("DeepSpeech"));
    }

    #[test]
    fn only_deep_transformer_is_scheduled() {
        assert!(ModelKind::DeepTransformer.uses_warmup_schedule());
        assert!(!ModelKind::DeepSpeech.uses_warmup_schedule());
        assert!(!ModelKind::DeepSpeechTransformer.uses_warmup_schedule());
        assert!(!ModelKind::GatedCnn.uses_warmup_schedule());
    }

    #[test]
    fn config_json_round_trip() {
        let config = TrainingConfig::new(ModelKind::DeepTransformer);
        let json = serde_json::to_string(&config).unwrap();
        let loaded: TrainingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.model, ModelKind::DeepTransformer);
        assert_eq!(loaded.warmup_steps, 4000);
        assert_eq!(loaded.scale_factor, 0.1);
        assert_eq!(loaded.log_window, 1000);
    }

    #[test]
    fn backward_compat_missing_fields() {
        let old_json = r#"{ "model": "DeepSpeech" }"#;
        let loaded: TrainingConfig = serde_json::from_str(old_json).unwrap();
        assert_eq!(loaded.from_epoch, 0);
        assert_eq!(loaded.epochs, 100);
        assert_eq!(loaded.clip_norm, 1.0);
        assert!(!loaded.augment);
    }
}
