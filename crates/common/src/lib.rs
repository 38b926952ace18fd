//! # asr-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`ModelKind`]** / **[`TrainingConfig`]** — run configuration
//!   (serialised as JSON).
//! * **[`Lexicon`]** — character symbol table with the CTC blank at id 0.
//! * **[`SpeechDataset`]** / **[`PrefetchLoader`]** — feature loading &
//!   batching.
//! * **[`Batch`]** / **[`BatchSource`]** — the unit of work and the stream
//!   contract the training loop consumes.

pub mod config;
pub mod data;

pub use config::{set_deterministic, ModelKind, TrainingConfig};
pub use data::{
    write_feature_file, Batch, BatchSource, DatasetSource, FeatureFile, Lexicon, PrefetchLoader,
    SpeechDataset, BLANK,
};
