//! # asr-core — Acoustic Models
//!
//! Every network the trainer can build, plus best-path decoding:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`model`] | [`AcousticModel`] contract, [`build_model`], conv front-end |
//! | [`deepspeech`] | `DeepSpeech`, `DeepSpeechTransformer` |
//! | [`transformer`] | encoder attention/layers, `DeepTransformer` |
//! | [`gated_cnn`] | `GatedCnn` |
//! | [`decoder`] | [`Decoder`], [`GreedyDecoder`] |
//!
//! All compute goes through `candle-core`/`candle-nn`; models emit
//! log-softmax posteriors shaped `(batch, frames, classes)` with the blank
//! class at index 0.

pub mod decoder;
pub mod deepspeech;
pub mod gated_cnn;
pub mod model;
pub mod transformer;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use decoder::{Decoder, GreedyDecoder};
pub use deepspeech::{DeepSpeech, DeepSpeechTransformer};
pub use gated_cnn::GatedCnn;
pub use model::{build_model, AcousticModel, ConvFrontend};
pub use transformer::DeepTransformer;
