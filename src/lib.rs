//! # GLiNER: generalist span classification for entity recognition and relation extraction
//!
//! Rust implementation of GLiNER, built on `tch-rs` and the `rust-bert` transformer backbones.
//! Entity (or relation) types are given as plain names at inference time: they are serialized as a
//! prompt in front of the text and encoded together with it in a single transformer pass. Every
//! candidate span (or entity pair) is then scored against every type with a dot product, each
//! score being an independent probability after a sigmoid.
//!
//! The crate is organized as follows:
//! - `gliner`: model building blocks (prompt injection, span and pair representations, loss, collation)
//! - `pipelines`: ready-to-use inference (`GlinerModel`), decoding, evaluation and checkpoint loading
//! - `training`: AdamW training loop with cosine schedule and type sampling, used by the `gliner-train` binary
//!
//! # Quick Start
//!
//! ```no_run
//! use gliner::pipelines::gliner::GlinerBuilder;
//! # fn main() -> anyhow::Result<()> {
//! let model = GlinerBuilder::local("path/to/gliner_model").create_model()?;
//! let entities = model.predict_entities(
//!     "Apple Inc. was founded by Steve Jobs.",
//!     &["person", "organization"],
//!     true,
//!     0.5,
//! )?;
//! # Ok(())
//! # }
//! ```
//!
//! # Checkpoints
//!
//! A model directory holds `gliner_config.json`, the weights (`rust_model.ot` or `model.safetensors`) and the
//! backbone files (`encoder_config.json` and `spm.model` or `vocab.txt`). Weights converted from PyTorch keep
//! the original parameter names (e.g. `span_rep_layer.span_rep_layer.project_start.0.weight`). Single-file
//! legacy checkpoints (`gliner_base.pt`, `gliner_multi.pt`) are not supported and are reported as such.

pub mod common;
pub mod gliner;
pub mod pipelines;
pub mod training;

pub use common::{Config, GlinerError};
