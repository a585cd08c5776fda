//! # Ready-to-use GLiNER pipelines
//!
//! End-to-end pipelines built on top of the `gliner` model blocks. The following capabilities are available:
//!
//! #### 1. Zero-shot Named Entity Recognition
//! Extracts entities of arbitrary types, given as plain names at inference time. Raw text is split into
//! words (runs of word characters joined by hyphens or underscores, or single non-space characters) and the
//! returned offsets are character offsets into the input text.
//! ```no_run
//! # use tch::Device;
//! use gliner::pipelines::gliner::GlinerBuilder;
//! # fn main() -> anyhow::Result<()> {
//! let model = GlinerBuilder::local("path/to/gliner_model")
//!     .with_device(Device::cuda_if_available())
//!     .create_model()?;
//! let output = model.predict_entities(
//!     "Apple Inc. was founded by Steve Jobs.",
//!     &["person", "organization"],
//!     true,
//!     0.5,
//! )?;
//! # Ok(())
//! # }
//! ```
//! Output: \
//! `[ Entity { start: 0, end: 10, text: "Apple Inc.", label: "organization", .. }, Entity { start: 26, end: 36, text: "Steve Jobs", label: "person", .. } ]`
//!
//! #### 2. Relation Extraction
//! Scores every pair of the supplied entities (word indices, end inclusive) against the candidate relation types.
//! ```no_run
//! use gliner::pipelines::gliner::GlinerBuilder;
//! # fn main() -> anyhow::Result<()> {
//! let model = GlinerBuilder::local("path/to/gliner_relation_model").create_model()?;
//! let relations = model.predict_relations(
//!     "Steve Jobs founded Apple in Cupertino .",
//!     &[(0, 1), (3, 3), (5, 5)],
//!     &["founder of", "located in"],
//!     0.5,
//! )?;
//! # Ok(())
//! # }
//! ```
//!
//! #### 3. Evaluation
//! Micro precision, recall and F1 over exact matches (`GlinerModel::evaluate`), with a printable report
//! `P: xx.xx%\tR: xx.xx%\tF1: xx.xx%`.

pub mod checkpoint;
pub mod decoding;
pub mod evaluation;
pub mod gliner;
pub mod tokenizer;
