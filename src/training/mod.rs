//! # GLiNER training
//!
//! Supervised training of a `GlinerModel` from annotated examples:
//! - a type vocabulary is sampled for every example of every batch (positive types, negative types
//!   drawn from the rest of the batch, shuffling and random dropping),
//! - AdamW with separate learning rates for the token representation and the other layers,
//!   optionally freezing the token representation,
//! - cosine learning rate schedule with linear warmup,
//! - NaN losses and failing steps are logged and skipped,
//! - periodic evaluation and checkpointing into `log_dir/model_{step}`.
//!
//! ```no_run
//! use gliner::gliner::{load_examples, GlinerConfig};
//! use gliner::pipelines::gliner::GlinerBuilder;
//! use gliner::training::{Trainer, TrainingConfig};
//! use gliner::Config;
//! # fn main() -> anyhow::Result<()> {
//! let config = GlinerConfig::from_file("config.json")?;
//! let training_config = TrainingConfig::from_file("config.json")?;
//! let model = GlinerBuilder::backbone(config, "path/to/deberta-v3-small").create_model()?;
//! let train_data = load_examples(&training_config.train_data)?;
//! let mut trainer = Trainer::new(model, training_config)?;
//! let summary = trainer.fit(&train_data, None)?;
//! # Ok(())
//! # }
//! ```

mod scheduler;
mod trainer;

pub use scheduler::CosineWithWarmup;
pub use trainer::{StepOutcome, Trainer, TrainingConfig, TrainingSummary};
