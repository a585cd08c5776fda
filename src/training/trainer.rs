// Copyright 2024 The GLiNER Rust Authors
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tch::nn::{self, OptimizerConfig};

use crate::gliner::{Example, ENCODER_GROUP, HEAD_GROUP};
use crate::pipelines::gliner::GlinerModel;
use crate::training::scheduler::CosineWithWarmup;
use crate::{Config, GlinerError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// # Training configuration
/// Optimization and evaluation parameters. May share its file with the `GlinerConfig`.
pub struct TrainingConfig {
    #[serde(default = "default_lr_encoder")]
    pub lr_encoder: f64,
    #[serde(default = "default_lr_others")]
    pub lr_others: f64,
    #[serde(default = "default_num_steps")]
    pub num_steps: usize,
    #[serde(default = "default_train_batch_size")]
    pub train_batch_size: usize,
    #[serde(default = "default_eval_every")]
    pub eval_every: usize,
    #[serde(default = "default_warmup_ratio")]
    pub warmup_ratio: f64,
    /// Training examples (`.json` or `.jsonl`)
    pub train_data: PathBuf,
    #[serde(default)]
    pub eval_data: Option<PathBuf>,
    /// Checkpoint to resume from (`"none"` for a fresh model)
    #[serde(default)]
    pub prev_path: Option<PathBuf>,
    /// Converted backbone used for a fresh model
    #[serde(default)]
    pub encoder_dir: Option<PathBuf>,
    /// Train from a randomly initialized backbone when `encoder_dir` holds no weights
    #[serde(default)]
    pub random_encoder_init: bool,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub freeze_token_rep: bool,
    #[serde(default = "default_eval_threshold")]
    pub eval_threshold: f64,
    #[serde(default = "default_eval_batch_size")]
    pub eval_batch_size: usize,
    #[serde(default = "default_eval_top_k")]
    pub eval_top_k: usize,
    #[serde(default = "default_true")]
    pub eval_flat_ner: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_lr_encoder() -> f64 {
    1e-5
}

fn default_lr_others() -> f64 {
    5e-5
}

fn default_num_steps() -> usize {
    1000
}

fn default_train_batch_size() -> usize {
    8
}

fn default_eval_every() -> usize {
    100
}

fn default_warmup_ratio() -> f64 {
    0.1
}

fn default_eval_threshold() -> f64 {
    0.5
}

fn default_eval_batch_size() -> usize {
    12
}

fn default_eval_top_k() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_seed() -> u64 {
    42
}

impl Config for TrainingConfig {}

impl TrainingConfig {
    pub fn new<P: Into<PathBuf>>(train_data: P) -> TrainingConfig {
        TrainingConfig {
            lr_encoder: default_lr_encoder(),
            lr_others: default_lr_others(),
            num_steps: default_num_steps(),
            train_batch_size: default_train_batch_size(),
            eval_every: default_eval_every(),
            warmup_ratio: default_warmup_ratio(),
            train_data: train_data.into(),
            eval_data: None,
            prev_path: None,
            encoder_dir: None,
            random_encoder_init: false,
            log_dir: None,
            freeze_token_rep: false,
            eval_threshold: default_eval_threshold(),
            eval_batch_size: default_eval_batch_size(),
            eval_top_k: default_eval_top_k(),
            eval_flat_ner: true,
            seed: default_seed(),
        }
    }

    /// Checkpoint to resume from, ignoring the `"none"` placeholder.
    pub fn previous_checkpoint(&self) -> Option<&Path> {
        self.prev_path
            .as_deref()
            .filter(|path| !path.as_os_str().eq_ignore_ascii_case("none"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("logs"))
    }

    pub fn validate(&self) -> Result<(), GlinerError> {
        if self.train_batch_size == 0 || self.eval_batch_size == 0 {
            return Err(GlinerError::InvalidConfigurationError(
                "batch sizes must be positive".to_string(),
            ));
        }
        if self.eval_every == 0 {
            return Err(GlinerError::InvalidConfigurationError(
                "eval_every must be positive".to_string(),
            ));
        }
        if self.eval_top_k == 0 {
            return Err(GlinerError::InvalidConfigurationError(
                "eval_top_k must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of a single optimization step
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Updated { loss: f64 },
    /// The loss was NaN, no update was applied
    SkippedNan,
    /// Collation or forward pass failed, no update was applied
    Failed(String),
}

/// Counts of step outcomes over a training run
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrainingSummary {
    pub updated: usize,
    pub skipped_nan: usize,
    pub failed: usize,
    pub last_loss: Option<f64>,
    pub last_f1: Option<f64>,
}

/// # GLiNER trainer
/// AdamW with one learning rate for the token representation and one for the other layers,
/// both following a cosine schedule with linear warmup.
pub struct Trainer {
    model: GlinerModel,
    optimizer: nn::Optimizer,
    schedule: CosineWithWarmup,
    config: TrainingConfig,
    rng: StdRng,
    completed_steps: usize,
}

impl Trainer {
    pub fn new(model: GlinerModel, config: TrainingConfig) -> Result<Trainer, GlinerError> {
        config.validate()?;
        if config.freeze_token_rep {
            let mut frozen = 0;
            for (name, variable) in model.var_store().variables() {
                if name.starts_with("token_rep_layer.") {
                    let _ = variable.set_requires_grad(false);
                    frozen += 1;
                }
            }
            log::info!("Froze {frozen} token representation variables");
        }
        let optimizer = nn::AdamW::default().build(model.var_store(), config.lr_others)?;
        let schedule = CosineWithWarmup::new(config.num_steps, config.warmup_ratio);
        let rng = StdRng::seed_from_u64(config.seed);
        let mut trainer = Trainer {
            model,
            optimizer,
            schedule,
            config,
            rng,
            completed_steps: 0,
        };
        trainer.update_learning_rates();
        Ok(trainer)
    }

    pub fn model(&self) -> &GlinerModel {
        &self.model
    }

    pub fn into_model(self) -> GlinerModel {
        self.model
    }

    fn update_learning_rates(&mut self) {
        let factor = self.schedule.lr_factor(self.completed_steps);
        self.optimizer
            .set_lr_group(ENCODER_GROUP, self.config.lr_encoder * factor);
        self.optimizer
            .set_lr_group(HEAD_GROUP, self.config.lr_others * factor);
    }

    /// Runs one optimization step on a batch of examples, with per-example type sampling.
    pub fn train_step(&mut self, examples: &[Example]) -> StepOutcome {
        let batch = match self
            .model
            .collator()
            .collate_train(examples, &mut self.rng)
        {
            Ok(batch) => batch,
            Err(error) => return StepOutcome::Failed(error.to_string()),
        };
        let loss = match self.model.model().forward_loss(&batch, true) {
            Ok(loss) => loss,
            Err(error) => return StepOutcome::Failed(error.to_string()),
        };
        let loss_value = match f64::try_from(&loss) {
            Ok(value) => value,
            Err(error) => return StepOutcome::Failed(error.to_string()),
        };
        if loss_value.is_nan() {
            return StepOutcome::SkippedNan;
        }

        self.optimizer.zero_grad();
        if let Err(error) = loss.f_backward() {
            self.optimizer.zero_grad();
            return StepOutcome::Failed(error.to_string());
        }
        self.optimizer.step();
        self.completed_steps += 1;
        self.update_learning_rates();
        StepOutcome::Updated { loss: loss_value }
    }

    /// Trains for `num_steps` steps, cycling over the training data.
    ///
    /// Failing and NaN steps are logged and skipped. Every `eval_every` steps the model is
    /// evaluated on `eval_data` (if any) and saved to `log_dir/model_{step}`.
    pub fn fit(
        &mut self,
        train_data: &[Example],
        eval_data: Option<&[Example]>,
    ) -> Result<TrainingSummary, GlinerError> {
        if train_data.is_empty() {
            return Err(GlinerError::ValueError(
                "no training examples".to_string(),
            ));
        }
        let log_dir = self.config.log_dir();
        fs::create_dir_all(&log_dir)?;
        log::info!(
            "Training for {} steps ({} warmup) on {} examples, batch size {}",
            self.config.num_steps,
            self.schedule.warmup_steps(),
            train_data.len(),
            self.config.train_batch_size
        );

        let batch_size = self.config.train_batch_size;
        let batches_per_epoch = train_data.len().div_ceil(batch_size);
        let mut summary = TrainingSummary::default();
        let mut cursor = 0;
        for step in 0..self.config.num_steps {
            if cursor >= train_data.len() {
                cursor = 0;
            }
            let end = (cursor + batch_size).min(train_data.len());
            let batch = &train_data[cursor..end];
            cursor = end;

            match self.train_step(batch) {
                StepOutcome::Updated { loss } => {
                    summary.updated += 1;
                    summary.last_loss = Some(loss);
                    log::info!(
                        "step: {step} | epoch: {} | loss: {loss:.2}",
                        step / batches_per_epoch
                    );
                }
                StepOutcome::SkippedNan => {
                    summary.skipped_nan += 1;
                    log::warn!("NaN loss in step {step}, skipping update");
                }
                StepOutcome::Failed(error) => {
                    summary.failed += 1;
                    log::error!("Error in step {step}: {error}");
                }
            }

            if (step + 1) % self.config.eval_every == 0 {
                if let Some(eval_data) = eval_data {
                    log::info!("Evaluating...");
                    match self.model.evaluate(
                        eval_data,
                        None,
                        self.config.eval_batch_size,
                        self.config.eval_threshold,
                        self.config.eval_flat_ner,
                        self.config.eval_top_k,
                    ) {
                        Ok((report, f1)) => {
                            summary.last_f1 = Some(f1);
                            log::info!("Step={step}\n{report}");
                        }
                        Err(error) => log::error!("Evaluation failed at step {step}: {error}"),
                    }
                }
                self.model
                    .save_pretrained(log_dir.join(format!("model_{}", step + 1)))?;
            }
        }
        Ok(summary)
    }
}
