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

use std::path::PathBuf;

use clap::Parser;
use stderrlog::Timestamp;

use gliner::gliner::{load_examples, GlinerConfig, TaskMode};
use gliner::pipelines::gliner::GlinerBuilder;
use gliner::training::{Trainer, TrainingConfig};
use gliner::{Config, GlinerError};

/// Logging setup arg group.
#[derive(clap::Args, Debug)]
struct LogArgs {
    /// Silence log messages.
    #[clap(short, long)]
    quiet: bool,

    /// Increase log verbosity above the default level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable timestamped logging.
    #[clap(short, long)]
    ts: bool,
}

impl LogArgs {
    /// Log level (0 = off, ..., 5 = trace), every `-v` adding one level to `default`.
    fn level(&self, default: u8) -> u8 {
        if self.quiet {
            return 0;
        }
        default.saturating_add(self.verbose).min(5)
    }

    fn setup_logging(&self, default: u8) -> Result<(), Box<dyn std::error::Error>> {
        let log_level = match self.level(default) {
            0 => stderrlog::LogLevelNum::Off,
            1 => stderrlog::LogLevelNum::Error,
            2 => stderrlog::LogLevelNum::Warn,
            3 => stderrlog::LogLevelNum::Info,
            4 => stderrlog::LogLevelNum::Debug,
            _ => stderrlog::LogLevelNum::Trace,
        };

        stderrlog::new()
            .quiet(self.quiet)
            .verbosity(log_level)
            .timestamp(if self.ts {
                Timestamp::Second
            } else {
                Timestamp::Off
            })
            .init()?;

        Ok(())
    }
}

/// Train a GLiNER model for entity recognition or relation extraction.
#[derive(Parser, Debug)]
#[command(name = "gliner-train", version)]
struct Args {
    /// JSON file holding the model and training configurations.
    #[arg(long)]
    config: PathBuf,

    /// Directory receiving the checkpoints (overrides `log_dir` from the configuration).
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Train a relation extraction model.
    #[arg(long)]
    relation_extraction: bool,

    #[clap(flatten)]
    logging: LogArgs,
}

fn read_eval_data(training_config: &TrainingConfig) -> Option<Vec<gliner::gliner::Example>> {
    let path = training_config.eval_data.as_ref()?;
    match load_examples(path) {
        Ok(examples) => Some(examples),
        Err(error) => {
            log::warn!(
                "Could not read evaluation data {}: {error}",
                path.display()
            );
            None
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    args.logging.setup_logging(3)?;

    let mut gliner_config = GlinerConfig::from_file(&args.config)?;
    if args.relation_extraction {
        log::info!("Relation extraction mode activated");
        gliner_config.task = TaskMode::Relation;
    }
    let mut training_config = TrainingConfig::from_file(&args.config)?;
    if args.log_dir.is_some() {
        training_config.log_dir = args.log_dir.clone();
    }

    let train_data = load_examples(&training_config.train_data)?;
    let eval_data = read_eval_data(&training_config);
    log::info!(
        "Loaded {} training examples{}",
        train_data.len(),
        eval_data
            .as_ref()
            .map(|examples| format!(" and {} evaluation examples", examples.len()))
            .unwrap_or_default()
    );

    let model = match (training_config.previous_checkpoint(), &training_config.encoder_dir) {
        (Some(previous), _) => {
            let model = GlinerBuilder::local(previous).create_model()?;
            if model.config().task != gliner_config.task {
                return Err(GlinerError::InvalidConfigurationError(format!(
                    "checkpoint {} performs {:?}, training requested {:?}",
                    previous.display(),
                    model.config().task,
                    gliner_config.task
                ))
                .into());
            }
            model
        }
        (None, Some(encoder_dir)) => {
            GlinerBuilder::backbone(gliner_config, encoder_dir)
                .with_random_init(training_config.random_encoder_init)
                .create_model()?
        }
        (None, None) => {
            return Err(GlinerError::InvalidConfigurationError(
                "either prev_path or encoder_dir must be set".to_string(),
            )
            .into());
        }
    };

    let mut trainer = Trainer::new(model, training_config)?;
    let summary = trainer.fit(&train_data, eval_data.as_deref())?;
    log::info!(
        "Training done: {} updates, {} NaN steps skipped, {} failed steps",
        summary.updated,
        summary.skipped_nan,
        summary.failed
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn log_args(quiet: bool, verbose: u8) -> LogArgs {
        LogArgs {
            quiet,
            verbose,
            ts: false,
        }
    }

    #[test]
    fn verbose_flags_raise_the_default_level() {
        assert_eq!(log_args(false, 0).level(3), 3);
        assert_eq!(log_args(false, 1).level(3), 4);
        assert_eq!(log_args(false, 2).level(3), 5);
        assert_eq!(log_args(false, 9).level(3), 5);
        assert_eq!(log_args(true, 2).level(3), 0);
    }

    #[test]
    fn parses_training_arguments() {
        let args = Args::parse_from([
            "gliner-train",
            "--config",
            "config.json",
            "--relation-extraction",
            "-vv",
        ]);
        assert_eq!(args.config, PathBuf::from("config.json"));
        assert!(args.relation_extraction);
        assert!(args.log_dir.is_none());
        assert_eq!(args.logging.level(3), 5);
    }
}
