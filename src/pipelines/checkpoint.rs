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

//! # Checkpoint resolution and model builder
//!
//! A checkpoint directory is resolved by trying an ordered list of `CheckpointFormat`
//! strategies. Each strategy returns `Ok(None)` when its files are absent and an error when
//! they are present but cannot be used:
//! - `CurrentFormat`: `gliner_config.json`, `rust_model.ot` (or `model.safetensors`),
//!   `encoder_config.json` and the tokenizer vocabulary (`spm.model` or `vocab.txt`),
//! - `LegacyCombinedFormat`: single-file `gliner_base.pt` / `gliner_multi.pt` checkpoints,
//!   detected and rejected as unsupported.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tch::{nn, Device, Tensor};

use crate::gliner::{EncoderType, GlinerConfig};
use crate::pipelines::gliner::GlinerModel;
use crate::{Config, GlinerError};

pub const CONFIG_FILE: &str = "gliner_config.json";
pub const WEIGHTS_FILE: &str = "rust_model.ot";
pub const SAFETENSORS_WEIGHTS_FILE: &str = "model.safetensors";
pub const ENCODER_CONFIG_FILE: &str = "encoder_config.json";
const LEGACY_FILES: [&str; 2] = ["gliner_base.pt", "gliner_multi.pt"];

/// Variable name prefix of the backbone transformer inside a GLiNER variable store
pub(crate) const BACKBONE_PREFIX: &str = "token_rep_layer.bert_layer.model.";

/// Files making up a usable checkpoint
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointFiles {
    pub config: PathBuf,
    pub weights: PathBuf,
    pub encoder_config: PathBuf,
    pub vocab: PathBuf,
}

/// # Checkpoint layout strategy
pub trait CheckpointFormat {
    fn name(&self) -> &'static str;

    /// Returns `Ok(None)` if the directory does not contain this format.
    fn locate(&self, model_dir: &Path) -> Result<Option<CheckpointFiles>, GlinerError>;
}

/// Configuration and weights stored as separate artifacts, next to the backbone files
pub struct CurrentFormat;

impl CheckpointFormat for CurrentFormat {
    fn name(&self) -> &'static str {
        "current"
    }

    fn locate(&self, model_dir: &Path) -> Result<Option<CheckpointFiles>, GlinerError> {
        let config = model_dir.join(CONFIG_FILE);
        if !config.is_file() {
            return Ok(None);
        }
        let gliner_config = GlinerConfig::from_file(&config)?;

        let weights = [WEIGHTS_FILE, SAFETENSORS_WEIGHTS_FILE]
            .iter()
            .map(|name| model_dir.join(name))
            .find(|path| path.is_file())
            .ok_or_else(|| {
                GlinerError::InvalidConfigurationError(format!(
                    "{} contains {CONFIG_FILE} but no {WEIGHTS_FILE} or {SAFETENSORS_WEIGHTS_FILE}",
                    model_dir.display()
                ))
            })?;
        let encoder_config = required_file(model_dir, ENCODER_CONFIG_FILE)?;
        let vocab = required_file(model_dir, gliner_config.encoder_type.vocab_file_name())?;

        Ok(Some(CheckpointFiles {
            config,
            weights,
            encoder_config,
            vocab,
        }))
    }
}

fn required_file(model_dir: &Path, name: &str) -> Result<PathBuf, GlinerError> {
    let path = model_dir.join(name);
    if path.is_file() {
        Ok(path)
    } else {
        Err(GlinerError::InvalidConfigurationError(format!(
            "{} contains {CONFIG_FILE} but no {name}",
            model_dir.display()
        )))
    }
}

/// Pickled single-file checkpoints (configuration and weights combined)
pub struct LegacyCombinedFormat;

impl CheckpointFormat for LegacyCombinedFormat {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn locate(&self, model_dir: &Path) -> Result<Option<CheckpointFiles>, GlinerError> {
        match LEGACY_FILES
            .iter()
            .map(|name| model_dir.join(name))
            .find(|path| path.is_file())
        {
            Some(path) => Err(GlinerError::UnsupportedCheckpoint(
                path,
                format!(
                    "combined checkpoints are not supported, convert them to {CONFIG_FILE} and {WEIGHTS_FILE}"
                ),
            )),
            None => Ok(None),
        }
    }
}

/// Resolves the checkpoint files of a directory, trying the current layout first.
pub fn resolve_checkpoint<P: AsRef<Path>>(model_dir: P) -> Result<CheckpointFiles, GlinerError> {
    let model_dir = model_dir.as_ref();
    let formats: [&dyn CheckpointFormat; 2] = [&CurrentFormat, &LegacyCombinedFormat];
    for format in formats {
        if let Some(files) = format.locate(model_dir)? {
            log::info!(
                "Loading {} checkpoint from {}",
                format.name(),
                model_dir.display()
            );
            return Ok(files);
        }
        log::debug!(
            "No {} checkpoint in {}",
            format.name(),
            model_dir.display()
        );
    }
    Err(GlinerError::CheckpointNotFound(model_dir.to_path_buf()))
}

/// # Source of the initial model weights
#[derive(Debug, Clone, PartialEq)]
pub enum ModelWeights {
    /// Complete GLiNER weights (`rust_model.ot` or `model.safetensors`)
    Checkpoint(PathBuf),
    /// Backbone weights only; the GLiNER head is randomly initialized
    Backbone(PathBuf),
    /// Random initialization of every variable
    Uninitialized,
}

/// # Files required to build a `GlinerModel`
#[derive(Debug, Clone)]
pub struct GlinerResources {
    /// Backbone configuration
    pub encoder_config: PathBuf,
    /// Tokenizer vocabulary (`spm.model` or `vocab.txt`)
    pub vocab: PathBuf,
    pub weights: ModelWeights,
    pub device: Device,
}

impl GlinerResources {
    /// Resources of a resolved checkpoint, along with its model configuration.
    pub fn from_checkpoint(
        files: CheckpointFiles,
        device: Device,
    ) -> Result<(GlinerConfig, GlinerResources), GlinerError> {
        let config = GlinerConfig::from_file(&files.config)?;
        Ok((
            config,
            GlinerResources {
                encoder_config: files.encoder_config,
                vocab: files.vocab,
                weights: ModelWeights::Checkpoint(files.weights),
                device,
            },
        ))
    }

    /// Resources of a converted backbone directory (`config.json`, vocabulary and optional
    /// `rust_model.ot`).
    pub fn from_backbone<P: AsRef<Path>>(
        encoder_type: EncoderType,
        backbone_dir: P,
        device: Device,
    ) -> Result<GlinerResources, GlinerError> {
        let backbone_dir = backbone_dir.as_ref();
        let encoder_config = [ENCODER_CONFIG_FILE, "config.json"]
            .iter()
            .map(|name| backbone_dir.join(name))
            .find(|path| path.is_file())
            .ok_or_else(|| GlinerError::CheckpointNotFound(backbone_dir.to_path_buf()))?;
        let vocab = backbone_dir.join(encoder_type.vocab_file_name());
        if !vocab.is_file() {
            return Err(GlinerError::InvalidConfigurationError(format!(
                "missing tokenizer vocabulary {}",
                vocab.display()
            )));
        }
        let weights = [WEIGHTS_FILE, SAFETENSORS_WEIGHTS_FILE]
            .iter()
            .map(|name| backbone_dir.join(name))
            .find(|path| path.is_file())
            .map(ModelWeights::Backbone)
            .unwrap_or(ModelWeights::Uninitialized);
        Ok(GlinerResources {
            encoder_config,
            vocab,
            weights,
            device,
        })
    }
}

/// Loads backbone weights saved by a standalone transformer into the backbone variables.
///
/// Variables are matched by name suffix. Word embeddings resized for the prompt tokens only
/// receive the rows present in the source.
pub(crate) fn load_backbone_weights(
    var_store: &nn::VarStore,
    weights: &Path,
) -> Result<(), GlinerError> {
    let source = match weights.extension().and_then(|extension| extension.to_str()) {
        Some("safetensors") => Tensor::read_safetensors(weights)?,
        _ => Tensor::load_multi_with_device(weights, var_store.device())?,
    };
    let source = source.into_iter().collect::<HashMap<String, Tensor>>();

    let mut loaded = 0usize;
    let mut missing = Vec::new();
    let variables = var_store.variables();
    tch::no_grad(|| -> Result<(), GlinerError> {
        for (name, variable) in &variables {
            let relative = match name.strip_prefix(BACKBONE_PREFIX) {
                Some(relative) => relative,
                None => continue,
            };
            let value = match find_by_suffix(&source, relative) {
                Some(value) => value.to_device(variable.device()),
                None => {
                    missing.push(relative.to_string());
                    continue;
                }
            };
            let (target_size, source_size) = (variable.size(), value.size());
            if target_size == source_size {
                variable.shallow_clone().copy_(&value);
            } else if target_size.len() == 2
                && target_size[1..] == source_size[1..]
                && relative.ends_with("word_embeddings.weight")
            {
                let rows = target_size[0].min(source_size[0]);
                variable
                    .narrow(0, 0, rows)
                    .copy_(&value.narrow(0, 0, rows));
            } else {
                return Err(GlinerError::InvalidConfigurationError(format!(
                    "shape mismatch for backbone variable {relative}: expected {target_size:?}, got {source_size:?}"
                )));
            }
            loaded += 1;
        }
        Ok(())
    })?;

    if loaded == 0 {
        return Err(GlinerError::InvalidConfigurationError(format!(
            "no backbone variable found in {}",
            weights.display()
        )));
    }
    if !missing.is_empty() {
        log::warn!(
            "{} backbone variables not found in {} and left randomly initialized: {:?}",
            missing.len(),
            weights.display(),
            missing
        );
    }
    log::info!("Loaded {loaded} backbone variables from {}", weights.display());
    Ok(())
}

fn find_by_suffix<'a>(source: &'a HashMap<String, Tensor>, relative: &str) -> Option<&'a Tensor> {
    if let Some(value) = source.get(relative) {
        return Some(value);
    }
    let suffix = format!(".{relative}");
    source
        .iter()
        .filter(|(name, _)| name.ends_with(&suffix))
        .min_by_key(|(name, _)| name.len())
        .map(|(_, value)| value)
}

/// # GLiNER model builder
///
/// Builds a `GlinerModel` from a checkpoint directory, or a fresh model on top of a converted
/// backbone for training.
pub struct GlinerBuilder<T> {
    device: Device,
    inner: T,
}

impl<T> GlinerBuilder<T> {
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }
}

pub struct Local {
    model_dir: PathBuf,
}

impl GlinerBuilder<Local> {
    pub fn local<P: Into<PathBuf>>(model_dir: P) -> Self {
        Self {
            device: Device::cuda_if_available(),
            inner: Local {
                model_dir: model_dir.into(),
            },
        }
    }

    pub fn create_model(self) -> Result<GlinerModel, GlinerError> {
        let files = resolve_checkpoint(&self.inner.model_dir)?;
        let (config, resources) = GlinerResources::from_checkpoint(files, self.device)?;
        GlinerModel::new(config, resources)
    }
}

pub struct Backbone {
    config: GlinerConfig,
    backbone_dir: PathBuf,
    random_init: bool,
}

impl GlinerBuilder<Backbone> {
    pub fn backbone<P: Into<PathBuf>>(config: GlinerConfig, backbone_dir: P) -> Self {
        Self {
            device: Device::cuda_if_available(),
            inner: Backbone {
                config,
                backbone_dir: backbone_dir.into(),
                random_init: false,
            },
        }
    }

    /// Accepts a backbone directory without weights, the backbone being randomly initialized.
    pub fn with_random_init(mut self, random_init: bool) -> Self {
        self.inner.random_init = random_init;
        self
    }

    /// Fails with `CheckpointNotFound` if the directory holds no backbone weights, unless
    /// random initialization was requested.
    pub fn create_model(self) -> Result<GlinerModel, GlinerError> {
        let resources = GlinerResources::from_backbone(
            self.inner.config.encoder_type,
            &self.inner.backbone_dir,
            self.device,
        )?;
        if resources.weights == ModelWeights::Uninitialized {
            if !self.inner.random_init {
                return Err(GlinerError::CheckpointNotFound(self.inner.backbone_dir));
            }
            log::warn!(
                "No backbone weights in {}, the backbone is randomly initialized",
                self.inner.backbone_dir.display()
            );
        }
        GlinerModel::new(self.inner.config, resources)
    }
}
