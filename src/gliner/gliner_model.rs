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

use std::borrow::Borrow;

use serde::{Deserialize, Serialize};
use tch::nn::ModuleT;
use tch::{nn, Device, Kind, Tensor};

use crate::gliner::collate::{masked_span_idx, GlinerBatch};
use crate::gliner::layers::{LstmSeq2SeqEncoder, PromptRepLayer};
use crate::gliner::loss::span_classification_loss;
use crate::gliner::prompt::PromptInjector;
use crate::gliner::rel_rep::{upper_triangular_pairs, RelationMarker};
use crate::gliner::span_rep::SpanMarker;
use crate::gliner::token_rep::{EncoderType, SubTokenPooling, TokenRepresentation};
use crate::{Config, GlinerError};

/// Optimizer group of the token representation (backbone) variables
pub const ENCODER_GROUP: usize = 0;
/// Optimizer group of every other variable
pub const HEAD_GROUP: usize = 1;

/// # Task performed by a GLiNER model
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TaskMode {
    /// Named entity recognition over all candidate spans
    #[default]
    #[serde(rename = "ner")]
    Ner,
    /// Relation extraction over pairs of given entities
    #[serde(rename = "rel", alias = "relation_extraction")]
    Relation,
}

/// # Candidate representation variant
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SpanMode {
    /// Start/end marker projections (entity pairs: concatenated entity representations)
    #[default]
    #[serde(rename = "markerV0", alias = "marker")]
    MarkerV0,
    /// Entity pairs only: the pooled context between the two entities is inserted between them
    #[serde(rename = "marker_context")]
    MarkerContext,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// # GLiNER model configuration
/// Hyper-parameters of the model and of the training-time collation.
/// Unknown keys are ignored so that training parameters can share the same file.
pub struct GlinerConfig {
    /// Backbone identifier (informative)
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default)]
    pub encoder_type: EncoderType,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: i64,
    #[serde(default = "default_max_width")]
    pub max_width: i64,
    #[serde(default = "default_dropout")]
    pub dropout: f64,
    #[serde(default, alias = "task_mode")]
    pub task: TaskMode,
    #[serde(default)]
    pub span_mode: SpanMode,
    #[serde(default)]
    pub subtoken_pooling: SubTokenPooling,
    #[serde(default = "default_true")]
    pub fine_tune: bool,
    #[serde(default)]
    pub lower_case: bool,
    /// Embedding rows of the backbone once the reserved tokens are added
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoder_vocab_size: Option<i64>,
    #[serde(default = "default_max_len")]
    pub max_len: usize,
    #[serde(default = "default_max_types")]
    pub max_types: usize,
    #[serde(default = "default_true")]
    pub shuffle_types: bool,
    #[serde(default = "default_true")]
    pub random_drop: bool,
    #[serde(default = "default_max_neg_type_ratio")]
    pub max_neg_type_ratio: usize,
    #[serde(default = "default_ent_token")]
    pub ent_token: String,
    #[serde(default = "default_sep_token")]
    pub sep_token: String,
}

fn default_model_name() -> String {
    "microsoft/deberta-v3-small".to_string()
}

fn default_hidden_size() -> i64 {
    512
}

fn default_max_width() -> i64 {
    12
}

fn default_dropout() -> f64 {
    0.4
}

fn default_true() -> bool {
    true
}

fn default_max_len() -> usize {
    384
}

fn default_max_types() -> usize {
    25
}

fn default_max_neg_type_ratio() -> usize {
    1
}

fn default_ent_token() -> String {
    "<<ENT>>".to_string()
}

fn default_sep_token() -> String {
    "<<SEP>>".to_string()
}

impl Config for GlinerConfig {}

impl Default for GlinerConfig {
    fn default() -> Self {
        GlinerConfig {
            model_name: default_model_name(),
            encoder_type: EncoderType::default(),
            hidden_size: default_hidden_size(),
            max_width: default_max_width(),
            dropout: default_dropout(),
            task: TaskMode::default(),
            span_mode: SpanMode::default(),
            subtoken_pooling: SubTokenPooling::default(),
            fine_tune: true,
            lower_case: false,
            encoder_vocab_size: None,
            max_len: default_max_len(),
            max_types: default_max_types(),
            shuffle_types: true,
            random_drop: true,
            max_neg_type_ratio: default_max_neg_type_ratio(),
            ent_token: default_ent_token(),
            sep_token: default_sep_token(),
        }
    }
}

impl GlinerConfig {
    /// Rejects inconsistent hyper-parameters before any layer is created.
    pub fn validate(&self) -> Result<(), GlinerError> {
        if self.hidden_size <= 0 || self.hidden_size % 2 != 0 {
            return Err(GlinerError::InvalidConfigurationError(format!(
                "hidden_size must be a positive even number, got {}",
                self.hidden_size
            )));
        }
        if self.max_width <= 0 {
            return Err(GlinerError::InvalidConfigurationError(format!(
                "max_width must be positive, got {}",
                self.max_width
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(GlinerError::InvalidConfigurationError(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.task == TaskMode::Ner && self.span_mode == SpanMode::MarkerContext {
            return Err(GlinerError::InvalidConfigurationError(
                "marker_context is only available for relation extraction".to_string(),
            ));
        }
        if self.ent_token == self.sep_token {
            return Err(GlinerError::InvalidConfigurationError(
                "marker and separator tokens must differ".to_string(),
            ));
        }
        Ok(())
    }
}

/// # Scoring head, selected once from the task mode
pub enum ScoringHead {
    /// Every candidate span up to the maximum width
    Ner(SpanMarker),
    /// Every unordered pair of the supplied entities
    Relation(RelationMarker),
}

impl ScoringHead {
    pub fn new<'p, P>(p: P, config: &GlinerConfig) -> ScoringHead
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();
        match config.task {
            TaskMode::Ner => ScoringHead::Ner(SpanMarker::new(
                p / "span_rep_layer",
                config.hidden_size,
                config.dropout,
            )),
            TaskMode::Relation => ScoringHead::Relation(RelationMarker::new(
                p / "rel_rep_layer",
                config.hidden_size,
                config.dropout,
                config.span_mode == SpanMode::MarkerContext,
            )),
        }
    }

    /// Candidate representations (*batch size*, *num candidates*, *hidden size*).
    /// NER candidates are ordered by start position, then width.
    pub fn forward_t(
        &self,
        word_rep: &Tensor,
        span_idx: &Tensor,
        max_width: i64,
        train: bool,
    ) -> Tensor {
        match self {
            ScoringHead::Ner(marker) => {
                let grid = marker.forward_grid(word_rep, span_idx, max_width, train);
                let size = grid.size();
                grid.view([size[0], size[1] * size[2], size[3]])
            }
            ScoringHead::Relation(marker) => marker.forward_t(word_rep, span_idx, train),
        }
    }
}

/// Output of `Gliner::compute_scores`
pub struct ScoreOutput {
    /// Logits (*batch size*, *num candidates*, *max num types*)
    pub scores: Tensor,
    /// Real type slots (*batch size*, *max num types*)
    pub entity_type_mask: Tensor,
    /// Candidates lying entirely within the encoded words (*batch size*, *num candidates*)
    pub candidate_mask: Tensor,
    /// Number of leading words of every example with a valid representation
    pub valid_lengths: Vec<i64>,
}

/// Counts the leading valid words of every example, words dropped by the token
/// representation (e.g. beyond the encoder capacity) ending the valid prefix.
fn valid_word_lengths(word_mask: &Tensor, text_lengths: &[i64]) -> Result<Vec<i64>, GlinerError> {
    let max_length = word_mask.size().get(1).copied().unwrap_or(0) as usize;
    let mask = Vec::<bool>::try_from(
        word_mask
            .to_device(Device::Cpu)
            .to_kind(Kind::Bool)
            .reshape([-1]),
    )?;
    Ok(text_lengths
        .iter()
        .enumerate()
        .map(|(index, &length)| {
            let row = &mask[index * max_length..(index + 1) * max_length];
            row.iter()
                .take(length.max(0) as usize)
                .take_while(|valid| **valid)
                .count() as i64
        })
        .collect())
}

/// # GLiNER model
/// Encodes the type prompt together with the text, contextualizes the words with a
/// bidirectional LSTM and scores every candidate against every prompted type.
pub struct Gliner {
    token_rep_layer: Box<dyn TokenRepresentation>,
    rnn: LstmSeq2SeqEncoder,
    span_rep_layer: ScoringHead,
    prompt_rep_layer: PromptRepLayer,
    prompt: PromptInjector,
    max_width: i64,
    task: TaskMode,
}

impl Gliner {
    /// Build a new `Gliner`
    ///
    /// # Arguments
    ///
    /// * `p` - Variable store path for the root of the model
    /// * `config` - `GlinerConfig` object defining the model architecture
    /// * `token_rep_layer` - word representation provider, created under `p / "token_rep_layer"`
    /// in the `ENCODER_GROUP` optimizer group
    ///
    /// # Example
    ///
    /// ```no_run
    /// use gliner::gliner::{
    ///     Gliner, GlinerConfig, TransformerTokenRep, TransformerTokenRepConfig, ENCODER_GROUP,
    /// };
    /// use tch::{nn, Device};
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let config = GlinerConfig::default();
    /// let vs = nn::VarStore::new(Device::Cpu);
    /// let token_rep = TransformerTokenRep::new(
    ///     vs.root().set_group(ENCODER_GROUP) / "token_rep_layer",
    ///     TransformerTokenRepConfig {
    ///         encoder_type: config.encoder_type,
    ///         encoder_config: "path/to/encoder_config.json".into(),
    ///         vocab: "path/to/spm.model".into(),
    ///         lower_case: false,
    ///         hidden_size: config.hidden_size,
    ///         pooling: config.subtoken_pooling,
    ///         fine_tune: true,
    ///         vocab_size: None,
    ///     },
    ///     &[config.ent_token.as_str(), config.sep_token.as_str()],
    /// )?;
    /// let model = Gliner::new(vs.root(), &config, Box::new(token_rep))?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn new<'p, P>(
        p: P,
        config: &GlinerConfig,
        mut token_rep_layer: Box<dyn TokenRepresentation>,
    ) -> Result<Gliner, GlinerError>
    where
        P: Borrow<nn::Path<'p>>,
    {
        config.validate()?;
        let p = p.borrow().set_group(HEAD_GROUP);

        token_rep_layer.add_special_tokens(&[config.ent_token.as_str(), config.sep_token.as_str()])?;
        let rnn = LstmSeq2SeqEncoder::new(&p / "rnn", config.hidden_size, config.hidden_size / 2);
        let span_rep_layer = ScoringHead::new(&p / "span_rep_layer", config);
        let prompt_rep_layer =
            PromptRepLayer::new(&p / "prompt_rep_layer", config.hidden_size, config.dropout);

        Ok(Gliner {
            token_rep_layer,
            rnn,
            span_rep_layer,
            prompt_rep_layer,
            prompt: PromptInjector::new(config.ent_token.as_str(), config.sep_token.as_str()),
            max_width: config.max_width,
            task: config.task,
        })
    }

    pub fn task(&self) -> TaskMode {
        self.task
    }

    pub fn max_width(&self) -> i64 {
        self.max_width
    }

    /// Scores every candidate of the batch against every prompted type.
    ///
    /// # Arguments
    ///
    /// * `batch` - collated batch (its task must match the model's)
    /// * `train` - boolean flag to turn on/off the dropout layers in the model.
    ///
    /// # Returns
    ///
    /// * `ScoreOutput` with logits of shape (*batch size*, *num candidates*, *max num types*)
    pub fn compute_scores(
        &self,
        batch: &GlinerBatch,
        train: bool,
    ) -> Result<ScoreOutput, GlinerError> {
        if batch.is_empty() {
            return Err(GlinerError::ValueError("empty batch".to_string()));
        }
        let prompted = self.prompt.inject(
            &batch.tokens,
            (0..batch.len()).map(|index| batch.types.get(index)),
        );
        let token_rep = self
            .token_rep_layer
            .encode(&prompted.tokens, &prompted.lengths, train)?;
        let split = prompted.split(&token_rep.embeddings, &token_rep.mask);
        let device = split.word_rep.device();

        let valid_lengths = valid_word_lengths(&split.word_mask, &prompted.text_lengths)?;
        let word_rep = self.rnn.forward(&split.word_rep, &valid_lengths);
        let candidate_mask = self.candidate_mask(batch, &valid_lengths).to(device);
        let span_idx = masked_span_idx(batch, device);
        let candidates = self
            .span_rep_layer
            .forward_t(&word_rep, &span_idx, self.max_width, train);

        let type_rep = self.prompt_rep_layer.forward_t(&split.type_rep, train);
        let scores = candidates.matmul(&type_rep.transpose(1, 2));

        Ok(ScoreOutput {
            scores,
            entity_type_mask: split.entity_type_mask,
            candidate_mask,
            valid_lengths,
        })
    }

    /// Spans (NER) or entity pairs (relation) ending before the valid length of their example.
    fn candidate_mask(&self, batch: &GlinerBatch, valid_lengths: &[i64]) -> Tensor {
        let valid_lengths = Tensor::from_slice(valid_lengths).unsqueeze(1);
        let span_ends = batch.span_idx.to_kind(Kind::Int64).select(2, 1);
        let valid_spans = batch
            .span_mask
            .to_kind(Kind::Bool)
            .logical_and(&span_ends.lt_tensor(&valid_lengths));
        match self.task {
            TaskMode::Ner => valid_spans,
            TaskMode::Relation => {
                upper_triangular_pairs(&valid_spans.to_kind(Kind::Int64).unsqueeze(-1))
                    .sum_dim_intlist([-1].as_slice(), false, Kind::Int64)
                    .eq(2)
            }
        }
    }

    /// Training loss of a batch: summed masked binary cross-entropy over all candidates.
    /// Candidates outside of the valid words are ignored.
    pub fn forward_loss(&self, batch: &GlinerBatch, train: bool) -> Result<Tensor, GlinerError> {
        let ScoreOutput {
            scores,
            entity_type_mask,
            candidate_mask,
            ..
        } = self.compute_scores(batch, train)?;
        let labels = batch
            .labels
            .to(scores.device())
            .masked_fill(&candidate_mask.logical_not(), -1);
        Ok(span_classification_loss(
            &scores,
            &labels,
            &entity_type_mask,
        ))
    }
}
