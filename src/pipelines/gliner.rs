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

//! # GLiNER pipeline
//! Zero-shot entity recognition and relation extraction with an arbitrary set of type names.
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
//! for entity in entities {
//!     println!("{} => {} ({:.2})", entity.text, entity.label, entity.score);
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use rust_tokenizers::Offset;
use serde::{Deserialize, Serialize};
use tch::{nn, Device, Kind, Tensor};

use crate::gliner::{
    Collator, EntitySpan, Example, Gliner, GlinerBatch, GlinerConfig, TaskMode,
    TransformerTokenRep, TransformerTokenRepConfig, ENCODER_GROUP,
};
use crate::pipelines::checkpoint::{
    load_backbone_weights, GlinerResources, ModelWeights, CONFIG_FILE, ENCODER_CONFIG_FILE,
    WEIGHTS_FILE,
};
use crate::pipelines::decoding::{greedy_search, top_k_per_pair, RelationCandidate, SpanCandidate};
use crate::pipelines::evaluation::{
    evaluate_entities, evaluate_relations, EntityKey, EvaluationReport, RelationKey,
};
use crate::pipelines::tokenizer::{char_slice, WordSplitter};
use crate::{Config, GlinerError};

pub use crate::pipelines::checkpoint::GlinerBuilder;

/// # Input of the prediction methods
#[derive(Debug, Clone, Copy)]
pub enum TextInput<'a> {
    /// Raw text, split into words with the word splitter. Outputs use character offsets.
    Raw(&'a str),
    /// Pre-tokenized words. Outputs use word indices (end inclusive).
    Tokenized(&'a [String]),
}

impl<'a> From<&'a str> for TextInput<'a> {
    fn from(text: &'a str) -> Self {
        TextInput::Raw(text)
    }
}

impl<'a> From<&'a String> for TextInput<'a> {
    fn from(text: &'a String) -> Self {
        TextInput::Raw(text.as_str())
    }
}

impl<'a> From<&'a [String]> for TextInput<'a> {
    fn from(words: &'a [String]) -> Self {
        TextInput::Tokenized(words)
    }
}

impl<'a> From<&'a Vec<String>> for TextInput<'a> {
    fn from(words: &'a Vec<String>) -> Self {
        TextInput::Tokenized(words.as_slice())
    }
}

/// # Recognized entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Character offset (raw text) or word index (tokenized input)
    pub start: usize,
    /// Exclusive character offset (raw text) or inclusive word index (tokenized input)
    pub end: usize,
    pub text: String,
    pub label: String,
    pub score: f64,
}

/// # Extracted relation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    /// Head entity, as supplied (word indices, end inclusive)
    pub head_pos: (usize, usize),
    pub tail_pos: (usize, usize),
    pub head_text: String,
    pub tail_text: String,
    pub label: String,
    pub score: f64,
}

struct PreparedInput {
    words: Vec<String>,
    raw: Option<(String, Vec<Offset>)>,
}

impl PreparedInput {
    fn span_text(&self, start: usize, end: usize) -> String {
        match &self.raw {
            Some((text, offsets)) => char_slice(
                text,
                offsets[start].begin as usize,
                offsets[end].end as usize,
            ),
            None => self.words[start..=end].join(" "),
        }
    }

    fn span_offsets(&self, start: usize, end: usize) -> (usize, usize) {
        match &self.raw {
            Some((_, offsets)) => (offsets[start].begin as usize, offsets[end].end as usize),
            None => (start, end),
        }
    }
}

/// Sigmoid scores of a batch, flattened on the CPU.
struct CandidateProbabilities {
    /// (*batch size* x *num candidates* x *num classes*)
    values: Vec<f32>,
    /// (*batch size* x *num candidates*)
    valid: Vec<bool>,
    num_candidates: usize,
    num_classes: usize,
}

/// # GLiNER model for entity recognition or relation extraction
pub struct GlinerModel {
    var_store: nn::VarStore,
    model: Gliner,
    config: GlinerConfig,
    collator: Collator,
    splitter: WordSplitter,
    encoder_files: Option<(PathBuf, PathBuf)>,
}

impl GlinerModel {
    /// Build a new `GlinerModel`
    ///
    /// # Arguments
    ///
    /// * `config` - `GlinerConfig` defining the architecture and the task
    /// * `resources` - `GlinerResources` with the backbone files, initial weights and device
    pub fn new(
        mut config: GlinerConfig,
        resources: GlinerResources,
    ) -> Result<GlinerModel, GlinerError> {
        let GlinerResources {
            encoder_config,
            vocab,
            weights,
            device,
        } = resources;

        let mut var_store = nn::VarStore::new(device);
        let token_rep = TransformerTokenRep::new(
            var_store.root().set_group(ENCODER_GROUP) / "token_rep_layer",
            TransformerTokenRepConfig {
                encoder_type: config.encoder_type,
                encoder_config: encoder_config.clone(),
                vocab: vocab.clone(),
                lower_case: config.lower_case,
                hidden_size: config.hidden_size,
                pooling: config.subtoken_pooling,
                fine_tune: config.fine_tune,
                vocab_size: config.encoder_vocab_size,
            },
            &[config.ent_token.as_str(), config.sep_token.as_str()],
        )?;
        config.encoder_vocab_size = Some(token_rep.vocab_size());
        let model = Gliner::new(var_store.root(), &config, Box::new(token_rep))?;

        match &weights {
            ModelWeights::Checkpoint(path) => var_store.load(path)?,
            ModelWeights::Backbone(path) => load_backbone_weights(&var_store, path)?,
            ModelWeights::Uninitialized => {}
        }

        let mut gliner_model = GlinerModel::from_parts(var_store, model, config);
        gliner_model.encoder_files = Some((encoder_config, vocab));
        Ok(gliner_model)
    }

    /// Wraps an already built model. Backbone files are not copied by `save_pretrained`.
    pub fn from_parts(var_store: nn::VarStore, model: Gliner, config: GlinerConfig) -> GlinerModel {
        GlinerModel {
            var_store,
            collator: Collator::new(&config),
            model,
            config,
            splitter: WordSplitter::default(),
            encoder_files: None,
        }
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.var_store
    }

    pub fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.var_store
    }

    pub fn model(&self) -> &Gliner {
        &self.model
    }

    pub fn config(&self) -> &GlinerConfig {
        &self.config
    }

    pub fn collator(&self) -> &Collator {
        &self.collator
    }

    pub fn device(&self) -> Device {
        self.var_store.device()
    }

    /// Saves the configuration, the weights and the backbone files into `model_dir`.
    pub fn save_pretrained<P: AsRef<Path>>(&self, model_dir: P) -> Result<(), GlinerError> {
        let model_dir = model_dir.as_ref();
        fs::create_dir_all(model_dir)?;
        self.config.to_file(model_dir.join(CONFIG_FILE))?;
        self.var_store.save(model_dir.join(WEIGHTS_FILE))?;
        if let Some((encoder_config, vocab)) = &self.encoder_files {
            copy_if_distinct(encoder_config, &model_dir.join(ENCODER_CONFIG_FILE))?;
            copy_if_distinct(
                vocab,
                &model_dir.join(self.config.encoder_type.vocab_file_name()),
            )?;
        }
        log::info!("Saved model to {}", model_dir.display());
        Ok(())
    }

    fn require_task(&self, task: TaskMode) -> Result<(), GlinerError> {
        if self.config.task != task {
            return Err(GlinerError::ValueError(format!(
                "operation requires a {task:?} model, the loaded model performs {:?}",
                self.config.task
            )));
        }
        Ok(())
    }

    fn prepare(&self, input: &TextInput) -> Result<PreparedInput, GlinerError> {
        let prepared = match input {
            TextInput::Raw(text) => {
                let words = self.splitter.split(text);
                let offsets = words.iter().map(|word| word.offset).collect();
                PreparedInput {
                    words: words.into_iter().map(|word| word.text).collect(),
                    raw: Some((text.to_string(), offsets)),
                }
            }
            TextInput::Tokenized(words) => PreparedInput {
                words: words.to_vec(),
                raw: None,
            },
        };
        if prepared.words.is_empty() {
            return Err(GlinerError::ValueError("input text is empty".to_string()));
        }
        Ok(prepared)
    }

    /// Recognizes entities of the given types in a single text.
    ///
    /// # Arguments
    ///
    /// * `input` - raw text or pre-tokenized words
    /// * `labels` - candidate entity type names
    /// * `flat_ner` - disallow nested predictions
    /// * `threshold` - minimum probability of a prediction
    pub fn predict_entities<'a, T, S>(
        &self,
        input: T,
        labels: &[S],
        flat_ner: bool,
        threshold: f64,
    ) -> Result<Vec<Entity>, GlinerError>
    where
        T: Into<TextInput<'a>>,
        S: AsRef<str>,
    {
        let mut output = self.batch_predict_entities(&[input.into()], labels, flat_ner, threshold)?;
        Ok(output.pop().unwrap_or_default())
    }

    /// Recognizes entities of the given types in a batch of texts.
    pub fn batch_predict_entities<S: AsRef<str>>(
        &self,
        inputs: &[TextInput],
        labels: &[S],
        flat_ner: bool,
        threshold: f64,
    ) -> Result<Vec<Vec<Entity>>, GlinerError> {
        self.require_task(TaskMode::Ner)?;
        let prepared = inputs
            .iter()
            .map(|input| self.prepare(input))
            .collect::<Result<Vec<PreparedInput>, GlinerError>>()?;
        let examples = prepared
            .iter()
            .map(|input| Example::new(input.words.clone()))
            .collect::<Vec<Example>>();
        let batch = self.collator.collate_with_types(&examples, labels)?;
        let spans = self.decode_spans(&batch, threshold, flat_ner)?;

        Ok(spans
            .into_iter()
            .zip(prepared.iter())
            .map(|(spans, input)| {
                spans
                    .into_iter()
                    .map(|span| {
                        let (start, end) = input.span_offsets(span.start, span.end);
                        Entity {
                            start,
                            end,
                            text: input.span_text(span.start, span.end),
                            label: span.label,
                            score: span.score,
                        }
                    })
                    .collect()
            })
            .collect())
    }

    /// Extracts relations of the given types between the supplied entities of a single text.
    ///
    /// # Arguments
    ///
    /// * `input` - raw text or pre-tokenized words
    /// * `ner` - entity spans as word indices (end inclusive)
    /// * `labels` - candidate relation type names
    /// * `threshold` - minimum probability of a prediction
    pub fn predict_relations<'a, T, S>(
        &self,
        input: T,
        ner: &[(usize, usize)],
        labels: &[S],
        threshold: f64,
    ) -> Result<Vec<Relation>, GlinerError>
    where
        T: Into<TextInput<'a>>,
        S: AsRef<str>,
    {
        let mut output =
            self.batch_predict_relations(&[input.into()], &[ner.to_vec()], labels, threshold)?;
        Ok(output.pop().unwrap_or_default())
    }

    /// Extracts relations for a batch of texts, `ner[i]` holding the entities of `inputs[i]`.
    pub fn batch_predict_relations<S: AsRef<str>>(
        &self,
        inputs: &[TextInput],
        ner: &[Vec<(usize, usize)>],
        labels: &[S],
        threshold: f64,
    ) -> Result<Vec<Vec<Relation>>, GlinerError> {
        self.require_task(TaskMode::Relation)?;
        if inputs.len() != ner.len() {
            return Err(GlinerError::ValueError(format!(
                "got {} inputs but {} entity lists",
                inputs.len(),
                ner.len()
            )));
        }
        let prepared = inputs
            .iter()
            .map(|input| self.prepare(input))
            .collect::<Result<Vec<PreparedInput>, GlinerError>>()?;
        let examples = prepared
            .iter()
            .zip(ner)
            .map(|(input, spans)| {
                Example::new(input.words.clone()).with_entities(
                    spans
                        .iter()
                        .map(|&(start, end)| EntitySpan::new(start, end, "entity"))
                        .collect(),
                )
            })
            .collect::<Vec<Example>>();
        let batch = self.collator.collate_with_types(&examples, labels)?;
        let relations = self.decode_pairs(&batch, threshold)?;

        Ok(relations
            .into_iter()
            .zip(prepared.iter())
            .map(|(relations, input)| {
                relations
                    .into_iter()
                    .map(|relation| Relation {
                        head_text: input.span_text(relation.head.0, relation.head.1),
                        tail_text: input.span_text(relation.tail.0, relation.tail.1),
                        head_pos: relation.head,
                        tail_pos: relation.tail,
                        label: relation.label,
                        score: relation.score,
                    })
                    .collect()
            })
            .collect())
    }

    fn probabilities(&self, batch: &GlinerBatch) -> Result<CandidateProbabilities, GlinerError> {
        let (probabilities, candidate_mask) =
            tch::no_grad(|| -> Result<(Tensor, Tensor), GlinerError> {
                let output = self.model.compute_scores(batch, false)?;
                Ok((
                    output
                        .scores
                        .sigmoid()
                        .to_kind(Kind::Float)
                        .to_device(Device::Cpu),
                    output.candidate_mask.to_device(Device::Cpu),
                ))
            })?;
        let size = probabilities.size();
        Ok(CandidateProbabilities {
            values: Vec::<f32>::try_from(probabilities.reshape([-1]))?,
            valid: Vec::<bool>::try_from(candidate_mask.reshape([-1]))?,
            num_candidates: size[1] as usize,
            num_classes: size[2] as usize,
        })
    }

    /// Thresholded span predictions of every example, after conflict resolution.
    fn decode_spans(
        &self,
        batch: &GlinerBatch,
        threshold: f64,
        flat_ner: bool,
    ) -> Result<Vec<Vec<SpanCandidate>>, GlinerError> {
        let probabilities = self.probabilities(batch)?;
        let num_classes = probabilities.num_classes;
        let max_width = self.model.max_width() as usize;

        let mut output = Vec::with_capacity(batch.len());
        for (index, length) in batch.seq_length.iter().enumerate() {
            let length = *length as usize;
            let vocabulary = batch.types.get(index);
            let mut candidates = Vec::new();
            for start in 0..length {
                for width in 0..max_width {
                    if start + width >= length {
                        break;
                    }
                    let candidate = index * probabilities.num_candidates + start * max_width + width;
                    if !probabilities.valid[candidate] {
                        continue;
                    }
                    let row = candidate * num_classes;
                    for class in 0..vocabulary.len().min(num_classes) {
                        let score = probabilities.values[row + class] as f64;
                        if score > threshold {
                            if let Some(label) = vocabulary.label(class as i64 + 1) {
                                candidates.push(SpanCandidate::new(
                                    start,
                                    start + width,
                                    label,
                                    score,
                                ));
                            }
                        }
                    }
                }
            }
            output.push(greedy_search(candidates, flat_ner));
        }
        Ok(output)
    }

    /// Thresholded relation predictions of every example, in entity pair order.
    fn decode_pairs(
        &self,
        batch: &GlinerBatch,
        threshold: f64,
    ) -> Result<Vec<Vec<RelationCandidate>>, GlinerError> {
        if batch.entities.iter().all(|entities| entities.len() < 2) {
            return Ok(vec![Vec::new(); batch.len()]);
        }
        let probabilities = self.probabilities(batch)?;
        let num_classes = probabilities.num_classes;

        let mut output = Vec::with_capacity(batch.len());
        for index in 0..batch.len() {
            let vocabulary = batch.types.get(index);
            let mut relations = Vec::new();
            for (pair_index, (head, tail)) in batch.entity_pairs(index).into_iter().enumerate() {
                let candidate = index * probabilities.num_candidates + pair_index;
                if !probabilities.valid[candidate] {
                    continue;
                }
                let row = candidate * num_classes;
                for class in 0..vocabulary.len().min(num_classes) {
                    let score = probabilities.values[row + class] as f64;
                    if score > threshold {
                        if let Some(label) = vocabulary.label(class as i64 + 1) {
                            relations.push(RelationCandidate {
                                head: head.position(),
                                tail: tail.position(),
                                label: label.to_string(),
                                score,
                            });
                        }
                    }
                }
            }
            output.push(relations);
        }
        Ok(output)
    }

    /// Evaluates the model on annotated examples.
    ///
    /// # Arguments
    ///
    /// * `examples` - annotated examples (entities for NER, entities and relations for relation extraction)
    /// * `types` - candidate type names; defaults to the sorted set of annotated types
    /// * `batch_size` - number of examples per forward pass
    /// * `threshold` - minimum probability of a prediction
    /// * `flat_ner` - disallow nested entity predictions
    /// * `top_k` - maximum number of relation labels per entity pair
    ///
    /// # Returns
    ///
    /// * `(EvaluationReport, f1)`
    pub fn evaluate(
        &self,
        examples: &[Example],
        types: Option<&[String]>,
        batch_size: usize,
        threshold: f64,
        flat_ner: bool,
        top_k: usize,
    ) -> Result<(EvaluationReport, f64), GlinerError> {
        if examples.is_empty() {
            return Err(GlinerError::ValueError(
                "no examples to evaluate".to_string(),
            ));
        }
        if batch_size == 0 {
            return Err(GlinerError::ValueError(
                "batch size must be positive".to_string(),
            ));
        }
        let types = match types {
            Some(types) => types.to_vec(),
            None => self.annotated_types(examples),
        };
        log::info!("Number of classes to evaluate with: {}", types.len());

        let report = match self.config.task {
            TaskMode::Ner => {
                let mut predicted: Vec<EntityKey> = Vec::new();
                let mut gold: Vec<EntityKey> = Vec::new();
                for (chunk_index, chunk) in examples.chunks(batch_size).enumerate() {
                    let offset = chunk_index * batch_size;
                    let batch = self.collator.collate_with_types(chunk, &types)?;
                    for (index, spans) in self
                        .decode_spans(&batch, threshold, flat_ner)?
                        .into_iter()
                        .enumerate()
                    {
                        predicted.extend(
                            spans
                                .into_iter()
                                .map(|span| (span.label, span.start, span.end, offset + index)),
                        );
                    }
                    for (index, example) in chunk.iter().enumerate() {
                        gold.extend(example.ner.iter().map(|span| {
                            (span.label.clone(), span.start, span.end, offset + index)
                        }));
                    }
                }
                evaluate_entities(predicted, gold)
            }
            TaskMode::Relation => {
                let mut predicted: Vec<RelationKey> = Vec::new();
                let mut gold: Vec<RelationKey> = Vec::new();
                for (chunk_index, chunk) in examples.chunks(batch_size).enumerate() {
                    let offset = chunk_index * batch_size;
                    let batch = self.collator.collate_with_types(chunk, &types)?;
                    for (index, relations) in self
                        .decode_pairs(&batch, threshold)?
                        .into_iter()
                        .enumerate()
                    {
                        predicted.extend(top_k_per_pair(relations, top_k).into_iter().map(
                            |relation| {
                                (relation.label, relation.head, relation.tail, offset + index)
                            },
                        ));
                    }
                    //    Collated relations only hold pairs the model can score
                    for (index, relations) in batch.relations.iter().enumerate() {
                        gold.extend(relations.iter().map(|relation| {
                            (
                                relation.relation_text.clone(),
                                relation.head_position(),
                                relation.tail_position(),
                                offset + index,
                            )
                        }));
                    }
                }
                evaluate_relations(predicted, gold)
            }
        };
        log::info!("Evaluation on {} examples: {}", examples.len(), report);
        Ok((report, report.f1))
    }

    fn annotated_types(&self, examples: &[Example]) -> Vec<String> {
        let types = match self.config.task {
            TaskMode::Ner => examples
                .iter()
                .flat_map(|example| example.ner.iter().map(|span| span.label.clone()))
                .collect::<BTreeSet<String>>(),
            TaskMode::Relation => examples
                .iter()
                .flat_map(|example| {
                    example
                        .relations
                        .iter()
                        .map(|relation| relation.relation_text.clone())
                })
                .collect::<BTreeSet<String>>(),
        };
        types.into_iter().collect()
    }
}

fn copy_if_distinct(source: &Path, target: &Path) -> Result<(), GlinerError> {
    if target.exists() && fs::canonicalize(source)? == fs::canonicalize(target)? {
        return Ok(());
    }
    fs::copy(source, target)?;
    Ok(())
}
