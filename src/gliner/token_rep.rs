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
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use rust_bert::bert::{BertConfig, BertEmbeddings, BertModel};
use rust_bert::deberta_v2::{DebertaV2Config, DebertaV2Model};
use rust_bert::pipelines::common::{ModelType, TokenizerOption};
use serde::{Deserialize, Serialize};
use tch::{nn, Device, Tensor};

use crate::GlinerError;

/// Output of a token representation provider.
pub struct TokenRepOutput {
    /// Word embeddings (*batch size*, *max length*, *hidden size*)
    pub embeddings: Tensor,
    /// `true` for real words (*batch size*, *max length*)
    pub mask: Tensor,
}

/// # Word-level representation provider
/// Maps word sequences to one embedding per word.
pub trait TokenRepresentation {
    /// Registers reserved vocabulary entries (prompt marker and separator). Must be
    /// called before the first call to `encode`.
    fn add_special_tokens(&mut self, tokens: &[&str]) -> Result<(), GlinerError>;

    /// # Arguments
    ///
    /// * `tokens` - word sequences
    /// * `lengths` - length of every word sequence
    /// * `train` - boolean flag to turn on/off the dropout layers in the model.
    fn encode(
        &self,
        tokens: &[Vec<String>],
        lengths: &[i64],
        train: bool,
    ) -> Result<TokenRepOutput, GlinerError>;
}

/// # Transformer backbone families supported for token representations
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum EncoderType {
    #[serde(rename = "bert")]
    Bert,
    #[default]
    #[serde(rename = "deberta_v2", alias = "deberta-v2", alias = "debertav2")]
    DebertaV2,
}

impl EncoderType {
    pub fn model_type(&self) -> ModelType {
        match self {
            EncoderType::Bert => ModelType::Bert,
            EncoderType::DebertaV2 => ModelType::DebertaV2,
        }
    }

    /// Tokenizer vocabulary file expected next to the encoder configuration.
    pub fn vocab_file_name(&self) -> &'static str {
        match self {
            EncoderType::Bert => "vocab.txt",
            EncoderType::DebertaV2 => "spm.model",
        }
    }
}

/// # Sub-token pooling strategy
/// Selects how the sub-tokens of a word are combined into a word representation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubTokenPooling {
    #[default]
    First,
    Last,
    Mean,
}

/// # Backbone configuration
pub enum EncoderConfig {
    Bert(BertConfig),
    DebertaV2(DebertaV2Config),
}

impl EncoderConfig {
    pub fn from_file<P: AsRef<Path>>(
        encoder_type: EncoderType,
        path: P,
    ) -> Result<EncoderConfig, GlinerError> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path).map_err(|e| {
            GlinerError::IOError(format!(
                "could not open encoder configuration {}: {e}",
                path.display()
            ))
        })?);
        Ok(match encoder_type {
            EncoderType::Bert => EncoderConfig::Bert(serde_json::from_reader(reader)?),
            EncoderType::DebertaV2 => EncoderConfig::DebertaV2(serde_json::from_reader(reader)?),
        })
    }

    pub fn hidden_size(&self) -> i64 {
        match self {
            EncoderConfig::Bert(config) => config.hidden_size,
            EncoderConfig::DebertaV2(config) => config.hidden_size,
        }
    }

    pub fn vocab_size(&self) -> i64 {
        match self {
            EncoderConfig::Bert(config) => config.vocab_size,
            EncoderConfig::DebertaV2(config) => config.vocab_size,
        }
    }

    fn set_vocab_size(&mut self, vocab_size: i64) {
        match self {
            EncoderConfig::Bert(config) => config.vocab_size = vocab_size,
            EncoderConfig::DebertaV2(config) => config.vocab_size = vocab_size,
        }
    }

    pub fn max_position_embeddings(&self) -> i64 {
        match self {
            EncoderConfig::Bert(config) => config.max_position_embeddings,
            EncoderConfig::DebertaV2(config) => config.max_position_embeddings,
        }
    }
}

/// # Abstraction that holds one particular backbone, for any of the supported encoders
enum EncoderBackbone {
    Bert(BertModel<BertEmbeddings>),
    DebertaV2(DebertaV2Model),
}

impl EncoderBackbone {
    fn new<'p, P>(p: P, config: &EncoderConfig) -> EncoderBackbone
    where
        P: Borrow<nn::Path<'p>>,
    {
        match config {
            EncoderConfig::Bert(config) => EncoderBackbone::Bert(
                BertModel::<BertEmbeddings>::new_with_optional_pooler(p, config, false),
            ),
            EncoderConfig::DebertaV2(config) => {
                EncoderBackbone::DebertaV2(DebertaV2Model::new(p, config))
            }
        }
    }

    fn forward_t(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor, GlinerError> {
        let hidden_state = match self {
            EncoderBackbone::Bert(model) => {
                model
                    .forward_t(
                        Some(input_ids),
                        Some(attention_mask),
                        None,
                        None,
                        None,
                        None,
                        None,
                        train,
                    )?
                    .hidden_state
            }
            EncoderBackbone::DebertaV2(model) => {
                model
                    .forward_t(
                        Some(input_ids),
                        Some(attention_mask),
                        None,
                        None,
                        None,
                        train,
                    )?
                    .hidden_state
            }
        };
        Ok(hidden_state)
    }
}

/// # Configuration for `TransformerTokenRep`
pub struct TransformerTokenRepConfig {
    pub encoder_type: EncoderType,
    /// Backbone configuration file
    pub encoder_config: PathBuf,
    /// Tokenizer vocabulary (`vocab.txt` or `spm.model`)
    pub vocab: PathBuf,
    pub lower_case: bool,
    /// Output size; a linear projection is added when it differs from the backbone width
    pub hidden_size: i64,
    pub pooling: SubTokenPooling,
    /// Propagate gradients through the backbone
    pub fine_tune: bool,
    /// Embedding rows of a previously saved model, if larger than the configured vocabulary
    pub vocab_size: Option<i64>,
}

/// # Transformer token representation
/// Tokenizes every word into sub-tokens, runs the backbone over the whole sequence and
/// pools the sub-token states of every word.
pub struct TransformerTokenRep {
    tokenizer: TokenizerOption,
    backbone: EncoderBackbone,
    projection: Option<nn::Linear>,
    pooling: SubTokenPooling,
    special_tokens: HashSet<String>,
    vocab_size: i64,
    max_subtokens: usize,
    fine_tune: bool,
    device: Device,
}

impl TransformerTokenRep {
    /// Build a new `TransformerTokenRep`
    ///
    /// # Arguments
    ///
    /// * `p` - Variable store path for the token representation layer
    /// * `config` - `TransformerTokenRepConfig` with the backbone files and options
    /// * `special_tokens` - reserved tokens added to the vocabulary before the embeddings are sized
    pub fn new<'p, P>(
        p: P,
        config: TransformerTokenRepConfig,
        special_tokens: &[&str],
    ) -> Result<TransformerTokenRep, GlinerError>
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();
        let mut encoder_config =
            EncoderConfig::from_file(config.encoder_type, &config.encoder_config)?;
        let mut tokenizer = TokenizerOption::from_file(
            config.encoder_type.model_type(),
            config.vocab.to_string_lossy().as_ref(),
            None,
            config.lower_case,
            None,
            None,
        )?;
        tokenizer.add_tokens(special_tokens);
        let max_added_id = tokenizer
            .convert_tokens_to_ids(special_tokens)
            .into_iter()
            .max()
            .unwrap_or(0);
        let vocab_size = encoder_config
            .vocab_size()
            .max(max_added_id + 1)
            .max(config.vocab_size.unwrap_or(0));
        encoder_config.set_vocab_size(vocab_size);

        let backbone = EncoderBackbone::new(p / "bert_layer" / "model", &encoder_config);
        let encoder_hidden_size = encoder_config.hidden_size();
        let projection = if encoder_hidden_size != config.hidden_size {
            Some(nn::linear(
                p / "projection",
                encoder_hidden_size,
                config.hidden_size,
                Default::default(),
            ))
        } else {
            None
        };

        Ok(TransformerTokenRep {
            tokenizer,
            backbone,
            projection,
            pooling: config.pooling,
            special_tokens: special_tokens.iter().map(|t| t.to_string()).collect(),
            vocab_size,
            max_subtokens: encoder_config.max_position_embeddings().max(4) as usize,
            fine_tune: config.fine_tune,
            device: p.device(),
        })
    }

    /// Number of embedding rows of the backbone, including the reserved tokens.
    pub fn vocab_size(&self) -> i64 {
        self.vocab_size
    }

    fn word_ids(&self, word: &str) -> Vec<i64> {
        if self.special_tokens.contains(word) {
            return self.tokenizer.convert_tokens_to_ids(&[word]);
        }
        let pieces = self.tokenizer.tokenize(word);
        if pieces.is_empty() {
            return vec![self.tokenizer.get_unk_id()];
        }
        self.tokenizer.convert_tokens_to_ids(&pieces)
    }

    fn pooling_weights(&self, range: (usize, usize)) -> Vec<(usize, f32)> {
        let (start, end) = range;
        match self.pooling {
            SubTokenPooling::First => vec![(start, 1.0)],
            SubTokenPooling::Last => vec![(end - 1, 1.0)],
            SubTokenPooling::Mean => {
                let weight = 1.0 / (end - start) as f32;
                (start..end).map(|position| (position, weight)).collect()
            }
        }
    }
}

impl TokenRepresentation for TransformerTokenRep {
    fn add_special_tokens(&mut self, tokens: &[&str]) -> Result<(), GlinerError> {
        let tokens = tokens
            .iter()
            .copied()
            .filter(|token| !self.special_tokens.contains(*token))
            .collect::<Vec<&str>>();
        if tokens.is_empty() {
            return Ok(());
        }
        self.tokenizer.add_tokens(&tokens);
        for (token, id) in tokens
            .iter()
            .zip(self.tokenizer.convert_tokens_to_ids(&tokens))
        {
            if id >= self.vocab_size {
                return Err(GlinerError::InvalidConfigurationError(format!(
                    "token {token} received id {id} outside of the {} embedding rows",
                    self.vocab_size
                )));
            }
            self.special_tokens.insert(token.to_string());
        }
        Ok(())
    }

    fn encode(
        &self,
        tokens: &[Vec<String>],
        lengths: &[i64],
        train: bool,
    ) -> Result<TokenRepOutput, GlinerError> {
        let batch_size = tokens.len();
        let max_words = lengths.iter().copied().max().unwrap_or(0).max(0) as usize;
        let cls_id = self.tokenizer.get_cls_id();
        let sep_id = self.tokenizer.get_sep_id();
        let pad_id = self.tokenizer.get_pad_id().unwrap_or(0);
        let budget = self.max_subtokens - 2;

        let mut sequences = Vec::with_capacity(batch_size);
        let mut word_ranges = Vec::with_capacity(batch_size);
        for (words, &length) in tokens.iter().zip(lengths) {
            let mut ids = cls_id.into_iter().collect::<Vec<i64>>();
            let mut ranges = Vec::with_capacity(length as usize);
            let mut exhausted = false;
            for word in words.iter().take(length as usize) {
                let word_ids = self.word_ids(word);
                if exhausted || ids.len() + word_ids.len() > budget {
                    exhausted = true;
                    ranges.push(None);
                    continue;
                }
                if word_ids.is_empty() {
                    ranges.push(None);
                    continue;
                }
                let start = ids.len();
                ids.extend(word_ids);
                ranges.push(Some((start, ids.len())));
            }
            let dropped = ranges.iter().filter(|range| range.is_none()).count();
            if dropped > 0 {
                log::warn!(
                    "{dropped} words exceed the encoder capacity of {} sub-tokens and are masked",
                    self.max_subtokens
                );
            }
            ids.extend(sep_id);
            sequences.push(ids);
            word_ranges.push(ranges);
        }

        let max_subtokens = sequences.iter().map(Vec::len).max().unwrap_or(0);
        let mut input_ids = Vec::with_capacity(batch_size * max_subtokens);
        let mut attention_mask = Vec::with_capacity(batch_size * max_subtokens);
        for ids in &sequences {
            input_ids.extend(ids.iter().copied());
            input_ids.extend(vec![pad_id; max_subtokens - ids.len()]);
            attention_mask.extend(vec![1i64; ids.len()]);
            attention_mask.extend(vec![0i64; max_subtokens - ids.len()]);
        }

        let mut pooling = vec![0f32; batch_size * max_words * max_subtokens];
        let mut word_mask = vec![false; batch_size * max_words];
        for (index, ranges) in word_ranges.iter().enumerate() {
            for (word, range) in ranges.iter().enumerate() {
                if let Some(range) = range {
                    let row = (index * max_words + word) * max_subtokens;
                    for (position, weight) in self.pooling_weights(*range) {
                        pooling[row + position] = weight;
                    }
                    word_mask[index * max_words + word] = true;
                }
            }
        }

        let (batch_size, max_words, max_subtokens) =
            (batch_size as i64, max_words as i64, max_subtokens as i64);
        let input_ids = Tensor::from_slice(&input_ids)
            .view([batch_size, max_subtokens])
            .to(self.device);
        let attention_mask = Tensor::from_slice(&attention_mask)
            .view([batch_size, max_subtokens])
            .to(self.device);

        let hidden_state = if self.fine_tune {
            self.backbone.forward_t(&input_ids, &attention_mask, train)?
        } else {
            tch::no_grad(|| self.backbone.forward_t(&input_ids, &attention_mask, false))?
        };

        let pooling = Tensor::from_slice(&pooling)
            .view([batch_size, max_words, max_subtokens])
            .to_kind(hidden_state.kind())
            .to(self.device);
        let pooled = pooling.matmul(&hidden_state);
        let embeddings = match &self.projection {
            Some(projection) => pooled.apply(projection),
            None => pooled,
        };
        let mask = Tensor::from_slice(&word_mask)
            .view([batch_size, max_words])
            .to(self.device);
        Ok(TokenRepOutput { embeddings, mask })
    }
}
