#![allow(dead_code)]

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use gliner::gliner::{
    Gliner, GlinerConfig, TaskMode, TokenRepOutput, TokenRepresentation, ENCODER_GROUP,
};
use gliner::pipelines::gliner::GlinerModel;
use gliner::GlinerError;
use tch::{nn, nn::Module, Device, Tensor};

const NUM_BUCKETS: i64 = 1024;

/// Word representations looked up from a hashed embedding table.
/// With a budget, prompted positions from `budget` on are masked like words exceeding the
/// capacity of a transformer encoder.
pub struct HashTokenRep {
    embeddings: nn::Embedding,
    budget: Option<i64>,
    device: Device,
}

impl HashTokenRep {
    pub fn new(p: nn::Path, hidden_size: i64) -> HashTokenRep {
        let device = p.device();
        let embeddings = nn::embedding(&p / "embeddings", NUM_BUCKETS, hidden_size, Default::default());
        HashTokenRep {
            embeddings,
            budget: None,
            device,
        }
    }

    pub fn with_budget(mut self, budget: Option<i64>) -> HashTokenRep {
        self.budget = budget;
        self
    }

    fn bucket(word: &str) -> i64 {
        let mut hasher = DefaultHasher::new();
        word.hash(&mut hasher);
        (hasher.finish() % NUM_BUCKETS as u64) as i64
    }
}

impl TokenRepresentation for HashTokenRep {
    fn add_special_tokens(&mut self, _tokens: &[&str]) -> Result<(), GlinerError> {
        Ok(())
    }

    fn encode(
        &self,
        tokens: &[Vec<String>],
        lengths: &[i64],
        _train: bool,
    ) -> Result<TokenRepOutput, GlinerError> {
        let max_length = lengths.iter().copied().max().unwrap_or(0);
        let mut ids = Vec::new();
        let mut mask = Vec::new();
        let visible = self.budget.unwrap_or(i64::MAX);
        for (words, &length) in tokens.iter().zip(lengths) {
            for position in 0..max_length {
                if position < length && position < visible {
                    ids.push(Self::bucket(&words[position as usize]));
                    mask.push(true);
                } else {
                    ids.push(0);
                    mask.push(false);
                }
            }
        }
        let batch_size = tokens.len() as i64;
        let ids = Tensor::from_slice(&ids)
            .view([batch_size, max_length])
            .to(self.device);
        let mask = Tensor::from_slice(&mask)
            .view([batch_size, max_length])
            .to(self.device);
        let embeddings = self.embeddings.forward(&ids) * mask.unsqueeze(-1);
        Ok(TokenRepOutput { embeddings, mask })
    }
}

pub fn small_config(task: TaskMode) -> GlinerConfig {
    GlinerConfig {
        hidden_size: 16,
        max_width: 4,
        dropout: 0.1,
        task,
        ..Default::default()
    }
}

pub fn build_model(config: &GlinerConfig) -> anyhow::Result<(nn::VarStore, Gliner)> {
    build_model_with_seed(config, 0)
}

pub fn build_model_with_seed(
    config: &GlinerConfig,
    seed: i64,
) -> anyhow::Result<(nn::VarStore, Gliner)> {
    build_model_with_budget(config, seed, None)
}

/// Model whose token representation only encodes the first `budget` prompted positions.
pub fn build_model_with_budget(
    config: &GlinerConfig,
    seed: i64,
    budget: Option<i64>,
) -> anyhow::Result<(nn::VarStore, Gliner)> {
    tch::manual_seed(seed);
    let vs = nn::VarStore::new(Device::Cpu);
    let token_rep = HashTokenRep::new(
        vs.root().set_group(ENCODER_GROUP) / "token_rep_layer",
        config.hidden_size,
    )
    .with_budget(budget);
    let model = Gliner::new(vs.root(), config, Box::new(token_rep))?;
    Ok((vs, model))
}

pub fn build_pipeline(config: GlinerConfig) -> anyhow::Result<GlinerModel> {
    build_pipeline_with_seed(config, 0)
}

pub fn build_pipeline_with_seed(config: GlinerConfig, seed: i64) -> anyhow::Result<GlinerModel> {
    build_pipeline_with_budget(config, seed, None)
}

pub fn build_pipeline_with_budget(
    config: GlinerConfig,
    seed: i64,
    budget: Option<i64>,
) -> anyhow::Result<GlinerModel> {
    let (vs, model) = build_model_with_budget(&config, seed, budget)?;
    Ok(GlinerModel::from_parts(vs, model, config))
}

pub fn words(text: &str) -> Vec<String> {
    text.split_whitespace().map(String::from).collect()
}
