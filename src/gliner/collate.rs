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

use std::collections::{BTreeSet, HashMap};

use rand::seq::SliceRandom;
use rand::Rng;
use tch::{Kind, Tensor};

use crate::gliner::data::{EntitySpan, Example, RelationAnnotation, TypeVocabulary};
use crate::gliner::gliner_model::{GlinerConfig, TaskMode};
use crate::gliner::rel_rep::entity_pair_indices;
use crate::GlinerError;

/// Maximum number of batch-level negative types sampled during training
const MAX_BATCH_NEGATIVES: usize = 100;

/// # Type vocabularies of a batch
pub enum BatchTypes {
    /// One vocabulary for every example (inference and evaluation)
    Shared(TypeVocabulary),
    /// One vocabulary per example (training with type sampling)
    PerExample(Vec<TypeVocabulary>),
}

impl BatchTypes {
    pub fn get(&self, index: usize) -> &TypeVocabulary {
        match self {
            BatchTypes::Shared(vocabulary) => vocabulary,
            BatchTypes::PerExample(vocabularies) => &vocabularies[index],
        }
    }
}

/// # Collated batch
/// Candidate tensors are built on the CPU and moved to the model device by the model.
pub struct GlinerBatch {
    /// Word sequences, truncated to the maximum length
    pub tokens: Vec<Vec<String>>,
    pub seq_length: Vec<i64>,
    /// NER: every candidate span (*batch size*, *max length x max width*, 2).
    /// Relation: the entity spans (*batch size*, *max entities*, 2).
    pub span_idx: Tensor,
    /// Validity of every row of `span_idx` (*batch size*, *num candidates*)
    pub span_mask: Tensor,
    /// Class ids (0 for no type, -1 for padding) of every span (NER) or entity pair (relation)
    pub labels: Tensor,
    pub types: BatchTypes,
    /// Entities kept after truncation, in the order used to enumerate pairs
    pub entities: Vec<Vec<EntitySpan>>,
    pub relations: Vec<Vec<RelationAnnotation>>,
}

impl GlinerBatch {
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Entity pairs of an example in the order of the relation scores.
    pub fn entity_pairs(&self, index: usize) -> Vec<(&EntitySpan, &EntitySpan)> {
        let entities = &self.entities[index];
        entity_pair_indices(entities.len())
            .into_iter()
            .map(|(i, j)| (&entities[i], &entities[j]))
            .collect()
    }
}

/// # Batch collator
/// Turns examples into candidate tensors, optionally sampling the type vocabulary of
/// every example (positive types, batch-level negatives, shuffling and random dropping).
#[derive(Debug, Clone)]
pub struct Collator {
    task: TaskMode,
    max_width: usize,
    max_len: usize,
    max_types: usize,
    shuffle_types: bool,
    random_drop: bool,
    max_neg_type_ratio: usize,
}

impl Collator {
    pub fn new(config: &GlinerConfig) -> Collator {
        Collator {
            task: config.task,
            max_width: config.max_width as usize,
            max_len: config.max_len,
            max_types: config.max_types,
            shuffle_types: config.shuffle_types,
            random_drop: config.random_drop,
            max_neg_type_ratio: config.max_neg_type_ratio,
        }
    }

    /// Collates examples against a single type vocabulary.
    pub fn collate_with_types<S: AsRef<str>>(
        &self,
        examples: &[Example],
        types: &[S],
    ) -> Result<GlinerBatch, GlinerError> {
        let vocabulary = TypeVocabulary::new(types)?;
        if vocabulary.is_empty() {
            return Err(GlinerError::ValueError(
                "at least one candidate label is required".to_string(),
            ));
        }
        self.build(examples, BatchTypes::Shared(vocabulary))
    }

    /// Collates training examples, sampling a type vocabulary per example.
    pub fn collate_train<R: Rng + ?Sized>(
        &self,
        examples: &[Example],
        rng: &mut R,
    ) -> Result<GlinerBatch, GlinerError> {
        let vocabularies = self.sample_types(examples, rng);
        self.build(examples, BatchTypes::PerExample(vocabularies))
    }

    fn annotated_types(&self, example: &Example) -> Vec<String> {
        match self.task {
            TaskMode::Ner => example.ner.iter().map(|span| span.label.clone()).collect(),
            TaskMode::Relation => example
                .relations
                .iter()
                .map(|relation| relation.relation_text.clone())
                .collect(),
        }
    }

    /// Samples the type vocabulary of every example of a batch.
    pub fn sample_types<R: Rng + ?Sized>(
        &self,
        examples: &[Example],
        rng: &mut R,
    ) -> Vec<TypeVocabulary> {
        let mut negatives = examples
            .iter()
            .flat_map(|example| self.annotated_types(example))
            .collect::<BTreeSet<String>>()
            .into_iter()
            .collect::<Vec<String>>();
        negatives.shuffle(rng);
        negatives.truncate(MAX_BATCH_NEGATIVES);

        examples
            .iter()
            .map(|example| {
                if let Some(fixed) = &example.label {
                    let mut fixed = fixed.clone();
                    fixed.sort();
                    return TypeVocabulary::from_unique(fixed);
                }
                let positives = self.annotated_types(example);

                let mut example_negatives = negatives.clone();
                example_negatives.shuffle(rng);
                let negative_ratio = if self.max_neg_type_ratio == 0 {
                    0
                } else {
                    rng.random_range(0..=self.max_neg_type_ratio)
                };
                example_negatives.truncate(positives.len() * negative_ratio);

                let mut types = TypeVocabulary::from_unique(
                    positives.iter().cloned().chain(example_negatives),
                )
                .types()
                .to_vec();
                if self.shuffle_types {
                    types.shuffle(rng);
                }
                if self.random_drop && !types.is_empty() {
                    let kept = rng.random_range(1..=types.len());
                    types.truncate(kept);
                }
                types.truncate(self.max_types);
                TypeVocabulary::from_unique(types)
            })
            .collect()
    }

    fn truncate(&self, example: &Example) -> Result<TruncatedExample, GlinerError> {
        example.validate()?;
        let length = example.tokenized_text.len().min(self.max_len);
        if length < example.tokenized_text.len() {
            log::warn!(
                "Sequence of {} words truncated to {}",
                example.tokenized_text.len(),
                self.max_len
            );
        }
        let entities = example
            .ner
            .iter()
            .filter(|span| span.end < length)
            .cloned()
            .collect::<Vec<EntitySpan>>();
        let relations = match self.task {
            TaskMode::Ner => Vec::new(),
            TaskMode::Relation => example
                .relations
                .iter()
                .filter(|relation| {
                    relation.head.position[1] < length && relation.tail.position[1] < length
                })
                .filter(|relation| is_upper_triangle_pair(&entities, relation))
                .cloned()
                .collect::<Vec<RelationAnnotation>>(),
        };
        Ok(TruncatedExample {
            tokens: example.tokenized_text[..length].to_vec(),
            entities,
            relations,
        })
    }

    fn build(&self, examples: &[Example], types: BatchTypes) -> Result<GlinerBatch, GlinerError> {
        if examples.is_empty() {
            return Err(GlinerError::ValueError(
                "cannot collate an empty batch".to_string(),
            ));
        }
        let truncated = examples
            .iter()
            .map(|example| self.truncate(example))
            .collect::<Result<Vec<TruncatedExample>, GlinerError>>()?;

        let (span_idx, span_mask, labels) = match self.task {
            TaskMode::Ner => self.span_candidates(&truncated, &types),
            TaskMode::Relation => self.pair_candidates(&truncated, &types),
        };

        let mut tokens = Vec::with_capacity(truncated.len());
        let mut entities = Vec::with_capacity(truncated.len());
        let mut relations = Vec::with_capacity(truncated.len());
        for example in truncated {
            tokens.push(example.tokens);
            entities.push(example.entities);
            relations.push(example.relations);
        }
        let seq_length = tokens.iter().map(|t| t.len() as i64).collect();

        Ok(GlinerBatch {
            tokens,
            seq_length,
            span_idx,
            span_mask,
            labels,
            types,
            entities,
            relations,
        })
    }

    /// Enumerates `(i, i + w)` for every position `i` of the padded batch and every width `w`.
    fn span_candidates(
        &self,
        examples: &[TruncatedExample],
        types: &BatchTypes,
    ) -> (Tensor, Tensor, Tensor) {
        let max_length = examples.iter().map(|e| e.tokens.len()).max().unwrap_or(0);
        let num_candidates = max_length * self.max_width;

        let mut span_idx = Vec::with_capacity(examples.len() * num_candidates * 2);
        let mut span_mask = Vec::with_capacity(examples.len() * num_candidates);
        let mut labels = Vec::with_capacity(examples.len() * num_candidates);
        for (index, example) in examples.iter().enumerate() {
            let vocabulary = types.get(index);
            let gold = example
                .entities
                .iter()
                .filter_map(|span| vocabulary.id(&span.label).map(|id| (span.position(), id)))
                .collect::<HashMap<(usize, usize), i64>>();
            let length = example.tokens.len();
            for start in 0..max_length {
                for width in 0..self.max_width {
                    let end = start + width;
                    span_idx.push(start as i64);
                    span_idx.push(end as i64);
                    if end < length {
                        span_mask.push(true);
                        labels.push(gold.get(&(start, end)).copied().unwrap_or(0));
                    } else {
                        span_mask.push(false);
                        labels.push(-1);
                    }
                }
            }
        }
        let batch_size = examples.len() as i64;
        (
            Tensor::from_slice(&span_idx).view([batch_size, num_candidates as i64, 2]),
            Tensor::from_slice(&span_mask).view([batch_size, num_candidates as i64]),
            Tensor::from_slice(&labels).view([batch_size, num_candidates as i64]),
        )
    }

    /// Entity spans padded to the largest entity count of the batch, and relation labels indexed
    /// over the strict upper triangle of that padded grid.
    fn pair_candidates(
        &self,
        examples: &[TruncatedExample],
        types: &BatchTypes,
    ) -> (Tensor, Tensor, Tensor) {
        let max_entities = examples.iter().map(|e| e.entities.len()).max().unwrap_or(0);
        let pairs = entity_pair_indices(max_entities);

        let mut span_idx = Vec::with_capacity(examples.len() * max_entities * 2);
        let mut span_mask = Vec::with_capacity(examples.len() * max_entities);
        let mut labels = Vec::with_capacity(examples.len() * pairs.len());
        for (index, example) in examples.iter().enumerate() {
            let vocabulary = types.get(index);
            let num_entities = example.entities.len();
            for position in 0..max_entities {
                match example.entities.get(position) {
                    Some(span) => {
                        span_idx.push(span.start as i64);
                        span_idx.push(span.end as i64);
                        span_mask.push(true);
                    }
                    None => {
                        span_idx.extend([0, 0]);
                        span_mask.push(false);
                    }
                }
            }
            let gold = example
                .relations
                .iter()
                .filter_map(|relation| {
                    vocabulary
                        .id(&relation.relation_text)
                        .map(|id| ((relation.head_position(), relation.tail_position()), id))
                })
                .collect::<HashMap<((usize, usize), (usize, usize)), i64>>();
            for &(head, tail) in &pairs {
                if tail >= num_entities {
                    labels.push(-1);
                    continue;
                }
                let key = (
                    example.entities[head].position(),
                    example.entities[tail].position(),
                );
                labels.push(gold.get(&key).copied().unwrap_or(0));
            }
        }
        let batch_size = examples.len() as i64;
        (
            Tensor::from_slice(&span_idx).view([batch_size, max_entities as i64, 2]),
            Tensor::from_slice(&span_mask).view([batch_size, max_entities as i64]),
            Tensor::from_slice(&labels).view([batch_size, pairs.len() as i64]),
        )
    }
}

/// Relation scores only exist for entity pairs `(i, j)` with `i < j` in annotation order.
/// Other relations can neither be trained nor predicted and are dropped with a warning.
fn is_upper_triangle_pair(entities: &[EntitySpan], relation: &RelationAnnotation) -> bool {
    let index = |position: (usize, usize)| {
        entities
            .iter()
            .position(|entity| entity.position() == position)
    };
    match (
        index(relation.head_position()),
        index(relation.tail_position()),
    ) {
        (Some(head), Some(tail)) if head < tail => true,
        (Some(head), Some(tail)) => {
            log::warn!(
                "Relation \"{}\" dropped: head entity {} does not precede tail entity {}",
                relation.relation_text,
                head,
                tail
            );
            false
        }
        _ => {
            log::warn!(
                "Relation \"{}\" dropped: {:?} -> {:?} is not an annotated entity pair",
                relation.relation_text,
                relation.head_position(),
                relation.tail_position()
            );
            false
        }
    }
}

struct TruncatedExample {
    tokens: Vec<String>,
    entities: Vec<EntitySpan>,
    relations: Vec<RelationAnnotation>,
}

/// Ensures span tensors live on the expected device with the expected kind.
pub(crate) fn masked_span_idx(batch: &GlinerBatch, device: tch::Device) -> Tensor {
    let span_idx = batch.span_idx.to_kind(Kind::Int64).to(device);
    let span_mask = batch.span_mask.to_kind(Kind::Int64).to(device);
    span_idx * span_mask.unsqueeze(-1)
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn words(text: &str) -> Vec<String> {
        text.split_whitespace().map(String::from).collect()
    }

    fn ner_config() -> GlinerConfig {
        GlinerConfig {
            max_width: 3,
            ..Default::default()
        }
    }

    #[test]
    fn spans_are_enumerated_per_position_and_width() -> anyhow::Result<()> {
        let collator = Collator::new(&ner_config());
        let examples = vec![
            Example::new(words("Steve Jobs founded Apple"))
                .with_entities(vec![EntitySpan::new(0, 1, "person")]),
            Example::new(words("Apple")),
        ];
        let batch = collator.collate_with_types(&examples, &["person", "organization"])?;

        assert_eq!(batch.span_idx.size(), vec![2, 12, 2]);
        let labels = Vec::<i64>::try_from(batch.labels.view([-1]))?;
        // (0, 0), (0, 1), (0, 2) then (1, 1), ...
        assert_eq!(&labels[..3], &[0, 1, 0]);
        // last position of the first example only has width 0 in range
        assert_eq!(&labels[9..12], &[0, -1, -1]);
        // second example has a single word
        assert_eq!(&labels[12..15], &[0, -1, -1]);
        assert!(labels[15..].iter().all(|&label| label == -1));
        Ok(())
    }

    #[test]
    fn unknown_types_are_labelled_none() -> anyhow::Result<()> {
        let collator = Collator::new(&ner_config());
        let examples = vec![Example::new(words("Paris is nice"))
            .with_entities(vec![EntitySpan::new(0, 0, "location")])];
        let batch = collator.collate_with_types(&examples, &["person"])?;
        let labels = Vec::<i64>::try_from(batch.labels.view([-1]))?;
        assert!(labels.iter().all(|&label| label <= 0));
        Ok(())
    }

    #[test]
    fn relation_labels_follow_padded_pair_grid() -> anyhow::Result<()> {
        let config = GlinerConfig {
            task: TaskMode::Relation,
            ..Default::default()
        };
        let collator = Collator::new(&config);
        let examples = vec![
            Example::new(words("Steve Jobs founded Apple in Cupertino"))
                .with_entities(vec![
                    EntitySpan::new(0, 1, "person"),
                    EntitySpan::new(3, 3, "organization"),
                    EntitySpan::new(5, 5, "location"),
                ])
                .with_relations(vec![
                    RelationAnnotation::new((0, 1), (3, 3), "founder of"),
                    RelationAnnotation::new((3, 3), (5, 5), "located in"),
                ]),
            Example::new(words("Marie Curie was born in Warsaw"))
                .with_entities(vec![
                    EntitySpan::new(0, 1, "person"),
                    EntitySpan::new(5, 5, "location"),
                ])
                .with_relations(vec![RelationAnnotation::new((0, 1), (5, 5), "born in")]),
        ];
        let batch =
            collator.collate_with_types(&examples, &["founder of", "located in", "born in"])?;

        assert_eq!(batch.span_idx.size(), vec![2, 3, 2]);
        let labels = Vec::<i64>::try_from(batch.labels.view([-1]))?;
        // pairs (0, 1), (0, 2), (1, 2)
        assert_eq!(labels, vec![1, 0, 2, 3, -1, -1]);
        let mask = Vec::<bool>::try_from(batch.span_mask.view([-1]))?;
        assert_eq!(mask, vec![true, true, true, true, true, false]);
        assert_eq!(batch.entity_pairs(1).len(), 1);
        Ok(())
    }

    #[test]
    fn relations_against_entity_order_are_dropped() -> anyhow::Result<()> {
        let config = GlinerConfig {
            task: TaskMode::Relation,
            ..Default::default()
        };
        let collator = Collator::new(&config);
        let examples = vec![Example::new(words("Apple was founded by Steve Jobs"))
            .with_entities(vec![
                EntitySpan::new(0, 0, "organization"),
                EntitySpan::new(4, 5, "person"),
            ])
            .with_relations(vec![
                RelationAnnotation::new((4, 5), (0, 0), "founder of"),
                RelationAnnotation::new((0, 0), (4, 5), "founded by"),
                RelationAnnotation::new((1, 1), (4, 5), "founded by"),
            ])];
        let batch = collator.collate_with_types(&examples, &["founder of", "founded by"])?;

        let labels = Vec::<i64>::try_from(batch.labels.view([-1]))?;
        assert_eq!(labels, vec![2]);
        assert_eq!(batch.relations[0].len(), 1);
        assert_eq!(batch.relations[0][0].relation_text, "founded by");
        assert_eq!(batch.relations[0][0].head_position(), (0, 0));
        Ok(())
    }

    #[test]
    fn sampled_types_respect_limits_and_fixed_labels() {
        let config = GlinerConfig {
            max_types: 2,
            ..Default::default()
        };
        let collator = Collator::new(&config);
        let mut fixed = Example::new(words("a b c"));
        fixed.label = Some(vec!["zeta".to_string(), "alpha".to_string()]);
        let examples = vec![
            Example::new(words("a b c d")).with_entities(vec![
                EntitySpan::new(0, 0, "x"),
                EntitySpan::new(1, 1, "y"),
                EntitySpan::new(2, 2, "z"),
            ]),
            fixed,
        ];
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let vocabularies = collator.sample_types(&examples, &mut rng);
            assert!(!vocabularies[0].is_empty());
            assert!(vocabularies[0].len() <= 2);
            assert_eq!(vocabularies[1].types(), &["alpha", "zeta"]);
        }
    }

    #[test]
    fn sequences_are_truncated() -> anyhow::Result<()> {
        let config = GlinerConfig {
            max_len: 2,
            max_width: 2,
            ..Default::default()
        };
        let collator = Collator::new(&config);
        let examples = vec![Example::new(words("one two three four"))
            .with_entities(vec![EntitySpan::new(2, 3, "number")])];
        let batch = collator.collate_with_types(&examples, &["number"])?;
        assert_eq!(batch.seq_length, vec![2]);
        assert!(batch.entities[0].is_empty());
        Ok(())
    }

    #[test]
    fn empty_batch_is_rejected() {
        let collator = Collator::new(&ner_config());
        assert!(collator.collate_with_types(&[], &["person"]).is_err());
    }
}
