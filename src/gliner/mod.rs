//! # GLiNER: prompt-based span classification
//!
//! Model building blocks shared by the named entity recognition and relation extraction
//! pipelines. The type vocabulary is serialized as a prompt (`<<ENT>> type_1 <<ENT>> type_2 ... <<SEP>>`)
//! prepended to the words of every example. After encoding, the marker positions give one
//! representation per type and the text positions are contextualized by a bidirectional LSTM.
//! Candidates are then scored against every type with a dot product:
//! - for entity recognition, every span up to `max_width` words (`SpanMarker`),
//! - for relation extraction, every unordered pair of the supplied entities (`RelationMarker`),
//!   enumerated over the strict upper triangle of the entity grid.
//!
//! The model is trained with a masked, summed multi-label binary cross-entropy
//! (`span_classification_loss`).
//!
//! The word representations are provided by an implementation of `TokenRepresentation`;
//! `TransformerTokenRep` wraps a BERT or DeBERTa (v2/v3) backbone.

mod collate;
mod data;
mod gliner_model;
mod layers;
mod loss;
mod prompt;
mod rel_rep;
mod span_rep;
mod token_rep;

pub use collate::{BatchTypes, Collator, GlinerBatch};
pub use data::{
    load_examples, EntitySpan, Example, RelationAnnotation, RelationArgument, TypeVocabulary,
};
pub use gliner_model::{
    Gliner, GlinerConfig, ScoreOutput, ScoringHead, SpanMode, TaskMode, ENCODER_GROUP, HEAD_GROUP,
};
pub use layers::{
    extract_elements, length_mask, pad_sequences, LstmSeq2SeqEncoder, PaddedSequences,
    ProjectionLayer, PromptRepLayer,
};
pub use loss::{one_hot_labels, span_classification_loss};
pub use prompt::{PromptInjector, PromptSplit, PromptedBatch};
pub use rel_rep::{context_between_pairs, entity_pair_indices, upper_triangular_pairs, RelationMarker};
pub use span_rep::SpanMarker;
pub use token_rep::{
    EncoderConfig, EncoderType, SubTokenPooling, TokenRepOutput, TokenRepresentation,
    TransformerTokenRep, TransformerTokenRepConfig,
};
