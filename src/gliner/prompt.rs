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

use tch::Tensor;

use crate::gliner::data::TypeVocabulary;
use crate::gliner::layers::{length_mask, pad_sequences};

/// # Prompt injector
/// Prepends `[MARKER, type_1, ..., MARKER, type_k, SEPARATOR]` to every word sequence.
#[derive(Debug, Clone)]
pub struct PromptInjector {
    marker_token: String,
    separator_token: String,
}

/// Word sequences with their prompt, and the offsets needed to split the encoder output.
#[derive(Debug, Clone)]
pub struct PromptedBatch {
    /// Prompt followed by the text words
    pub tokens: Vec<Vec<String>>,
    /// Prompt + text length
    pub lengths: Vec<i64>,
    /// Prompt length (`2 x num types + 1`), i.e. the offset of the first text word
    pub offsets: Vec<i64>,
    pub text_lengths: Vec<i64>,
    pub num_types: Vec<i64>,
}

/// Encoder output split back into its text and prompt parts.
#[derive(Debug)]
pub struct PromptSplit {
    /// (*batch size*, *max text length*, *hidden size*)
    pub word_rep: Tensor,
    /// (*batch size*, *max text length*)
    pub word_mask: Tensor,
    /// Marker representations (*batch size*, *max num types*, *hidden size*)
    pub type_rep: Tensor,
    /// `true` for real type slots (*batch size*, *max num types*)
    pub entity_type_mask: Tensor,
}

impl PromptInjector {
    pub fn new<S: Into<String>>(marker_token: S, separator_token: S) -> PromptInjector {
        PromptInjector {
            marker_token: marker_token.into(),
            separator_token: separator_token.into(),
        }
    }

    pub fn marker_token(&self) -> &str {
        &self.marker_token
    }

    pub fn separator_token(&self) -> &str {
        &self.separator_token
    }

    pub fn prompt(&self, vocabulary: &TypeVocabulary) -> Vec<String> {
        let mut prompt = Vec::with_capacity(vocabulary.len() * 2 + 1);
        for type_name in vocabulary.types() {
            prompt.push(self.marker_token.clone());
            prompt.push(type_name.clone());
        }
        prompt.push(self.separator_token.clone());
        prompt
    }

    pub fn inject<'a, I>(&self, tokens: &[Vec<String>], vocabularies: I) -> PromptedBatch
    where
        I: IntoIterator<Item = &'a TypeVocabulary>,
    {
        let mut prompted = PromptedBatch {
            tokens: Vec::with_capacity(tokens.len()),
            lengths: Vec::with_capacity(tokens.len()),
            offsets: Vec::with_capacity(tokens.len()),
            text_lengths: Vec::with_capacity(tokens.len()),
            num_types: Vec::with_capacity(tokens.len()),
        };
        for (words, vocabulary) in tokens.iter().zip(vocabularies) {
            let mut sequence = self.prompt(vocabulary);
            let offset = sequence.len() as i64;
            sequence.extend(words.iter().cloned());
            prompted.lengths.push(sequence.len() as i64);
            prompted.offsets.push(offset);
            prompted.text_lengths.push(words.len() as i64);
            prompted.num_types.push(vocabulary.len() as i64);
            prompted.tokens.push(sequence);
        }
        prompted
    }
}

impl PromptedBatch {
    /// Text positions `[offset, offset + text length)` of one example.
    pub fn text_slice(&self, encoded: &Tensor, index: usize) -> Tensor {
        encoded
            .get(index as i64)
            .narrow(0, self.offsets[index], self.text_lengths[index])
    }

    /// Marker positions `0, 2, ..., offset - 3` of one example.
    pub fn type_slice(&self, encoded: &Tensor, index: usize) -> Tensor {
        let prefix_length = self.offsets[index] - 1;
        encoded
            .get(index as i64)
            .slice(0, 0, prefix_length, 2)
    }

    /// Splits the encoder output into padded text and type representations.
    ///
    /// # Arguments
    ///
    /// * `embeddings` - (*batch size*, *max prompted length*, *hidden size*)
    /// * `mask` - (*batch size*, *max prompted length*)
    pub fn split(&self, embeddings: &Tensor, mask: &Tensor) -> PromptSplit {
        let batch_size = self.tokens.len();
        let word_template = embeddings.get(0).narrow(0, 0, 0);
        let mask_template = mask.get(0).narrow(0, 0, 0);

        let words = (0..batch_size)
            .map(|index| self.text_slice(embeddings, index))
            .collect::<Vec<Tensor>>();
        let word_masks = (0..batch_size)
            .map(|index| self.text_slice(mask, index))
            .collect::<Vec<Tensor>>();
        let types = (0..batch_size)
            .map(|index| self.type_slice(embeddings, index))
            .collect::<Vec<Tensor>>();

        let word_rep = pad_sequences(&words, 0, &word_template);
        let word_mask = pad_sequences(&word_masks, 0, &mask_template);
        let type_rep = pad_sequences(&types, 0, &word_template);
        let max_types = type_rep.padded.size()[1];
        let entity_type_mask = length_mask(&self.num_types, max_types, embeddings.device());

        PromptSplit {
            word_rep: word_rep.padded,
            word_mask: word_mask.padded,
            type_rep: type_rep.padded,
            entity_type_mask,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tch::{Device, Kind};

    fn injector() -> PromptInjector {
        PromptInjector::new("<<ENT>>", "<<SEP>>")
    }

    #[test]
    fn prompt_alternates_markers_and_types() -> anyhow::Result<()> {
        let vocabulary = TypeVocabulary::new(&["person", "organization"])?;
        assert_eq!(
            injector().prompt(&vocabulary),
            vec!["<<ENT>>", "person", "<<ENT>>", "organization", "<<SEP>>"]
        );
        Ok(())
    }

    #[test]
    fn split_recovers_text_and_marker_positions() -> anyhow::Result<()> {
        let short = TypeVocabulary::new(&["a"])?;
        let long = TypeVocabulary::new(&["a", "b"])?;
        let tokens = vec![
            vec!["x".to_string(), "y".to_string()],
            vec!["z".to_string()],
        ];
        let prompted = injector().inject(&tokens, [&short, &long]);
        assert_eq!(prompted.offsets, vec![3, 5]);
        assert_eq!(prompted.lengths, vec![5, 6]);

        // every position encodes its own index
        let embeddings = Tensor::arange(6, (Kind::Float, Device::Cpu))
            .view([1, 6, 1])
            .repeat([2, 1, 1]);
        let mask = Tensor::ones([2, 6], (Kind::Bool, Device::Cpu));
        let split = prompted.split(&embeddings, &mask);

        assert_eq!(split.word_rep.size(), vec![2, 2, 1]);
        let words = Vec::<f32>::try_from(split.word_rep.view([-1]))?;
        assert_eq!(words, vec![3., 4., 5., 0.]);
        let types = Vec::<f32>::try_from(split.type_rep.view([-1]))?;
        assert_eq!(types, vec![0., 0., 0., 2.]);
        let type_mask = Vec::<bool>::try_from(split.entity_type_mask.view([-1]))?;
        assert_eq!(type_mask, vec![true, false, true, true]);
        Ok(())
    }
}
