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

use tch::nn::{Module, ModuleT, RNN};
use tch::{nn, Kind, Tensor};

use crate::common::dropout::Dropout;

/// # Two-layer feed-forward projection
/// `linear(in, 4 * out) -> ReLU -> dropout -> linear(4 * out, out)`.
/// Sub-layers are stored under `0` and `3` so that the variable names line up
/// with a sequential container holding the activation and dropout in between.
#[derive(Debug)]
pub struct ProjectionLayer {
    linear_in: nn::Linear,
    dropout: Dropout,
    linear_out: nn::Linear,
}

impl ProjectionLayer {
    pub fn new<'p, P>(p: P, in_dim: i64, out_dim: i64, dropout: f64) -> ProjectionLayer
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();
        let linear_in = nn::linear(p / "0", in_dim, out_dim * 4, Default::default());
        let linear_out = nn::linear(p / "3", out_dim * 4, out_dim, Default::default());
        ProjectionLayer {
            linear_in,
            dropout: Dropout::new(dropout),
            linear_out,
        }
    }
}

impl ModuleT for ProjectionLayer {
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        let hidden = input.apply(&self.linear_in).relu();
        hidden
            .apply_t(&self.dropout, train)
            .apply(&self.linear_out)
    }
}

/// # Prompt type representation layer
/// `linear(h, 4h) -> dropout -> ReLU -> linear(4h, h)`, applied to the marker
/// positions of the prompt.
#[derive(Debug)]
pub struct PromptRepLayer {
    linear_in: nn::Linear,
    dropout: Dropout,
    linear_out: nn::Linear,
}

impl PromptRepLayer {
    pub fn new<'p, P>(p: P, hidden_size: i64, dropout: f64) -> PromptRepLayer
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();
        let linear_in = nn::linear(p / "0", hidden_size, hidden_size * 4, Default::default());
        let linear_out = nn::linear(p / "3", hidden_size * 4, hidden_size, Default::default());
        PromptRepLayer {
            linear_in,
            dropout: Dropout::new(dropout),
            linear_out,
        }
    }
}

impl ModuleT for PromptRepLayer {
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        input
            .apply(&self.linear_in)
            .apply_t(&self.dropout, train)
            .relu()
            .apply(&self.linear_out)
    }
}

/// # Bidirectional LSTM over word representations
/// Every example is encoded on its own true length, which is equivalent to running
/// a packed sequence; positions past the length are zero in the output.
#[derive(Debug)]
pub struct LstmSeq2SeqEncoder {
    lstm: nn::LSTM,
    output_size: i64,
}

impl LstmSeq2SeqEncoder {
    pub fn new<'p, P>(p: P, input_size: i64, hidden_size: i64) -> LstmSeq2SeqEncoder
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();
        let config = nn::RNNConfig {
            bidirectional: true,
            batch_first: true,
            ..Default::default()
        };
        let lstm = nn::lstm(p / "lstm", input_size, hidden_size, config);
        LstmSeq2SeqEncoder {
            lstm,
            output_size: hidden_size * 2,
        }
    }

    /// # Arguments
    ///
    /// * `input` - word representations of shape (*batch size*, *sequence length*, *input size*)
    /// * `lengths` - number of real positions for each example
    ///
    /// # Returns
    ///
    /// * `Tensor` of shape (*batch size*, *sequence length*, *2 x hidden size*)
    pub fn forward(&self, input: &Tensor, lengths: &[i64]) -> Tensor {
        let (_, max_len, _) = input.size3().unwrap_or((0, 0, 0));
        let outputs = lengths
            .iter()
            .enumerate()
            .map(|(index, &length)| {
                let length = length.min(max_len);
                if length == 0 {
                    return Tensor::zeros(
                        [max_len, self.output_size],
                        (input.kind(), input.device()),
                    );
                }
                let example = input.get(index as i64).narrow(0, 0, length).unsqueeze(0);
                let (encoded, _) = self.lstm.seq(&example);
                let encoded = encoded.squeeze_dim(0);
                pad_to_length(&encoded, max_len)
            })
            .collect::<Vec<Tensor>>();
        if outputs.is_empty() {
            return Tensor::zeros(
                [0, max_len, self.output_size],
                (input.kind(), input.device()),
            );
        }
        Tensor::stack(&outputs, 0)
    }
}

/// Gathers the rows of `sequence` (*batch*, *length*, *dim*) at `indices`
/// (*batch*, *k*), returning a (*batch*, *k*, *dim*) tensor.
pub fn extract_elements(sequence: &Tensor, indices: &Tensor) -> Tensor {
    let dim = sequence.size()[2];
    let expanded_indices = indices.unsqueeze(-1).expand([-1, -1, dim], true);
    sequence.gather(1, &expanded_indices, false)
}

/// Right-pads the first dimension of `tensor` with zeros up to `length`.
pub fn pad_to_length(tensor: &Tensor, length: i64) -> Tensor {
    let mut shape = tensor.size();
    let current = shape[0];
    if current >= length {
        return tensor.shallow_clone();
    }
    shape[0] = length - current;
    let padding = Tensor::zeros(shape.as_slice(), (tensor.kind(), tensor.device()));
    Tensor::cat(&[tensor.shallow_clone(), padding], 0)
}

/// Sequences padded along their first dimension and stacked into a batch.
#[derive(Debug)]
pub struct PaddedSequences {
    /// Padded tensor of shape (*batch*, *max length*, ...)
    pub padded: Tensor,
    /// Original length of every sequence
    pub lengths: Vec<i64>,
}

impl PaddedSequences {
    /// Boolean mask of shape (*batch*, *max length*) marking the real positions.
    pub fn mask(&self) -> Tensor {
        length_mask(&self.lengths, self.padded.size()[1], self.padded.device())
    }
}

/// Pads a list of tensors to the longest one (or `min_length` if larger) and stacks them.
/// `template` gives the trailing shape, kind and device when the list is empty.
pub fn pad_sequences(sequences: &[Tensor], min_length: i64, template: &Tensor) -> PaddedSequences {
    let lengths = sequences.iter().map(|s| s.size()[0]).collect::<Vec<i64>>();
    let max_length = lengths.iter().copied().max().unwrap_or(0).max(min_length);
    let padded = if sequences.is_empty() {
        let mut shape = template.size();
        shape[0] = max_length;
        shape.insert(0, 0);
        Tensor::zeros(shape.as_slice(), (template.kind(), template.device()))
    } else {
        let padded = sequences
            .iter()
            .map(|sequence| pad_to_length(sequence, max_length))
            .collect::<Vec<Tensor>>();
        Tensor::stack(&padded, 0)
    };
    PaddedSequences { padded, lengths }
}

/// `mask[b, i] = i < lengths[b]`
pub fn length_mask(lengths: &[i64], max_length: i64, device: tch::Device) -> Tensor {
    let positions = Tensor::arange(max_length, (Kind::Int64, device)).unsqueeze(0);
    let lengths = Tensor::from_slice(lengths).to(device).unsqueeze(-1);
    positions.lt_tensor(&lengths)
}

#[cfg(test)]
mod test {
    use super::*;
    use tch::Device;

    #[test]
    fn extract_elements_gathers_rows() {
        let sequence = Tensor::arange(12, (Kind::Float, Device::Cpu)).view([1, 4, 3]);
        let indices = Tensor::from_slice(&[3i64, 0]).view([1, 2]);
        let extracted = extract_elements(&sequence, &indices);
        let values = Vec::<f32>::try_from(extracted.view([-1])).unwrap();
        assert_eq!(values, vec![9., 10., 11., 0., 1., 2.]);
    }

    #[test]
    fn length_mask_marks_real_positions() {
        let mask = length_mask(&[3, 5], 5, Device::Cpu);
        let values = Vec::<i64>::try_from(mask.to_kind(Kind::Int64).view([-1])).unwrap();
        assert_eq!(values, vec![1, 1, 1, 0, 0, 1, 1, 1, 1, 1]);
    }

    #[test]
    fn pad_sequences_pads_to_longest() {
        let template = Tensor::zeros([1, 2], (Kind::Float, Device::Cpu));
        let a = Tensor::ones([1, 2], (Kind::Float, Device::Cpu));
        let b = Tensor::ones([3, 2], (Kind::Float, Device::Cpu));
        let padded = pad_sequences(&[a, b], 0, &template);
        assert_eq!(padded.padded.size(), vec![2, 3, 2]);
        assert_eq!(padded.lengths, vec![1, 3]);
        let total = f64::try_from(padded.padded.sum(Kind::Float)).unwrap();
        assert_eq!(total, 8.0);
    }
}
