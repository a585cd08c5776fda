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

use tch::nn::ModuleT;
use tch::{nn, Device, Kind, Tensor};

use crate::gliner::layers::ProjectionLayer;
use crate::gliner::span_rep::SpanMarker;

/// Unordered entity pairs `(i, j)` with `i < j`, enumerated row by row.
/// This is the order used to index relation labels and decoded predictions.
pub fn entity_pair_indices(num_entities: usize) -> Vec<(usize, usize)> {
    let mut pairs = Vec::with_capacity(num_entities * num_entities.saturating_sub(1) / 2);
    for i in 0..num_entities {
        for j in (i + 1)..num_entities {
            pairs.push((i, j));
        }
    }
    pairs
}

fn triu_flat_indices(num_entities: i64, device: Device) -> Tensor {
    Tensor::ones([num_entities, num_entities], (Kind::Int64, device))
        .triu(1)
        .view([-1])
        .nonzero()
        .squeeze_dim(1)
}

/// Forms the full (*N*, *N*) grid of concatenated `(element_i, element_j)` rows and keeps
/// the strict upper triangle.
///
/// # Arguments
///
/// * `elements` - (*batch size*, *N*, *dim*)
///
/// # Returns
///
/// * `Tensor` of shape (*batch size*, *N x (N - 1) / 2*, *2 x dim*)
pub fn upper_triangular_pairs(elements: &Tensor) -> Tensor {
    let size = elements.size();
    let (batch_size, num_entities, dim) = (size[0], size[1], size[2]);
    let heads = elements
        .unsqueeze(2)
        .expand([batch_size, num_entities, num_entities, dim], false);
    let tails = elements
        .unsqueeze(1)
        .expand([batch_size, num_entities, num_entities, dim], false);
    let grid = Tensor::cat(&[heads, tails], 3).reshape([
        batch_size,
        num_entities * num_entities,
        2 * dim,
    ]);
    grid.index_select(1, &triu_flat_indices(num_entities, elements.device()))
}

/// Mean of the hidden states strictly between the two spans of every entity pair.
/// Pairs without any position in between (adjacent, overlapping or nested spans) get a zero vector.
///
/// # Returns
///
/// * `Tensor` of shape (*batch size*, *num pairs*, *hidden size*)
pub fn context_between_pairs(hidden_states: &Tensor, span_idx: &Tensor) -> Tensor {
    let pair_spans = upper_triangular_pairs(span_idx);
    let first_end = pair_spans.select(2, 1);
    let second_end = pair_spans.select(2, 3);
    let lower = first_end.minimum(&second_end) + 1;
    let upper = pair_spans.select(2, 0).maximum(&pair_spans.select(2, 2));

    let seq_len = hidden_states.size()[1];
    let positions =
        Tensor::arange(seq_len, (Kind::Int64, hidden_states.device())).view([1, 1, -1]);
    let window = positions
        .ge_tensor(&lower.unsqueeze(-1))
        .logical_and(&positions.lt_tensor(&upper.unsqueeze(-1)))
        .to_kind(hidden_states.kind());
    let counts = window
        .sum_dim_intlist([-1].as_slice(), true, hidden_states.kind())
        .clamp_min(1.0);
    window.matmul(hidden_states) / counts
}

/// # Relation (entity pair) marker
/// Entity representations come from a span marker applied to the supplied entity spans.
/// Pair representations are the projected concatenation of the two entity representations,
/// optionally with the pooled context between them in the middle.
#[derive(Debug)]
pub struct RelationMarker {
    span_marker: SpanMarker,
    out_project: ProjectionLayer,
    hidden_size: i64,
    with_context: bool,
}

impl RelationMarker {
    pub fn new<'p, P>(p: P, hidden_size: i64, dropout: f64, with_context: bool) -> RelationMarker
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();
        let span_marker = SpanMarker::new(p / "span_marker", hidden_size, dropout);
        let input_size = if with_context {
            hidden_size * 3
        } else {
            hidden_size * 2
        };
        let out_project = ProjectionLayer::new(p / "out_project", input_size, hidden_size, dropout);
        RelationMarker {
            span_marker,
            out_project,
            hidden_size,
            with_context,
        }
    }

    /// # Arguments
    ///
    /// * `hidden_states` - word representations (*batch size*, *sequence length*, *hidden size*)
    /// * `span_idx` - entity spans (*batch size*, *num entities*, 2), padded entities pointing to 0
    /// * `train` - boolean flag to turn on/off the dropout layers in the model.
    ///
    /// # Returns
    ///
    /// * `Tensor` of shape (*batch size*, *num entities x (num entities - 1) / 2*, *hidden size*)
    pub fn forward_t(&self, hidden_states: &Tensor, span_idx: &Tensor, train: bool) -> Tensor {
        let entity_reps = self.span_marker.forward_t(hidden_states, span_idx, train);
        let pairs = upper_triangular_pairs(&entity_reps);
        let pairs = if self.with_context {
            let heads = pairs.narrow(2, 0, self.hidden_size);
            let tails = pairs.narrow(2, self.hidden_size, self.hidden_size);
            let context = context_between_pairs(hidden_states, span_idx);
            Tensor::cat(&[heads, context, tails], 2)
        } else {
            pairs
        };
        self.out_project.forward_t(&pairs, train)
    }
}
