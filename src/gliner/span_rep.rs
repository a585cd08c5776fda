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
use tch::{nn, Tensor};

use crate::gliner::layers::{extract_elements, ProjectionLayer};

/// # Span marker
/// Projects the start and end word representations of every span independently,
/// concatenates them and maps the result back to the hidden size.
#[derive(Debug)]
pub struct SpanMarker {
    project_start: ProjectionLayer,
    project_end: ProjectionLayer,
    out_project: ProjectionLayer,
}

impl SpanMarker {
    pub fn new<'p, P>(p: P, hidden_size: i64, dropout: f64) -> SpanMarker
    where
        P: Borrow<nn::Path<'p>>,
    {
        let p = p.borrow();
        let project_start =
            ProjectionLayer::new(p / "project_start", hidden_size, hidden_size, dropout);
        let project_end = ProjectionLayer::new(p / "project_end", hidden_size, hidden_size, dropout);
        let out_project =
            ProjectionLayer::new(p / "out_project", hidden_size * 2, hidden_size, dropout);
        SpanMarker {
            project_start,
            project_end,
            out_project,
        }
    }

    /// Computes one representation per span.
    ///
    /// # Arguments
    ///
    /// * `hidden_states` - word representations (*batch size*, *sequence length*, *hidden size*)
    /// * `span_idx` - inclusive (start, end) word indices (*batch size*, *num spans*, 2). Indices must be
    /// valid positions: masked spans are expected to point to position 0.
    /// * `train` - boolean flag to turn on/off the dropout layers in the model.
    ///
    /// # Returns
    ///
    /// * `Tensor` of shape (*batch size*, *num spans*, *hidden size*)
    pub fn forward_t(&self, hidden_states: &Tensor, span_idx: &Tensor, train: bool) -> Tensor {
        let start_rep = self.project_start.forward_t(hidden_states, train);
        let end_rep = self.project_end.forward_t(hidden_states, train);

        let start_span_rep = extract_elements(&start_rep, &span_idx.select(2, 0));
        let end_span_rep = extract_elements(&end_rep, &span_idx.select(2, 1));

        let concatenated = Tensor::cat(&[start_span_rep, end_span_rep], -1).relu();
        self.out_project.forward_t(&concatenated, train)
    }

    /// Same as `forward_t` for the exhaustive candidate enumeration, reshaped to
    /// (*batch size*, *sequence length*, *max width*, *hidden size*).
    pub fn forward_grid(
        &self,
        hidden_states: &Tensor,
        span_idx: &Tensor,
        max_width: i64,
        train: bool,
    ) -> Tensor {
        let size = hidden_states.size();
        self.forward_t(hidden_states, span_idx, train)
            .view([size[0], size[1], max_width, size[2]])
    }
}
