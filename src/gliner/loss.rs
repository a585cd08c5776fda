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

use tch::{Kind, Reduction, Tensor};

/// One-hot targets (*num candidates*, *num classes*) for 1-based class ids.
/// Id 0 ("no type") and padding (-1) both map to an all-zero row.
pub fn one_hot_labels(labels: &Tensor, num_classes: i64) -> Tensor {
    let labels = labels.reshape([-1]);
    let padding = labels.eq(-1);
    labels
        .masked_fill(&padding, 0)
        .one_hot(num_classes + 1)
        .to_kind(Kind::Float)
        .narrow(1, 1, num_classes)
}

/// Masked multi-label binary cross-entropy, summed over all surviving cells.
///
/// Cells of padding type slots (`entity_type_mask`) and of padding candidates
/// (label -1) are set to exactly zero; positive cells are weighted 2, negative cells 1.
/// No averaging is applied and a NaN result is returned as is.
///
/// # Arguments
///
/// * `scores` - logits (*batch size*, *num candidates*, *num classes*)
/// * `labels` - class ids (*batch size*, *num candidates*)
/// * `entity_type_mask` - real type slots (*batch size*, *num classes*)
pub fn span_classification_loss(
    scores: &Tensor,
    labels: &Tensor,
    entity_type_mask: &Tensor,
) -> Tensor {
    let size = scores.size();
    let (batch_size, num_candidates, num_classes) = (size[0], size[1], size[2]);
    let device = scores.device();

    let logits = scores.reshape([-1, num_classes]);
    let labels = labels.reshape([-1]).to(device);
    let candidate_mask = labels.ne(-1);
    let targets = one_hot_labels(&labels, num_classes);

    let losses = logits.binary_cross_entropy_with_logits::<Tensor>(
        &targets,
        None,
        None,
        Reduction::None,
    );

    let type_mask = entity_type_mask
        .to(device)
        .to_kind(Kind::Bool)
        .unsqueeze(1)
        .expand([batch_size, num_candidates, num_classes], false)
        .reshape([-1, num_classes]);
    let keep = type_mask.logical_and(&candidate_mask.unsqueeze(-1));
    let weights = &targets + 1.0;

    (losses * weights)
        .masked_fill(&keep.logical_not(), 0.0)
        .sum(Kind::Float)
}
