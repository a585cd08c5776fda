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

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

/// Entity prediction or gold annotation: `(label, start, end, example index)`
pub type EntityKey = (String, usize, usize, usize);
/// Relation prediction or gold annotation: `(label, head span, tail span, example index)`
pub type RelationKey = (String, (usize, usize), (usize, usize), usize);

/// # Micro-averaged evaluation report
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub true_positives: usize,
    pub num_predicted: usize,
    pub num_gold: usize,
}

impl EvaluationReport {
    fn from_counts(true_positives: usize, num_predicted: usize, num_gold: usize) -> Self {
        let precision = ratio(true_positives, num_predicted);
        let recall = ratio(true_positives, num_gold);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        EvaluationReport {
            precision,
            recall,
            f1,
            true_positives,
            num_predicted,
            num_gold,
        }
    }
}

impl fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "P: {:.2}%\tR: {:.2}%\tF1: {:.2}%",
            self.precision * 100.0,
            self.recall * 100.0,
            self.f1 * 100.0
        )
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

fn micro_scores<T: Eq + Hash>(predicted: Vec<T>, gold: Vec<T>) -> EvaluationReport {
    let predicted = predicted.into_iter().collect::<HashSet<T>>();
    let gold = gold.into_iter().collect::<HashSet<T>>();
    let true_positives = predicted.intersection(&gold).count();
    EvaluationReport::from_counts(true_positives, predicted.len(), gold.len())
}

/// Micro precision, recall and F1 over exact `(label, start, end, example)` matches.
pub fn evaluate_entities(predicted: Vec<EntityKey>, gold: Vec<EntityKey>) -> EvaluationReport {
    micro_scores(predicted, gold)
}

/// Micro precision, recall and F1 over exact `(label, head, tail, example)` matches.
pub fn evaluate_relations(
    predicted: Vec<RelationKey>,
    gold: Vec<RelationKey>,
) -> EvaluationReport {
    micro_scores(predicted, gold)
}
