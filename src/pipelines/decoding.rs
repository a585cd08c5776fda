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

//! # Decoding of thresholded predictions
//!
//! `greedy_search` resolves conflicts between overlapping span predictions, and
//! `top_k_per_pair` bounds the number of relation labels kept for every entity pair.

use std::cmp::Ordering;
use std::collections::HashMap;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

/// Span prediction over word indices (end inclusive).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanCandidate {
    pub start: usize,
    pub end: usize,
    pub label: String,
    pub score: f64,
}

impl SpanCandidate {
    pub fn new<S: Into<String>>(start: usize, end: usize, label: S, score: f64) -> SpanCandidate {
        SpanCandidate {
            start,
            end,
            label: label.into(),
            score,
        }
    }
}

/// Relation prediction between two entity spans (word indices, end inclusive).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationCandidate {
    pub head: (usize, usize),
    pub tail: (usize, usize),
    pub label: String,
    pub score: f64,
}

/// Any intersection between the two spans is a conflict.
pub fn has_overlapping(first: &SpanCandidate, second: &SpanCandidate) -> bool {
    if (first.start, first.end) == (second.start, second.end) {
        return true;
    }
    !(first.start > second.end || second.start > first.end)
}

/// Identical spans and partial crossings conflict; disjoint and nested spans do not.
pub fn has_overlapping_nested(first: &SpanCandidate, second: &SpanCandidate) -> bool {
    if (first.start, first.end) == (second.start, second.end) {
        return true;
    }
    let disjoint = first.start > second.end || second.start > first.end;
    let first_contains_second = first.start <= second.start && first.end >= second.end;
    let second_contains_first = second.start <= first.start && second.end >= first.end;
    !(disjoint || first_contains_second || second_contains_first)
}

fn by_descending_score(first: f64, second: f64) -> Ordering {
    OrderedFloat(second).cmp(&OrderedFloat(first))
}

/// Greedy conflict resolution.
///
/// Candidates are visited by decreasing score (stable on ties) and kept when they do not conflict
/// with an already kept span. With `flat_ner` any overlap is a conflict, otherwise nested spans are
/// allowed. The result is sorted by start position.
pub fn greedy_search(candidates: Vec<SpanCandidate>, flat_ner: bool) -> Vec<SpanCandidate> {
    let conflicts = if flat_ner {
        has_overlapping
    } else {
        has_overlapping_nested
    };

    let mut candidates = candidates;
    candidates.sort_by(|a, b| by_descending_score(a.score, b.score));

    let mut selected: Vec<SpanCandidate> = Vec::new();
    for candidate in candidates {
        if !selected.iter().any(|kept| conflicts(&candidate, kept)) {
            selected.push(candidate);
        }
    }
    selected.sort_by_key(|candidate| candidate.start);
    selected
}

/// Keeps at most `top_k` relation labels for every `(head, tail)` pair, by decreasing score.
/// The output is sorted by decreasing score, ties keeping their original order.
pub fn top_k_per_pair(relations: Vec<RelationCandidate>, top_k: usize) -> Vec<RelationCandidate> {
    let mut relations = relations;
    relations.sort_by(|a, b| by_descending_score(a.score, b.score));

    let mut counts: HashMap<((usize, usize), (usize, usize)), usize> = HashMap::new();
    relations
        .into_iter()
        .filter(|relation| {
            let count = counts.entry((relation.head, relation.tail)).or_insert(0);
            if *count < top_k {
                *count += 1;
                true
            } else {
                false
            }
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn span(start: usize, end: usize, label: &str, score: f64) -> SpanCandidate {
        SpanCandidate::new(start, end, label, score)
    }

    #[test]
    fn identical_spans_always_conflict() {
        let a = span(2, 4, "A", 0.9);
        let b = span(2, 4, "B", 0.8);
        assert!(has_overlapping(&a, &b));
        assert!(has_overlapping_nested(&a, &b));
        let kept = greedy_search(vec![a.clone(), b], false);
        assert_eq!(kept, vec![a]);
    }

    #[test]
    fn nested_mode_allows_nesting_only() {
        let outer = span(0, 5, "A", 0.9);
        let inner = span(1, 2, "B", 0.8);
        let crossing = span(4, 7, "C", 0.7);
        let disjoint = span(8, 9, "D", 0.6);
        let kept = greedy_search(
            vec![outer.clone(), inner.clone(), crossing, disjoint.clone()],
            false,
        );
        assert_eq!(kept, vec![outer, inner, disjoint]);
    }

    #[test]
    fn ties_keep_enumeration_order() {
        let first = span(0, 1, "A", 0.5);
        let second = span(1, 2, "B", 0.5);
        let kept = greedy_search(vec![first.clone(), second], true);
        assert_eq!(kept, vec![first]);
    }
}
