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

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::GlinerError;

/// # Entity span
/// Inclusive word-level span `[start, end]` with its type name.
/// Serialized as a `[start, end, label]` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(usize, usize, String)", into = "(usize, usize, String)")]
pub struct EntitySpan {
    pub start: usize,
    pub end: usize,
    pub label: String,
}

impl EntitySpan {
    pub fn new<S: Into<String>>(start: usize, end: usize, label: S) -> EntitySpan {
        EntitySpan {
            start,
            end,
            label: label.into(),
        }
    }

    pub fn position(&self) -> (usize, usize) {
        (self.start, self.end)
    }
}

impl From<(usize, usize, String)> for EntitySpan {
    fn from((start, end, label): (usize, usize, String)) -> Self {
        EntitySpan { start, end, label }
    }
}

impl From<EntitySpan> for (usize, usize, String) {
    fn from(span: EntitySpan) -> Self {
        (span.start, span.end, span.label)
    }
}

/// Relation argument, referring to an entity by its inclusive word span.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationArgument {
    pub position: [usize; 2],
}

/// # Relation annotation
/// Directed relation from `head` to `tail`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationAnnotation {
    pub head: RelationArgument,
    pub tail: RelationArgument,
    pub relation_text: String,
}

impl RelationAnnotation {
    pub fn new<S: Into<String>>(
        head: (usize, usize),
        tail: (usize, usize),
        relation_text: S,
    ) -> RelationAnnotation {
        RelationAnnotation {
            head: RelationArgument {
                position: [head.0, head.1],
            },
            tail: RelationArgument {
                position: [tail.0, tail.1],
            },
            relation_text: relation_text.into(),
        }
    }

    pub fn head_position(&self) -> (usize, usize) {
        (self.head.position[0], self.head.position[1])
    }

    pub fn tail_position(&self) -> (usize, usize) {
        (self.tail.position[0], self.tail.position[1])
    }
}

/// # Annotated (or unannotated) example
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub tokenized_text: Vec<String>,
    #[serde(default)]
    pub ner: Vec<EntitySpan>,
    #[serde(default)]
    pub relations: Vec<RelationAnnotation>,
    /// Fixed type vocabulary for this example, overriding type sampling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<Vec<String>>,
}

impl Example {
    pub fn new(tokenized_text: Vec<String>) -> Example {
        Example {
            tokenized_text,
            ..Default::default()
        }
    }

    pub fn with_entities(mut self, ner: Vec<EntitySpan>) -> Self {
        self.ner = ner;
        self
    }

    pub fn with_relations(mut self, relations: Vec<RelationAnnotation>) -> Self {
        self.relations = relations;
        self
    }

    /// Checks that all spans are ordered and lie within the token sequence.
    pub fn validate(&self) -> Result<(), GlinerError> {
        let length = self.tokenized_text.len();
        let check = |start: usize, end: usize, kind: &str| {
            if start > end || end >= length {
                Err(GlinerError::ValueError(format!(
                    "{kind} span ({start}, {end}) is invalid for a sequence of {length} tokens"
                )))
            } else {
                Ok(())
            }
        };
        for span in &self.ner {
            check(span.start, span.end, "entity")?;
        }
        for relation in &self.relations {
            let (head_start, head_end) = relation.head_position();
            let (tail_start, tail_end) = relation.tail_position();
            check(head_start, head_end, "relation head")?;
            check(tail_start, tail_end, "relation tail")?;
        }
        if !self.relations.is_empty() && self.ner.is_empty() {
            return Err(GlinerError::ValueError(
                "relations are annotated but the example has no entities".to_string(),
            ));
        }
        Ok(())
    }
}

/// # Type vocabulary
/// Ordered type names mapped to dense 1-based ids, id 0 being reserved for "no type".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeVocabulary {
    types: Vec<String>,
    ids: HashMap<String, i64>,
}

impl TypeVocabulary {
    pub fn new<S: AsRef<str>>(types: &[S]) -> Result<TypeVocabulary, GlinerError> {
        let mut vocabulary = TypeVocabulary::default();
        for type_name in types {
            let type_name = type_name.as_ref();
            if type_name.trim().is_empty() {
                return Err(GlinerError::ValueError(
                    "type names must not be empty".to_string(),
                ));
            }
            if vocabulary.ids.contains_key(type_name) {
                return Err(GlinerError::ValueError(format!(
                    "duplicate type name {type_name} in vocabulary"
                )));
            }
            vocabulary.push(type_name.to_string());
        }
        Ok(vocabulary)
    }

    /// Builds a vocabulary keeping the first occurrence of every name.
    pub(crate) fn from_unique<I: IntoIterator<Item = String>>(types: I) -> TypeVocabulary {
        let mut vocabulary = TypeVocabulary::default();
        for type_name in types {
            if !vocabulary.ids.contains_key(&type_name) {
                vocabulary.push(type_name);
            }
        }
        vocabulary
    }

    fn push(&mut self, type_name: String) {
        self.ids
            .insert(type_name.clone(), self.types.len() as i64 + 1);
        self.types.push(type_name);
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn types(&self) -> &[String] {
        &self.types
    }

    /// 1-based id of a type name
    pub fn id(&self, type_name: &str) -> Option<i64> {
        self.ids.get(type_name).copied()
    }

    /// Type name for a 1-based id
    pub fn label(&self, id: i64) -> Option<&str> {
        if id < 1 {
            return None;
        }
        self.types.get(id as usize - 1).map(String::as_str)
    }
}

/// Reads examples from a `.json` (array) or `.jsonl` (one example per line) file.
pub fn load_examples<P: AsRef<Path>>(path: P) -> Result<Vec<Example>, GlinerError> {
    let path = path.as_ref();
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .unwrap_or_default();
    let reader = BufReader::new(File::open(path)?);
    match extension {
        "json" => Ok(serde_json::from_reader(reader)?),
        "jsonl" => {
            let mut examples = Vec::new();
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                examples.push(serde_json::from_str(&line)?);
            }
            Ok(examples)
        }
        _ => Err(GlinerError::ValueError(format!(
            "invalid data format for {}, expected .json or .jsonl",
            path.display()
        ))),
    }
}
