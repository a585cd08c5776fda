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

use lazy_static::lazy_static;
use regex::Regex;
use rust_tokenizers::{Offset, OffsetSize};

const DEFAULT_WORD_PATTERN: &str = r"\w+(?:[-_]\w+)*|\S";

lazy_static! {
    static ref WORD_PATTERN: Regex = Regex::new(DEFAULT_WORD_PATTERN).unwrap();
}

/// Word of a raw text, with character offsets (end exclusive).
#[derive(Debug, Clone, PartialEq)]
pub struct Word {
    pub text: String,
    pub offset: Offset,
}

/// # Word splitter
/// Splits raw text into words (runs of word characters, possibly joined by hyphens or
/// underscores) and single non-space characters.
#[derive(Debug, Clone)]
pub struct WordSplitter {
    pattern: Regex,
}

impl Default for WordSplitter {
    fn default() -> Self {
        WordSplitter {
            pattern: WORD_PATTERN.clone(),
        }
    }
}

impl WordSplitter {
    pub fn new(pattern: Option<Regex>) -> WordSplitter {
        WordSplitter {
            pattern: pattern.unwrap_or_else(|| WORD_PATTERN.clone()),
        }
    }

    pub fn split(&self, text: &str) -> Vec<Word> {
        let mut words = Vec::new();
        let mut byte_cursor = 0;
        let mut char_cursor = 0;
        for hit in self.pattern.find_iter(text) {
            char_cursor += text[byte_cursor..hit.start()].chars().count();
            let begin = char_cursor;
            char_cursor += hit.as_str().chars().count();
            byte_cursor = hit.end();
            words.push(Word {
                text: hit.as_str().to_string(),
                offset: Offset {
                    begin: begin as OffsetSize,
                    end: char_cursor as OffsetSize,
                },
            });
        }
        words
    }
}

/// Substring of `text` between two character offsets.
pub(crate) fn char_slice(text: &str, begin: usize, end: usize) -> String {
    text.chars().skip(begin).take(end.saturating_sub(begin)).collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn splits_words_and_punctuation() {
        let words = WordSplitter::default().split("Apple Inc. was founded by Steve Jobs.");
        let texts = words.iter().map(|w| w.text.as_str()).collect::<Vec<&str>>();
        assert_eq!(
            texts,
            vec!["Apple", "Inc", ".", "was", "founded", "by", "Steve", "Jobs", "."]
        );
        assert_eq!(words[0].offset, Offset { begin: 0, end: 5 });
        assert_eq!(words[2].offset, Offset { begin: 9, end: 10 });
        assert_eq!(words[7].offset, Offset { begin: 32, end: 36 });
    }

    #[test]
    fn keeps_hyphenated_words_together() {
        let words = WordSplitter::default().split("state-of-the-art snake_case");
        assert_eq!(words.len(), 2);
        assert_eq!(words[0].text, "state-of-the-art");
        assert_eq!(words[1].text, "snake_case");
    }

    #[test]
    fn offsets_count_characters() {
        let text = "Zoë visited Zürich";
        let words = WordSplitter::default().split(text);
        assert_eq!(words[1].offset, Offset { begin: 4, end: 11 });
        assert_eq!(words[2].offset, Offset { begin: 12, end: 18 });
        assert_eq!(char_slice(text, 12, 18), "Zürich");
    }
}
