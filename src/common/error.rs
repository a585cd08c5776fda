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

use std::path::PathBuf;

use rust_bert::RustBertError;
use rust_tokenizers::error::TokenizerError;
use tch::TchError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GlinerError {
    #[error("IO error: {0}")]
    IOError(String),

    #[error("Tch tensor error: {0}")]
    TchError(String),

    #[error("Tokenizer error: {0}")]
    TokenizerError(String),

    #[error("Invalid configuration error: {0}")]
    InvalidConfigurationError(String),

    #[error("Value error: {0}")]
    ValueError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("No recognized checkpoint format found in {}", .0.display())]
    CheckpointNotFound(PathBuf),

    #[error("Unsupported checkpoint {}: {1}", .0.display())]
    UnsupportedCheckpoint(PathBuf, String),
}

impl From<std::io::Error> for GlinerError {
    fn from(error: std::io::Error) -> Self {
        GlinerError::IOError(error.to_string())
    }
}

impl From<TokenizerError> for GlinerError {
    fn from(error: TokenizerError) -> Self {
        GlinerError::TokenizerError(error.to_string())
    }
}

impl From<TchError> for GlinerError {
    fn from(error: TchError) -> Self {
        GlinerError::TchError(error.to_string())
    }
}

impl From<serde_json::Error> for GlinerError {
    fn from(error: serde_json::Error) -> Self {
        GlinerError::SerializationError(error.to_string())
    }
}

impl From<RustBertError> for GlinerError {
    fn from(error: RustBertError) -> Self {
        match error {
            RustBertError::IOError(message) => GlinerError::IOError(message),
            RustBertError::TchError(message) => GlinerError::TchError(message),
            RustBertError::TokenizerError(message) => GlinerError::TokenizerError(message),
            RustBertError::ValueError(message) => GlinerError::ValueError(message),
            other => GlinerError::InvalidConfigurationError(other.to_string()),
        }
    }
}
