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

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::GlinerError;

/// # Utility to deserialize and serialize JSON configuration files
///
/// Unknown keys are ignored on load, which allows several configuration records
/// (model and training) to share a single file.
pub trait Config
where
    Self: DeserializeOwned,
{
    /// Loads a `Config` object from a JSON file.
    ///
    /// # Arguments
    ///
    /// * `path` - `Path` to the configuration file.
    fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, GlinerError> {
        let path = path.as_ref();
        let f = File::open(path).map_err(|e| {
            GlinerError::IOError(format!(
                "could not open configuration file {}: {e}",
                path.display()
            ))
        })?;
        let br = BufReader::new(f);
        Ok(serde_json::from_reader(br)?)
    }

    /// Writes the configuration to a pretty-printed JSON file.
    fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), GlinerError>
    where
        Self: Serialize,
    {
        let f = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(f), self)?;
        Ok(())
    }
}
