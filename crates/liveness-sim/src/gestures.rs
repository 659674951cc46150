//! Gesture definitions for the simulated detector.
//!
//! A gesture is a `*.json` file in one of the gesture directories. The file
//! stem is the gesture's name; an optional `"label"` field gives the text
//! shown to the subject.
//!
//! ```json
//! { "label": "Blink twice" }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised while loading gesture definitions.
#[derive(Error, Debug)]
pub enum GestureError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid gesture file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Not enough gestures: {required} required, {available} available")]
    NotEnough { required: usize, available: usize },
}

#[derive(Debug, Deserialize)]
struct GestureFile {
    #[serde(default)]
    label: Option<String>,
}

/// One gesture the subject can be asked to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gesture {
    pub name: String,
    pub label: String,
}

/// All gestures available to the simulator, sorted by name.
#[derive(Debug, Clone, Default)]
pub struct GestureSet {
    gestures: Vec<Gesture>,
}

impl GestureSet {
    /// Loads every `*.json` file in `dirs`.
    ///
    /// When `allow` is non-empty only gestures named there are kept. A name
    /// found in more than one directory is taken from the first.
    pub fn load(dirs: &[PathBuf], allow: &[String]) -> Result<Self, GestureError> {
        let mut gestures: Vec<Gesture> = Vec::new();

        for dir in dirs {
            for path in json_files(dir)? {
                let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                    continue;
                };
                if !allow.is_empty() && !allow.contains(&name) {
                    debug!(gesture = %name, "Skipping gesture not in allow list");
                    continue;
                }
                if gestures.iter().any(|g| g.name == name) {
                    continue;
                }

                let contents = fs::read_to_string(&path).map_err(|source| GestureError::Read {
                    path: path.clone(),
                    source,
                })?;
                let file: GestureFile =
                    serde_json::from_str(&contents).map_err(|source| GestureError::Parse {
                        path: path.clone(),
                        source,
                    })?;

                let label = file.label.unwrap_or_else(|| name.replace('_', " "));
                gestures.push(Gesture { name, label });
            }
        }

        gestures.sort_by(|a, b| a.name.cmp(&b.name));
        info!(count = gestures.len(), "Loaded gestures");
        Ok(Self { gestures })
    }

    pub fn len(&self) -> usize {
        self.gestures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gestures.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Gesture> {
        self.gestures.iter()
    }

    /// The first `count` gestures, which make up one challenge.
    pub fn challenge(&self, count: usize) -> Result<Vec<Gesture>, GestureError> {
        if count > self.gestures.len() {
            return Err(GestureError::NotEnough {
                required: count,
                available: self.gestures.len(),
            });
        }
        Ok(self.gestures.iter().take(count).cloned().collect())
    }
}

fn json_files(dir: &Path) -> Result<Vec<PathBuf>, GestureError> {
    let entries = fs::read_dir(dir).map_err(|source| GestureError::Read {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}
