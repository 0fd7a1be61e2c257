//! Read-only catalog of raw frames.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::core::Frame;
use crate::error::CatalogError;

/// The frames visible to one run, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    frames: Vec<Frame>,
}

/// Catalog files hold either a single frame record or an array of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum Records {
    Many(Vec<Frame>),
    One(Frame),
}

impl Catalog {
    pub fn new(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn from_json_str(name: &str, text: &str) -> Result<Self, CatalogError> {
        let records: Records =
            serde_json::from_str(text).map_err(|e| CatalogError::Parse(name.to_string(), e))?;

        Ok(match records {
            Records::Many(frames) => Self { frames },
            Records::One(frame) => Self {
                frames: vec![frame],
            },
        })
    }

    pub fn from_json_file(path: impl AsRef<Utf8Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(path.as_str(), &text)
    }

    /// Loads every JSON file matched by the pattern. Files are read in sorted
    /// path order so the arrival order is reproducible.
    pub fn from_glob(pattern: &str) -> Result<Self, CatalogError> {
        let mut paths = Vec::new();
        for entry in glob::glob(pattern)? {
            paths.push(Utf8PathBuf::try_from(entry?)?);
        }
        paths.sort();

        let mut frames = Vec::new();
        for path in paths {
            frames.extend(Self::from_json_file(&path)?.frames);
        }

        tracing::debug!("loaded {} frames from {}", frames.len(), pattern);
        Ok(Self { frames })
    }
}

impl FromIterator<Frame> for Catalog {
    fn from_iter<T: IntoIterator<Item = Frame>>(iter: T) -> Self {
        Self::new(iter)
    }
}
