use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::config::RunOptions;
use crate::delivery::{Delivery, LogDelivery};
use crate::engine::CancelToken;
use crate::recipe::Recipes;

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = Arc<str>;

/// Flat frame header metadata. Multi-valued fields are comma delimited, e.g.
/// `dpr.type = "FLAT,FLAT,FLAT"`.
pub type Metadata = BTreeMap<String, String>;

/// Recipe options forwarded opaquely to the processing unit.
pub type Options = serde_json::Map<String, serde_json::Value>;

/// A single raw observation exposure together with its header metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Reference to the raw file, usually a path in the archive.
    pub path: Utf8PathBuf,
    /// Header keywords.
    #[serde(default)]
    pub meta: Metadata,
}

impl Frame {
    pub fn new<K, V>(path: impl Into<Utf8PathBuf>, meta: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            path: path.into(),
            meta: meta
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Returns the value of a header keyword, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }
}

/// A delivery category attached to the products of terminal tasks. Downstream
/// archival and QC systems route products by these labels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetaTarget(Cow<'static, str>);

impl MetaTarget {
    pub const SCIENCE: MetaTarget = MetaTarget(Cow::Borrowed("SCIENCE"));
    pub const QC1_CALIB: MetaTarget = MetaTarget(Cow::Borrowed("QC1_CALIB"));
    pub const QC0: MetaTarget = MetaTarget(Cow::Borrowed("QC0"));
    pub const CALCHECKER: MetaTarget = MetaTarget(Cow::Borrowed("CALCHECKER"));

    pub fn new(label: impl Into<Cow<'static, str>>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MetaTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a run needs besides the workflow and the catalog.
#[derive(Clone)]
pub struct Environment {
    pub recipes: Recipes,
    pub delivery: Arc<dyn Delivery>,
    pub options: RunOptions,
    pub cancel: CancelToken,
}

impl Environment {
    /// Products are logged on delivery and the pool uses every available
    /// core, unless configured otherwise.
    pub fn new(recipes: Recipes) -> Self {
        Self {
            recipes,
            delivery: Arc::new(LogDelivery),
            options: RunOptions::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_delivery(mut self, delivery: Arc<dyn Delivery>) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.options.workers = workers;
        self
    }

    /// Shares a cancellation token with the caller.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("recipes", &self.recipes)
            .field("options", &self.options)
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

/// A 32-byte BLAKE3 hash used to fingerprint frame groups.
///
/// Two resolutions of the same catalog yield identical fingerprints, which is
/// what makes planning reproducible across runs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    #[cfg(test)]
    pub(crate) fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Incremental hasher used to fingerprint structured values field by field.
#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl Blake3Hasher {
    /// Feeds a length-prefixed field so that `("ab", "c")` and `("a", "bc")`
    /// never collide.
    pub(crate) fn field(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        let bytes = bytes.as_ref();
        self.0.update(&(bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
        self
    }
}

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}
