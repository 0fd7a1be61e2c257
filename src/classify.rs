//! Frame classification.
//!
//! A [`ClassificationRule`] is a predicate over frame metadata which assigns a
//! category label. Rules live in a [`Classifier`] in declaration order and the
//! first rule whose predicate holds wins. Frames matching no rule are simply
//! left out of the pipeline.
//!
//! ## Multi-token values
//!
//! Header values such as `dpr.type = "WAVE,FP,FP,FP"` describe the per-fibre
//! content of one exposure. Both the expected and the actual value are split
//! on commas and compared as sequences, so `"FLAT,FLAT,FLAT"` never matches a
//! plain `"FLAT"` frame and token order matters.

use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::core::{ArcStr, Frame, Metadata};

/// The value a predicate expects for a single metadata key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expected {
    /// Exactly this (possibly multi-token) value.
    One(String),
    /// Any of these values.
    AnyOf(Vec<String>),
}

impl Expected {
    pub fn matches(&self, actual: &str) -> bool {
        match self {
            Expected::One(expected) => tokens_eq(expected, actual),
            Expected::AnyOf(options) => options.iter().any(|e| tokens_eq(e, actual)),
        }
    }
}

impl From<&str> for Expected {
    fn from(value: &str) -> Self {
        Expected::One(value.to_string())
    }
}

impl From<String> for Expected {
    fn from(value: String) -> Self {
        Expected::One(value)
    }
}

impl<const N: usize> From<[&str; N]> for Expected {
    fn from(value: [&str; N]) -> Self {
        Expected::AnyOf(value.iter().map(|v| v.to_string()).collect())
    }
}

impl From<Vec<String>> for Expected {
    fn from(value: Vec<String>) -> Self {
        Expected::AnyOf(value)
    }
}

fn tokens_eq(expected: &str, actual: &str) -> bool {
    let mut e = expected.split(',').map(str::trim);
    let mut a = actual.split(',').map(str::trim);

    loop {
        match (e.next(), a.next()) {
            (Some(x), Some(y)) if x == y => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// A named predicate over frame metadata.
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    label: ArcStr,
    predicate: Vec<(String, Expected)>,
}

impl ClassificationRule {
    pub fn new<K, V>(label: impl AsRef<str>, predicate: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Expected>,
    {
        Self {
            label: ArcStr::from(label.as_ref()),
            predicate: predicate
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// The category assigned to matching frames.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn predicate(&self) -> &[(String, Expected)] {
        &self.predicate
    }

    /// A missing key is a non-match, never an error.
    pub fn matches(&self, meta: &Metadata) -> bool {
        self.predicate.iter().all(|(key, expected)| {
            meta.get(key)
                .is_some_and(|actual| expected.matches(actual))
        })
    }

    pub(crate) fn label_arc(&self) -> ArcStr {
        self.label.clone()
    }
}

/// A frame paired with the category it was classified into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedFrame {
    pub category: ArcStr,
    pub frame: Frame,
}

/// Ordered, immutable set of classification rules.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    rules: Vec<ClassificationRule>,
}

impl Classifier {
    pub(crate) fn push(&mut self, rule: ClassificationRule) -> usize {
        self.rules.push(rule);
        self.rules.len() - 1
    }

    /// Drops every rule declared after the first `len`.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.rules.truncate(len);
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    pub(crate) fn get(&self, index: usize) -> &ClassificationRule {
        &self.rules[index]
    }

    pub(crate) fn contains(&self, label: &str) -> bool {
        self.rules.iter().any(|rule| rule.label() == label)
    }

    /// Returns the first rule, in declaration order, whose predicate holds.
    pub fn classify(&self, meta: &Metadata) -> Option<&ClassificationRule> {
        self.rules.iter().find(|rule| rule.matches(meta))
    }

    /// Classifies every frame of the catalog, preserving catalog order and
    /// dropping the unmatched ones.
    pub fn classify_all(&self, catalog: &Catalog) -> Vec<ClassifiedFrame> {
        catalog
            .frames()
            .iter()
            .filter_map(|frame| match self.classify(&frame.meta) {
                Some(rule) => Some(ClassifiedFrame {
                    category: rule.label_arc(),
                    frame: frame.clone(),
                }),
                None => {
                    tracing::trace!("frame {} matches no classification rule", frame.path);
                    None
                }
            })
            .collect()
    }
}

impl FromIterator<ClassificationRule> for Classifier {
    fn from_iter<T: IntoIterator<Item = ClassificationRule>>(iter: T) -> Self {
        Self {
            rules: iter.into_iter().collect(),
        }
    }
}
