//! Run options and the declarative workflow format.
//!
//! A workflow can be declared in code through [`Blueprint`] or loaded from a
//! JSON document:
//!
//! ```json
//! {
//!   "rules": [
//!     { "label": "BIAS", "predicate": { "instrume": "ANDES", "dpr.type": "BIAS" } }
//!   ],
//!   "sources": [
//!     { "name": "bias", "rule": "BIAS", "match_keywords": ["instrume"] }
//!   ],
//!   "tasks": [
//!     {
//!       "name": "bias",
//!       "recipe": "andes_cal_bias",
//!       "main_input": { "source": "bias" },
//!       "meta_targets": ["QC1_CALIB"]
//!     }
//!   ]
//! }
//! ```
//!
//! Tasks may be listed in any order; they are wired in dependency order.

use std::collections::{BTreeMap, HashMap};

use camino::Utf8Path;
use petgraph::Graph;
use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};

use crate::blueprint::Blueprint;
use crate::classify::Expected;
use crate::core::{MetaTarget, Options};
use crate::engine::{Input, SourceHandle, TaskHandle};
use crate::error::{ConfigurationError, DeclError};

/// Executor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Size of the worker pool.
    pub workers: usize,
    /// Draw progress bars for the run and the running tasks.
    pub progress: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            progress: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDecl {
    pub label: String,
    pub predicate: BTreeMap<String, Expected>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDecl {
    pub name: String,
    /// Label of the classification rule.
    pub rule: String,
    #[serde(default)]
    pub match_keywords: Vec<String>,
}

/// Reference to a data source or a task by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefDecl {
    Source(String),
    Task(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociatedDecl {
    pub input: RefDecl,
    #[serde(default)]
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDecl {
    pub name: String,
    pub recipe: String,
    pub main_input: RefDecl,
    #[serde(default)]
    pub associated: Vec<AssociatedDecl>,
    #[serde(default)]
    pub options: Options,
    #[serde(default)]
    pub meta_targets: Vec<MetaTarget>,
}

impl TaskDecl {
    fn references(&self) -> impl Iterator<Item = &RefDecl> {
        std::iter::once(&self.main_input).chain(self.associated.iter().map(|a| &a.input))
    }
}

/// A workflow declared as data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDecl {
    #[serde(default)]
    pub rules: Vec<RuleDecl>,
    #[serde(default)]
    pub sources: Vec<SourceDecl>,
    #[serde(default)]
    pub tasks: Vec<TaskDecl>,
}

impl WorkflowDecl {
    pub fn from_json_str(text: &str) -> Result<Self, DeclError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_json_file(path: impl AsRef<Utf8Path>) -> Result<Self, DeclError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Replays the declaration on a fresh [`Blueprint`].
    pub fn compile(&self) -> Result<Blueprint, ConfigurationError> {
        let mut bp = Blueprint::new();

        let mut rules = HashMap::new();
        for rule in &self.rules {
            let handle = bp.classification_rule(&rule.label, rule.predicate.clone())?;
            rules.insert(rule.label.as_str(), handle);
        }

        let mut sources: HashMap<&str, SourceHandle> = HashMap::new();
        for source in &self.sources {
            if sources.contains_key(source.name.as_str()) {
                return Err(ConfigurationError::DuplicateSource(source.name.clone()));
            }

            let rule = rules.get(source.rule.as_str()).copied().ok_or_else(|| {
                ConfigurationError::UnknownReference {
                    from: source.name.clone(),
                    kind: "classification rule",
                    name: source.rule.clone(),
                }
            })?;

            let handle = bp
                .data_source()
                .with_classification_rule(rule)
                .with_match_keywords(source.match_keywords.iter().cloned())
                .build()?;
            sources.insert(source.name.as_str(), handle);
        }

        let mut tasks: HashMap<&str, TaskHandle> = HashMap::new();
        for index in self.order(&sources)? {
            let decl = &self.tasks[index];
            let lookup = |reference: &RefDecl| -> Result<Input, ConfigurationError> {
                let found = match reference {
                    RefDecl::Source(name) => sources.get(name.as_str()).copied().map(Input::from),
                    RefDecl::Task(name) => tasks.get(name.as_str()).copied().map(Input::from),
                };
                found.ok_or_else(|| unknown(decl, reference))
            };

            let mut def = bp
                .task(&decl.name)
                .with_recipe(&decl.recipe)
                .with_main_input(lookup(&decl.main_input)?)
                .with_options(decl.options.clone())
                .with_meta_targets(decl.meta_targets.iter().cloned());

            for item in &decl.associated {
                let input = lookup(&item.input)?;
                def = if item.optional {
                    def.with_optional_associated_input(input)
                } else {
                    def.with_associated_input(input)
                };
            }

            let handle = def.build()?;
            tasks.insert(decl.name.as_str(), handle);
        }

        Ok(bp)
    }

    /// Orders the task declarations so that every producer comes before its
    /// consumers.
    fn order(&self, sources: &HashMap<&str, SourceHandle>) -> Result<Vec<usize>, ConfigurationError> {
        let mut graph: Graph<usize, ()> = Graph::new();
        let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();

        for (i, decl) in self.tasks.iter().enumerate() {
            if nodes.insert(decl.name.as_str(), graph.add_node(i)).is_some() {
                return Err(ConfigurationError::DuplicateTask(decl.name.clone()));
            }
        }

        for decl in &self.tasks {
            let consumer = nodes[decl.name.as_str()];

            for reference in decl.references() {
                match reference {
                    RefDecl::Source(name) if sources.contains_key(name.as_str()) => {}
                    RefDecl::Task(name) if nodes.contains_key(name.as_str()) => {
                        graph.add_edge(nodes[name.as_str()], consumer, ());
                    }
                    _ => return Err(unknown(decl, reference)),
                }
            }
        }

        petgraph::algo::toposort(&graph, None)
            .map(|order| order.into_iter().map(|node| graph[node]).collect())
            .map_err(|cycle| ConfigurationError::Cycle(self.tasks[graph[cycle.node_id()]].name.clone()))
    }
}

fn unknown(decl: &TaskDecl, reference: &RefDecl) -> ConfigurationError {
    let (kind, name) = match reference {
        RefDecl::Source(name) => ("data source", name),
        RefDecl::Task(name) => ("task", name),
    };

    ConfigurationError::UnknownReference {
        from: decl.name.clone(),
        kind,
        name: name.clone(),
    }
}
