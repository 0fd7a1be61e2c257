use std::sync::Arc;

use thiserror::Error;

use crate::engine::InstanceReport;

/// Errors detected while assembling a workflow. All of them are fatal and are
/// raised before anything is executed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Classification rule '{0}' is declared more than once")]
    DuplicateRule(String),

    #[error("Task '{0}' is declared more than once in the same scope")]
    DuplicateTask(String),

    #[error("Data source '{0}' is declared more than once")]
    DuplicateSource(String),

    #[error("Task '{0}' has no recipe")]
    MissingRecipe(String),

    #[error("Task '{0}' has no main input")]
    MissingMainInput(String),

    #[error("Data source has no classification rule")]
    MissingClassificationRule,

    #[error("Task '{task}' references an input that was not declared in this workflow")]
    UnknownInput { task: String },

    #[error("Task '{task}' in subworkflow '{scope}' references '{input}', which is not a parameter of the subworkflow")]
    UndeclaredSubworkflowInput {
        scope: String,
        task: String,
        input: String,
    },

    #[error("'{from}' references unknown {kind} '{name}'")]
    UnknownReference {
        from: String,
        kind: &'static str,
        name: String,
    },

    #[error("Cyclic dependency through '{0}'")]
    Cycle(String),

    #[error("Task '{task}' uses recipe '{recipe}', which is not registered")]
    UnknownRecipe { task: String, recipe: String },
}

/// Why a single task instantiation ended up failed. Failures are recorded
/// together with their cause and never unwind the whole run.
#[derive(Debug, Error, Clone)]
pub enum TaskError {
    #[error("Missing associated input from '{0}'")]
    MissingAssociatedInput(String),

    #[error("Recipe '{recipe}' failed: {error}")]
    Recipe {
        recipe: String,
        error: Arc<anyhow::Error>,
    },

    #[error("Recipe '{0}' returned no products")]
    InvalidOutput(String),

    #[error("Recipe '{recipe}' panicked: {message}")]
    Panicked { recipe: String, message: String },

    #[error("Upstream '{producer}' failed")]
    UpstreamFailed {
        producer: String,
        cause: Box<TaskError>,
    },

    /// The recipe returned [`Cancelled`](crate::Cancelled). The scheduler settles the
    /// instantiation as cancelled rather than failed.
    #[error("Recipe '{0}' stopped on cancellation")]
    Cancelled(String),
}

/// Returned by a recipe that stops early because the run was cancelled.
///
/// ```rust,ignore
/// if inv.is_cancelled() {
///     return Err(tenmon::Cancelled.into());
/// }
/// ```
#[derive(Debug, Error, Clone, Copy, Default, PartialEq, Eq)]
#[error("cancelled")]
pub struct Cancelled;

impl TaskError {
    /// Walks the causal chain, starting with this error and ending with the
    /// root failure.
    pub fn chain(&self) -> Vec<&TaskError> {
        let mut acc = vec![self];
        let mut current = self;

        while let TaskError::UpstreamFailed { cause, .. } = current {
            acc.push(cause);
            current = cause;
        }

        acc
    }

    /// The innermost failure, i.e. the one that actually happened.
    pub fn root(&self) -> &TaskError {
        self.chain().last().copied().unwrap_or(self)
    }
}

/// A run in which at least one meta-tagged product failed.
#[derive(Debug, Error)]
#[error("{} meta-tagged instantiation(s) failed", failed.len())]
pub struct RunFailure {
    /// The failed meta-tagged instantiations.
    pub failed: Vec<InstanceReport>,
    /// The complete report of the run.
    pub report: Box<crate::RunReport>,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Failure(#[from] RunFailure),

    /// The run was cancelled before every meta-tagged instantiation
    /// succeeded. Products finished before the cancellation were delivered.
    #[error("Run was cancelled, {} meta-tagged instantiation(s) did not complete", report.missing_outputs().len())]
    Cancelled { report: Box<crate::RunReport> },

    #[error("Delivery of '{0}' failed:\n{1}")]
    Delivery(String, anyhow::Error),

    #[error("Couldn't build the worker pool.\n{0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Couldn't read catalog file.\n{0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("Couldn't parse catalog '{0}'.\n{1}")]
    Parse(String, serde_json::Error),
}

#[derive(Debug, Error)]
pub enum DeclError {
    #[error("Couldn't read workflow declaration.\n{0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Couldn't parse workflow declaration.\n{0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}
