//! Task graph abstractions.
//!
//! A [`Blueprint`](crate::Blueprint) hands out lightweight, copyable handles
//! for everything declared in it: [`RuleHandle`] for classification rules,
//! [`SourceHandle`] for data sources and [`TaskHandle`] for tasks. Handles are
//! the only way to wire inputs, so a task can never reference a producer that
//! does not exist yet. Every handle remembers which blueprint issued it, which
//! lets the builder reject handles smuggled in from another blueprint.

mod plan;
pub(crate) mod runner;
mod state;

use petgraph::graph::NodeIndex;

use crate::core::{ArcStr, MetaTarget, Options};

pub use plan::{Instance, Plan};
pub use runner::{InstanceReport, RunReport, TaskExecution};
pub use state::{CancelToken, Status};

pub(crate) use plan::Binding;
pub(crate) use state::StateTable;

/// Reference to a declared classification rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleHandle {
    pub(crate) owner: u64,
    pub(crate) index: usize,
}

/// Reference to a declared data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceHandle {
    pub(crate) owner: u64,
    pub(crate) index: usize,
}

/// A type-safe reference to a task in the workflow graph.
///
/// A `TaskHandle` stands for the future output of a task. Passing it as the
/// main or associated input of another task creates a dependency edge; the
/// executor guarantees that the producer finishes before the consumer starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub(crate) owner: u64,
    pub(crate) index: NodeIndex,
}

impl TaskHandle {
    /// Returns the underlying `NodeIndex` of the task in the graph.
    pub fn index(&self) -> NodeIndex {
        self.index
    }
}

/// Anything that can feed a task: raw frames from a data source or the
/// product of another task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Source(SourceHandle),
    Task(TaskHandle),
}

impl From<SourceHandle> for Input {
    fn from(value: SourceHandle) -> Self {
        Input::Source(value)
    }
}

impl From<TaskHandle> for Input {
    fn from(value: TaskHandle) -> Self {
        Input::Task(value)
    }
}

/// An input after it was checked against the blueprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputRef {
    Source(usize),
    Task(NodeIndex),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Associated {
    pub input: InputRef,
    pub optional: bool,
}

/// Edge weight of the task graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    Main,
    Associated { optional: bool },
}

/// A declared, immutable unit of work.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub(crate) name: ArcStr,
    pub(crate) recipe: ArcStr,
    pub(crate) main: InputRef,
    pub(crate) associated: Vec<Associated>,
    pub(crate) options: Options,
    pub(crate) meta_targets: Vec<MetaTarget>,
}

impl TaskNode {
    /// Qualified task name, e.g. `flat/flat_extract`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn recipe(&self) -> &str {
        &self.recipe
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn meta_targets(&self) -> &[MetaTarget] {
        &self.meta_targets
    }

    pub fn is_output(&self) -> bool {
        !self.meta_targets.is_empty()
    }
}

/// The parameter list of a subworkflow.
///
/// This trait is implemented for single handles, tuples of handles and
/// vectors of handles. Inside the subworkflow body only these handles (plus
/// data sources and tasks built by the body itself) may be used as inputs.
pub trait Params {
    fn handles(&self) -> Vec<TaskHandle>;
}

impl Params for () {
    fn handles(&self) -> Vec<TaskHandle> {
        vec![]
    }
}

impl Params for TaskHandle {
    fn handles(&self) -> Vec<TaskHandle> {
        vec![*self]
    }
}

impl Params for Vec<TaskHandle> {
    fn handles(&self) -> Vec<TaskHandle> {
        self.clone()
    }
}

macro_rules! impl_params {
    ($($P:ident),*) => {
        #[allow(non_snake_case)]
        impl<$($P),*> Params for ($($P,)*)
        where
            $($P: Params),* {
            fn handles(&self) -> Vec<TaskHandle> {
                let ($($P,)*) = self;
                let mut acc = Vec::new();
                $(acc.extend($P.handles());)*
                acc
            }
        }
    };
}

impl_params!(A);
impl_params!(A, B);
impl_params!(A, B, C);
impl_params!(A, B, C, D);
impl_params!(A, B, C, D, E);
impl_params!(A, B, C, D, E, F);
impl_params!(A, B, C, D, E, F, G);
impl_params!(A, B, C, D, E, F, G, H);
