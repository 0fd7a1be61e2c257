//! The boundary between the orchestration core and the processing units.
//!
//! Recipes are opaque: the executor hands them the frames of the main input,
//! the products of the associated inputs and the options declared on the
//! task, and expects one or more product files back.

use std::collections::HashMap;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::core::{Frame, Metadata, Options};
use crate::engine::CancelToken;

/// The output of one successful task instantiation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Product {
    /// Qualified name of the producing task, or the category of the data
    /// source for raw frames used as associated input.
    pub task: String,
    /// Label of the producing instantiation.
    pub instance: String,
    pub files: Vec<Utf8PathBuf>,
    pub meta: Metadata,
}

/// What a recipe returns on success.
#[derive(Debug, Clone, Default)]
pub struct RecipeOutput {
    pub files: Vec<Utf8PathBuf>,
    pub meta: Metadata,
}

impl RecipeOutput {
    pub fn file(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            files: vec![path.into()],
            meta: Metadata::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }
}

/// Main input of an invocation.
#[derive(Debug, Clone, Copy)]
pub enum MainInput<'a> {
    /// Raw frames of a data source group.
    Frames(&'a [Frame]),
    /// Product of the upstream task.
    Product(&'a Product),
}

impl<'a> MainInput<'a> {
    pub fn files(&self) -> Vec<&'a Utf8Path> {
        match self {
            MainInput::Frames(frames) => frames.iter().map(|f| f.path.as_path()).collect(),
            MainInput::Product(product) => product.files.iter().map(|f| f.as_path()).collect(),
        }
    }
}

/// Everything a recipe gets to see for one instantiation.
#[derive(Debug)]
pub struct Invocation<'a> {
    pub task: &'a str,
    pub recipe: &'a str,
    pub instance: &'a str,
    pub main: MainInput<'a>,
    /// Resolved associated products, in declaration order. Optional inputs
    /// without a product are left out.
    pub associated: Vec<&'a Product>,
    pub options: &'a Options,
    pub(crate) cancel: &'a CancelToken,
}

impl Invocation<'_> {
    /// Long running recipes should poll this and stop early.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Finds the associated product produced by the given task.
    pub fn associated_from(&self, task: &str) -> Option<&Product> {
        self.associated.iter().copied().find(|p| p.task == task)
    }
}

/// An external processing unit.
pub trait Recipe: Send + Sync {
    fn run(&self, invocation: &Invocation<'_>) -> anyhow::Result<RecipeOutput>;
}

impl<F> Recipe for F
where
    F: Fn(&Invocation<'_>) -> anyhow::Result<RecipeOutput> + Send + Sync,
{
    fn run(&self, invocation: &Invocation<'_>) -> anyhow::Result<RecipeOutput> {
        self(invocation)
    }
}

/// Name to recipe registry.
#[derive(Clone, Default)]
pub struct Recipes {
    map: HashMap<String, Arc<dyn Recipe>>,
}

impl Recipes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, recipe: impl Recipe + 'static) -> Self {
        self.map.insert(name.into(), Arc::new(recipe));
        self
    }

    /// Registers a closure. Unlike [`register`](Self::register), the closure
    /// argument type is inferred.
    pub fn register_fn<F>(self, name: impl Into<String>, recipe: F) -> Self
    where
        F: Fn(&Invocation<'_>) -> anyhow::Result<RecipeOutput> + Send + Sync + 'static,
    {
        self.register(name, recipe)
    }

    pub fn insert(&mut self, name: impl Into<String>, recipe: Arc<dyn Recipe>) {
        self.map.insert(name.into(), recipe);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Recipe>> {
        self.map.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }
}

impl std::fmt::Debug for Recipes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.map.keys().collect();
        names.sort();
        f.debug_struct("Recipes").field("names", &names).finish()
    }
}
