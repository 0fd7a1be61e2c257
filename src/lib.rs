#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod blueprint;
mod catalog;
mod classify;
mod config;
mod core;
mod delivery;
mod engine;
mod error;
mod recipe;
mod source;
mod utils;

#[cfg(test)]
mod scenarios;

pub use crate::blueprint::{Blueprint, SourceDef, TaskDef, Workflow};
pub use crate::catalog::Catalog;
pub use crate::classify::{ClassificationRule, ClassifiedFrame, Classifier, Expected};
pub use crate::config::{AssociatedDecl, RefDecl, RuleDecl, RunOptions, SourceDecl, TaskDecl, WorkflowDecl};
pub use crate::core::{Environment, Frame, Hash32, MetaTarget, Metadata, Options};
pub use crate::delivery::{CollectDelivery, Delivery, LogDelivery};
pub use crate::engine::{
    CancelToken, Dependency, Input, Instance, InstanceReport, Params, Plan, RuleHandle, RunReport,
    SourceHandle, Status, TaskExecution, TaskHandle, TaskNode,
};
pub use crate::error::*;
pub use crate::recipe::{Invocation, MainInput, Product, Recipe, RecipeOutput, Recipes};
pub use crate::source::{DataSource, Group, GroupKey};

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
