use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::catalog::Catalog;
use crate::classify::{ClassificationRule, Classifier, Expected};
use crate::core::{ArcStr, Environment, MetaTarget, Options};
use crate::engine::{
    Associated, Dependency, Input, InputRef, Params, Plan, RuleHandle, RunReport, SourceHandle,
    TaskHandle, TaskNode,
};
use crate::error::{ConfigurationError, RunError};
use crate::source::DataSource;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// The blueprint of a reduction workflow.
///
/// `Blueprint` is the configuration-build context: classification rules, data
/// sources and tasks are declared on it and wired together with the handles
/// it returns. Nothing is executed while building. Once complete, call
/// [`finish`](Self::finish) to obtain an immutable [`Workflow`].
///
/// # Example
///
/// ```rust
/// use tenmon::Blueprint;
///
/// let mut bp = Blueprint::new();
/// let bias_class = bp.classification_rule("BIAS", [("instrume", "ANDES"), ("dpr.type", "BIAS")])?;
/// let bias = bp
///     .data_source()
///     .with_classification_rule(bias_class)
///     .with_match_keywords(["instrume"])
///     .build()?;
/// bp.task("bias")
///     .with_recipe("andes_cal_bias")
///     .with_main_input(bias)
///     .build()?;
///
/// let workflow = bp.finish()?;
/// assert_eq!(workflow.tasks().count(), 1);
/// # Ok::<(), tenmon::ConfigurationError>(())
/// ```
pub struct Blueprint {
    id: u64,
    classifier: Classifier,
    sources: Vec<DataSource>,
    graph: Graph<TaskNode, Dependency>,
    names: HashMap<ArcStr, NodeIndex>,
    scopes: Vec<Scope>,
    invocations: HashMap<String, usize>,
}

/// Sizes of the blueprint before a subworkflow body runs.
struct Checkpoint {
    rules: usize,
    sources: usize,
    nodes: usize,
    invocations: HashMap<String, usize>,
}

/// An active subworkflow invocation.
struct Scope {
    prefix: String,
    params: HashSet<NodeIndex>,
    members: HashSet<NodeIndex>,
}

impl Blueprint {
    pub fn new() -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            classifier: Classifier::default(),
            sources: Vec::new(),
            graph: Graph::new(),
            names: HashMap::new(),
            scopes: Vec::new(),
            invocations: HashMap::new(),
        }
    }

    /// Declares a classification rule. Rules are evaluated in the order they
    /// are declared.
    pub fn classification_rule<K, V>(
        &mut self,
        label: &str,
        predicate: impl IntoIterator<Item = (K, V)>,
    ) -> Result<RuleHandle, ConfigurationError>
    where
        K: Into<String>,
        V: Into<Expected>,
    {
        self.add_rule(ClassificationRule::new(label, predicate))
    }

    pub fn add_rule(&mut self, rule: ClassificationRule) -> Result<RuleHandle, ConfigurationError> {
        if self.classifier.contains(rule.label()) {
            return Err(ConfigurationError::DuplicateRule(rule.label().to_string()));
        }

        let index = self.classifier.push(rule);
        Ok(RuleHandle {
            owner: self.id,
            index,
        })
    }

    pub fn data_source(&mut self) -> SourceDef<'_> {
        SourceDef {
            blueprint: self,
            rule: None,
            match_keywords: Vec::new(),
        }
    }

    /// Starts declaring a task. The name is qualified with the enclosing
    /// subworkflow invocation, if any.
    pub fn task(&mut self, name: impl AsRef<str>) -> TaskDef<'_> {
        TaskDef {
            name: self.qualify(name.as_ref()),
            blueprint: self,
            recipe: None,
            main: None,
            associated: Vec::new(),
            options: Options::new(),
            meta_targets: Vec::new(),
        }
    }

    /// Inlines a subworkflow.
    ///
    /// The body receives the blueprint and the parameters, and returns the
    /// handle of the task it exposes. Tasks built inside are named
    /// `name/task` for the first invocation and `name#N/task` for later ones,
    /// so the same subworkflow can be instantiated several times. The body may
    /// only wire inputs from its parameters, data sources and its own tasks.
    ///
    /// When the body fails, everything it declared is rolled back and the
    /// invocation does not count towards the `#N` numbering. Handles created
    /// inside a failed body are invalid.
    pub fn subworkflow<P, F>(
        &mut self,
        name: &str,
        params: P,
        body: F,
    ) -> Result<TaskHandle, ConfigurationError>
    where
        P: Params,
        F: FnOnce(&mut Blueprint, P) -> Result<TaskHandle, ConfigurationError>,
    {
        let handles = params.handles();
        for handle in &handles {
            self.resolve(&self.qualify(name), Input::Task(*handle))?;
        }

        let checkpoint = self.checkpoint();

        let base = self.qualify(name);
        let count = self.invocations.entry(base.clone()).or_default();
        let prefix = match *count {
            0 => base,
            n => format!("{base}#{n}"),
        };
        *count += 1;

        tracing::debug!("entering subworkflow {}", prefix);

        self.scopes.push(Scope {
            prefix: prefix.clone(),
            params: handles.iter().map(|h| h.index).collect(),
            members: HashSet::new(),
        });

        let result = body(self, params);
        let scope = self.scopes.pop();

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                self.rollback(checkpoint);
                return Err(e);
            }
        };

        let owned = output.owner == self.id
            && scope.is_some_and(|scope| scope.members.contains(&output.index));

        if !owned {
            let error = ConfigurationError::UndeclaredSubworkflowInput {
                scope: prefix,
                task: "<output>".to_string(),
                input: self.name_of(output),
            };
            self.rollback(checkpoint);
            return Err(error);
        }

        // The exposed task becomes visible to the enclosing scope.
        if let Some(outer) = self.scopes.last_mut() {
            outer.members.insert(output.index);
        }

        Ok(output)
    }

    /// Validates the graph and freezes it into a [`Workflow`].
    pub fn finish(self) -> Result<Workflow, ConfigurationError> {
        if let Err(cycle) = petgraph::algo::toposort(&self.graph, None) {
            let name = self.graph[cycle.node_id()].name.to_string();
            return Err(ConfigurationError::Cycle(name));
        }

        Ok(Workflow {
            classifier: self.classifier,
            sources: self.sources,
            graph: self.graph,
        })
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            rules: self.classifier.rules().len(),
            sources: self.sources.len(),
            nodes: self.graph.node_count(),
            invocations: self.invocations.clone(),
        }
    }

    /// Forgets everything declared since the checkpoint was taken.
    fn rollback(&mut self, checkpoint: Checkpoint) {
        // Removing the last node never moves another one, so the surviving
        // indices stay valid.
        while self.graph.node_count() > checkpoint.nodes {
            let last = NodeIndex::new(self.graph.node_count() - 1);
            self.graph.remove_node(last);
        }

        self.names.retain(|_, index| index.index() < checkpoint.nodes);
        self.sources.truncate(checkpoint.sources);
        self.classifier.truncate(checkpoint.rules);
        self.invocations = checkpoint.invocations;
    }

    fn qualify(&self, name: &str) -> String {
        match self.scopes.last() {
            Some(scope) => format!("{}/{}", scope.prefix, name),
            None => name.to_string(),
        }
    }

    fn name_of(&self, handle: TaskHandle) -> String {
        self.graph
            .node_weight(handle.index)
            .filter(|_| handle.owner == self.id)
            .map(|node| node.name.to_string())
            .unwrap_or_else(|| format!("#{}", handle.index.index()))
    }

    /// Checks that an input belongs to this blueprint and is visible from the
    /// current scope.
    fn resolve(&self, task: &str, input: Input) -> Result<InputRef, ConfigurationError> {
        let unknown = || ConfigurationError::UnknownInput {
            task: task.to_string(),
        };

        match input {
            Input::Source(handle) => {
                if handle.owner != self.id || handle.index >= self.sources.len() {
                    return Err(unknown());
                }
                Ok(InputRef::Source(handle.index))
            }
            Input::Task(handle) => {
                if handle.owner != self.id || self.graph.node_weight(handle.index).is_none() {
                    return Err(unknown());
                }

                if let Some(scope) = self.scopes.last()
                    && !scope.params.contains(&handle.index)
                    && !scope.members.contains(&handle.index)
                {
                    return Err(ConfigurationError::UndeclaredSubworkflowInput {
                        scope: scope.prefix.clone(),
                        task: task.to_string(),
                        input: self.name_of(handle),
                    });
                }

                Ok(InputRef::Task(handle.index))
            }
        }
    }

    fn add_task(&mut self, node: TaskNode) -> TaskHandle {
        let main = node.main;
        let associated = node.associated.clone();
        let name = node.name.clone();
        let index = self.graph.add_node(node);

        if let InputRef::Task(producer) = main {
            self.graph.add_edge(producer, index, Dependency::Main);
        }

        for item in associated {
            if let InputRef::Task(producer) = item.input {
                let optional = item.optional;
                self.graph
                    .add_edge(producer, index, Dependency::Associated { optional });
            }
        }

        if let Some(scope) = self.scopes.last_mut() {
            scope.members.insert(index);
        }

        self.names.insert(name, index);

        TaskHandle {
            owner: self.id,
            index,
        }
    }
}

impl Default for Blueprint {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SourceDef<'a> {
    blueprint: &'a mut Blueprint,
    rule: Option<RuleHandle>,
    match_keywords: Vec<String>,
}

impl SourceDef<'_> {
    pub fn with_classification_rule(mut self, rule: RuleHandle) -> Self {
        self.rule = Some(rule);
        self
    }

    pub fn with_match_keywords<S>(mut self, keywords: impl IntoIterator<Item = S>) -> Self
    where
        S: Into<String>,
    {
        self.match_keywords.extend(keywords.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> Result<SourceHandle, ConfigurationError> {
        let rule = self
            .rule
            .ok_or(ConfigurationError::MissingClassificationRule)?;

        if rule.owner != self.blueprint.id || rule.index >= self.blueprint.classifier.rules().len()
        {
            return Err(ConfigurationError::UnknownReference {
                from: "data source".to_string(),
                kind: "classification rule",
                name: format!("#{}", rule.index),
            });
        }

        let category = self.blueprint.classifier.get(rule.index).label_arc();
        self.blueprint.sources.push(DataSource {
            category,
            match_keywords: self.match_keywords,
        });

        Ok(SourceHandle {
            owner: self.blueprint.id,
            index: self.blueprint.sources.len() - 1,
        })
    }
}

pub struct TaskDef<'a> {
    blueprint: &'a mut Blueprint,
    name: String,
    recipe: Option<ArcStr>,
    main: Option<Input>,
    associated: Vec<(Input, bool)>,
    options: Options,
    meta_targets: Vec<MetaTarget>,
}

impl TaskDef<'_> {
    pub fn with_recipe(mut self, recipe: impl AsRef<str>) -> Self {
        self.recipe = Some(ArcStr::from(recipe.as_ref()));
        self
    }

    pub fn with_main_input(mut self, input: impl Into<Input>) -> Self {
        self.main = Some(input.into());
        self
    }

    /// Adds an associated input the task cannot run without.
    pub fn with_associated_input(mut self, input: impl Into<Input>) -> Self {
        self.associated.push((input.into(), false));
        self
    }

    /// Adds an associated input the task uses when available.
    pub fn with_optional_associated_input(mut self, input: impl Into<Input>) -> Self {
        self.associated.push((input.into(), true));
        self
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options.extend(options);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn with_meta_targets(mut self, targets: impl IntoIterator<Item = MetaTarget>) -> Self {
        self.meta_targets.extend(targets);
        self
    }

    pub fn build(self) -> Result<TaskHandle, ConfigurationError> {
        let name = self.name;

        if self.blueprint.names.contains_key(name.as_str()) {
            return Err(ConfigurationError::DuplicateTask(name));
        }

        let recipe = self
            .recipe
            .ok_or_else(|| ConfigurationError::MissingRecipe(name.clone()))?;
        let main = self
            .main
            .ok_or_else(|| ConfigurationError::MissingMainInput(name.clone()))?;

        let main = self.blueprint.resolve(&name, main)?;
        let associated = self
            .associated
            .into_iter()
            .map(|(input, optional)| {
                self.blueprint
                    .resolve(&name, input)
                    .map(|input| Associated { input, optional })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(self.blueprint.add_task(TaskNode {
            name: ArcStr::from(name),
            recipe,
            main,
            associated,
            options: self.options,
            meta_targets: self.meta_targets,
        }))
    }
}

/// A validated, immutable workflow.
///
/// A [`Workflow`] is created from a [`Blueprint`]. It can be planned against
/// any number of catalogs and run repeatedly; none of its nodes change after
/// construction.
#[derive(Debug)]
pub struct Workflow {
    pub(crate) classifier: Classifier,
    pub(crate) sources: Vec<DataSource>,
    pub(crate) graph: Graph<TaskNode, Dependency>,
}

impl Workflow {
    pub fn design() -> Blueprint {
        Blueprint::default()
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn sources(&self) -> &[DataSource] {
        &self.sources
    }

    /// Tasks in declaration order, which is also a topological order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.graph.node_indices().map(|index| &self.graph[index])
    }

    pub fn task(&self, name: &str) -> Option<&TaskNode> {
        self.tasks().find(|task| task.name() == name)
    }

    /// Expands the workflow against a catalog without running anything.
    pub fn plan(&self, catalog: &Catalog) -> Plan {
        Plan::build(self, catalog)
    }

    /// Runs the workflow once.
    ///
    /// This will:
    /// 1. Check that every recipe is registered.
    /// 2. Classify the catalog and expand the task instantiations.
    /// 3. Execute the instantiation graph on the worker pool.
    /// 4. Deliver the successful meta-tagged products.
    ///
    /// Returns the full report, or a [`RunFailure`](crate::RunFailure) when a
    /// meta-tagged instantiation failed.
    pub fn run(&self, catalog: &Catalog, env: &Environment) -> Result<RunReport, RunError> {
        for task in self.tasks() {
            if !env.recipes.contains(task.recipe()) {
                return Err(ConfigurationError::UnknownRecipe {
                    task: task.name().to_string(),
                    recipe: task.recipe().to_string(),
                }
                .into());
            }
        }

        let plan = self.plan(catalog);
        crate::engine::runner::run(self, &plan, env)
    }
}

impl std::fmt::Display for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for (i, source) in self.sources.iter().enumerate() {
            writeln!(f, "    S{i}[(\"{}\")]", source.category())?;
        }

        for index in self.graph.node_indices() {
            let task = &self.graph[index];
            let name = task.name().replace('"', "\\\"");
            writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;

            if let InputRef::Source(source) = task.main {
                writeln!(f, "    S{source} --> {:?}", index.index())?;
            }

            for item in &task.associated {
                if let InputRef::Source(source) = item.input {
                    writeln!(f, "    S{source} -.-> {:?}", index.index())?;
                }
            }

            if task.is_output() {
                writeln!(f, "    {:?} --> Output", index.index())?;
            }
        }

        writeln!(f, "    Output[Output]")?;

        for edge in self.graph.raw_edges() {
            let arrow = match edge.weight {
                Dependency::Main => "-->",
                Dependency::Associated { .. } => "-.->",
            };
            writeln!(
                f,
                "    {:?} {} {:?}",
                edge.source().index(),
                arrow,
                edge.target().index()
            )?;
        }

        Ok(())
    }
}
