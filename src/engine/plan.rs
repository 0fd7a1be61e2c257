//! Expansion of a workflow into concrete task instantiations.
//!
//! * A task fed by a data source gets one instantiation per group.
//! * A task fed by another task gets one instantiation per upstream
//!   instantiation, inheriting its match keyword values.
//! * Associated inputs pick the best available candidate: it has to agree on
//!   every shared match keyword, and the one closest in time (`mjd-obs`) wins.
//!   Without time information the first candidate in plan order is taken.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::Workflow;
use crate::catalog::Catalog;
use crate::core::{ArcStr, Metadata};
use crate::engine::InputRef;
use crate::error::TaskError;
use crate::recipe::Product;
use crate::source::{Group, GroupKey, describe_key};

/// Header keyword holding the observation time as a modified Julian date.
const TIME_KEYWORD: &str = "mjd-obs";

/// Where an instantiation gets one of its inputs from.
#[derive(Debug, Clone)]
pub(crate) enum Binding {
    /// Raw frames, available from the start.
    Frames(Arc<Product>),
    /// The product of another instantiation.
    Upstream { producer: usize, optional: bool },
}

/// One concrete run of a task against one resolved set of inputs.
#[derive(Debug, Clone)]
pub struct Instance {
    pub(crate) task: NodeIndex,
    pub(crate) name: ArcStr,
    pub(crate) label: String,
    pub(crate) key: GroupKey,
    pub(crate) representative: Metadata,
    pub(crate) group: Option<Group>,
    pub(crate) main: Binding,
    pub(crate) associated: Vec<Binding>,
    /// Set when the instantiation cannot run no matter what happens upstream.
    pub(crate) blocked: Option<TaskError>,
}

impl Instance {
    /// Qualified name of the task.
    pub fn task(&self) -> &str {
        &self.name
    }

    /// Unique label of the instantiation, e.g. `bias[instrume=ANDES]`.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn key(&self) -> &GroupKey {
        &self.key
    }

    /// The data source group, for instantiations fed by raw frames.
    pub fn group(&self) -> Option<&Group> {
        self.group.as_ref()
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.is_some()
    }
}

/// The expanded instantiation graph of one run.
#[derive(Debug, Default)]
pub struct Plan {
    pub(crate) instances: Vec<Instance>,
    /// Node `i` is instance `i`; the edge weight tells whether the input is
    /// required.
    pub(crate) graph: Graph<usize, bool>,
}

impl Plan {
    pub(crate) fn build(workflow: &Workflow, catalog: &Catalog) -> Self {
        let classified = workflow.classifier.classify_all(catalog);
        tracing::debug!(
            "classified {} of {} frames",
            classified.len(),
            catalog.len()
        );

        let mut groups: Vec<Option<Vec<Group>>> = vec![None; workflow.sources.len()];
        let mut groups_of = |source: usize| -> Vec<Group> {
            groups[source]
                .get_or_insert_with(|| workflow.sources[source].resolve(&classified))
                .clone()
        };

        let mut plan = Plan::default();
        let mut by_task: HashMap<NodeIndex, Vec<usize>> = HashMap::new();
        let mut labels = HashSet::new();

        // Node indices follow declaration order, and a task can only refer to
        // tasks declared before it.
        for task_index in workflow.graph.node_indices() {
            let task = &workflow.graph[task_index];

            let seeds: Vec<(GroupKey, Metadata, Option<Group>, Binding)> = match task.main {
                InputRef::Source(source) => groups_of(source)
                    .into_iter()
                    .map(|group| {
                        let product = Arc::new(frames_product(&group));
                        (
                            group.key.clone(),
                            group.representative.clone(),
                            Some(group),
                            Binding::Frames(product),
                        )
                    })
                    .collect(),
                InputRef::Task(upstream) => by_task
                    .get(&upstream)
                    .into_iter()
                    .flatten()
                    .map(|&producer| {
                        let parent = &plan.instances[producer];
                        (
                            parent.key.clone(),
                            parent.representative.clone(),
                            None,
                            Binding::Upstream {
                                producer,
                                optional: false,
                            },
                        )
                    })
                    .collect(),
            };

            if seeds.is_empty() {
                tracing::debug!("task {} has no input this run", task.name);
            }

            for (key, representative, group, main) in seeds {
                let mut associated = Vec::new();
                let mut blocked = None;

                for item in &task.associated {
                    let chosen = match item.input {
                        InputRef::Task(producer_task) => {
                            let candidates = by_task.get(&producer_task).into_iter().flatten().map(
                                |&i| (&plan.instances[i].key, &plan.instances[i].representative),
                            );
                            best(&key, &representative, candidates).map(|pos| {
                                let producer = by_task[&producer_task][pos];
                                Binding::Upstream {
                                    producer,
                                    optional: item.optional,
                                }
                            })
                        }
                        InputRef::Source(source) => {
                            let found = groups_of(source);
                            let candidates = found.iter().map(|g| (&g.key, &g.representative));
                            best(&key, &representative, candidates)
                                .map(|pos| Binding::Frames(Arc::new(frames_product(&found[pos]))))
                        }
                    };

                    match chosen {
                        Some(binding) => associated.push(binding),
                        None if item.optional => {
                            tracing::debug!(
                                "{}: optional input {} unavailable",
                                task.name,
                                input_name(workflow, item.input)
                            );
                        }
                        None => {
                            blocked.get_or_insert(TaskError::MissingAssociatedInput(input_name(
                                workflow, item.input,
                            )));
                        }
                    }
                }

                let label = unique_label(&mut labels, &task.name, &key);
                let id = plan.instances.len();
                let node = plan.graph.add_node(id);

                if let Binding::Upstream { producer, .. } = main {
                    plan.graph.add_edge(NodeIndex::new(producer), node, true);
                }
                for binding in &associated {
                    if let Binding::Upstream { producer, optional } = binding {
                        plan.graph
                            .add_edge(NodeIndex::new(*producer), node, !optional);
                    }
                }

                plan.instances.push(Instance {
                    task: task_index,
                    name: task.name.clone(),
                    label,
                    key,
                    representative,
                    group,
                    main,
                    associated,
                    blocked,
                });
                by_task.entry(task_index).or_default().push(id);
            }
        }

        tracing::debug!("planned {} instantiations", plan.instances.len());
        plan
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Instantiations of the given task, in plan order.
    pub fn of_task<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Instance> {
        self.instances.iter().filter(move |i| &*i.name == name)
    }

    /// Labels of the instantiations the given one depends on.
    pub fn producers(&self, id: usize) -> Vec<&str> {
        self.graph
            .neighbors_directed(NodeIndex::new(id), petgraph::Direction::Incoming)
            .map(|n| self.instances[n.index()].label.as_str())
            .collect()
    }
}

fn frames_product(group: &Group) -> Product {
    Product {
        task: group.category.to_string(),
        instance: format!("{}[{}]", group.category, group.describe_key()),
        files: group.frames.iter().map(|f| f.path.clone()).collect(),
        meta: group.representative.clone(),
    }
}

fn input_name(workflow: &Workflow, input: InputRef) -> String {
    match input {
        InputRef::Task(index) => workflow.graph[index].name.to_string(),
        InputRef::Source(index) => workflow.sources[index].category().to_string(),
    }
}

fn unique_label(labels: &mut HashSet<String>, name: &str, key: &GroupKey) -> String {
    let base = if key.is_empty() {
        name.to_string()
    } else {
        format!("{name}[{}]", describe_key(key))
    };

    let mut label = base.clone();
    let mut n = 1;
    while !labels.insert(label.clone()) {
        label = format!("{base}#{n}");
        n += 1;
    }
    label
}

/// Two keys are compatible when they agree on every keyword they share.
fn compatible(a: &GroupKey, b: &GroupKey) -> bool {
    a.iter().all(|(keyword, value)| {
        b.iter()
            .find(|(other, _)| other == keyword)
            .is_none_or(|(_, other)| other == value)
    })
}

fn time_of(meta: &Metadata) -> Option<f64> {
    meta.get(TIME_KEYWORD)?.trim().parse().ok()
}

/// Picks the best candidate for an associated input and returns its position.
fn best<'a>(
    key: &GroupKey,
    meta: &Metadata,
    candidates: impl Iterator<Item = (&'a GroupKey, &'a Metadata)>,
) -> Option<usize> {
    let time = time_of(meta);
    let mut chosen: Option<(usize, f64)> = None;

    for (pos, (other_key, other_meta)) in candidates.enumerate() {
        if !compatible(key, other_key) {
            continue;
        }

        let distance = match (time, time_of(other_meta)) {
            (Some(a), Some(b)) => (a - b).abs(),
            _ => f64::INFINITY,
        };

        match chosen {
            Some((_, d)) if d <= distance => {}
            _ => chosen = Some((pos, distance)),
        }
    }

    chosen.map(|(pos, _)| pos)
}
