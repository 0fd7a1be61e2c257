mod diagnostics;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::mpsc::{Sender, channel};
use std::time::{Duration, Instant};

use indicatif::ProgressStyle;
use petgraph::Direction;
use petgraph::graph::NodeIndex;
use serde::Serialize;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::Workflow;
use crate::core::Environment;
use crate::engine::{Binding, Plan, StateTable, Status, TaskNode};
use crate::error::{Cancelled, RunError, RunFailure, TaskError};
use crate::recipe::{Invocation, MainInput, Product};

pub use diagnostics::{InstanceReport, RunReport};

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TaskExecution {
    /// Offset from the start of the run.
    pub offset: Duration,
    pub duration: Duration,
}

enum Event {
    Finished {
        id: usize,
        result: Result<Product, TaskError>,
        start: Instant,
        duration: Duration,
    },
    /// The instantiation was dropped before its recipe started.
    Discarded { id: usize },
}

/// Resolved inputs, collected by the scheduler before handing the
/// instantiation to a worker.
struct Inputs {
    /// `None` means the raw frames of the instantiation's own group.
    main: Option<Arc<Product>>,
    associated: Vec<Arc<Product>>,
}

enum Decision {
    Spawn(Inputs),
    Fail(TaskError),
    Cancel,
}

/// Read-only state shared with the workers.
struct Shared<'a> {
    workflow: &'a Workflow,
    plan: &'a Plan,
    env: &'a Environment,
    states: &'a StateTable,
}

/// Executes the instantiation graph, delivers the meta-tagged products and
/// builds the run report.
pub(crate) fn run(workflow: &Workflow, plan: &Plan, env: &Environment) -> Result<RunReport, RunError> {
    let began = Instant::now();
    let total = plan.len();
    let states = StateTable::new(total);

    let mut outputs: Vec<Option<Arc<Product>>> = vec![None; total];
    let mut errors: Vec<Option<TaskError>> = vec![None; total];
    let mut execution_times: HashMap<usize, TaskExecution> = HashMap::new();

    if total > 0 {
        tracing::info!(
            "running {} instantiations on {} workers",
            total,
            env.options.workers
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(env.options.workers.max(1))
            .thread_name(|i| format!("tenmon-worker-{i}"))
            .build()?;

        let shared = Shared {
            workflow,
            plan,
            env,
            states: &states,
        };

        schedule(
            &pool,
            &shared,
            began,
            &mut outputs,
            &mut errors,
            &mut execution_times,
        );
    } else {
        tracing::info!("no instantiations to run");
    }

    let report = RunReport::new(
        workflow,
        plan,
        states.snapshot(),
        outputs,
        errors,
        execution_times,
    );

    for item in report.deliverables() {
        if let Some(product) = &item.product {
            env.delivery
                .deliver(product, &item.meta_targets)
                .map_err(|e| RunError::Delivery(item.label.clone(), e))?;
        }
    }

    let failed = report.failed_outputs();
    if !failed.is_empty() {
        for item in &failed {
            tracing::error!("{} failed: {}", item.label, item.cause_chain().join(" <- "));
        }

        return Err(RunFailure {
            failed,
            report: Box::new(report),
        }
        .into());
    }

    if !report.is_success() {
        for item in report.missing_outputs() {
            tracing::warn!("{} was not produced: {}", item.label, item.status);
        }

        return Err(RunError::Cancelled {
            report: Box::new(report),
        });
    }

    tracing::info!("run complete in {:.2?}", began.elapsed());
    Ok(report)
}

/// The scheduler loop. Instantiations are handed to the pool as soon as
/// every producer is settled:
/// 1. Count the producers of every instantiation.
/// 2. Seed the queue with the ones that have none.
/// 3. Settle queued instantiations: spawn them, or fail/cancel them right
///    away when an input is missing.
/// 4. Wait for a completion event, record it and release the dependents.
/// 5. Repeat until every instantiation is settled.
fn schedule(
    pool: &rayon::ThreadPool,
    shared: &Shared<'_>,
    began: Instant,
    outputs: &mut [Option<Arc<Product>>],
    errors: &mut [Option<TaskError>],
    execution_times: &mut HashMap<usize, TaskExecution>,
) {
    let plan = shared.plan;
    let states = shared.states;
    let total = plan.len();

    let mut counts: Vec<usize> = (0..total)
        .map(|i| {
            plan.graph
                .neighbors_directed(NodeIndex::new(i), Direction::Incoming)
                .count()
        })
        .collect();

    let root_span = tracing::span!(Level::INFO, "running_tasks");
    root_span.pb_set_length(total as u64);
    if shared.env.options.progress {
        root_span.pb_set_style(&crate::utils::get_style_run());
        root_span.pb_set_message("Running tasks...");
    }
    let _enter = root_span.enter();

    let style = crate::utils::get_style_task();

    pool.in_place_scope(|s| {
        let (tx, rx) = channel::<Event>();
        let mut queue: VecDeque<usize> = (0..total).filter(|&i| counts[i] == 0).collect();
        let mut settled = 0;

        loop {
            while let Some(id) = queue.pop_front() {
                match decide(shared, id, outputs, errors) {
                    Decision::Spawn(inputs) => {
                        states.transition(id, Status::Pending, Status::Ready);
                        spawn(s, shared, id, inputs, style.clone(), tx.clone());
                        continue;
                    }
                    Decision::Fail(error) => {
                        states.transition(id, Status::Pending, Status::Failed);
                        tracing::warn!("{} failed: {}", plan.instances[id].label, error);
                        errors[id] = Some(error);
                    }
                    Decision::Cancel => {
                        states.transition(id, Status::Pending, Status::Cancelled);
                    }
                }

                settled += 1;
                root_span.pb_inc(1);
                release(plan, id, &mut counts, &mut queue);
            }

            if settled == total {
                break;
            }

            // The scheduler holds a sender, so this only fails if a worker
            // thread died without reporting.
            let Ok(event) = rx.recv() else { break };

            let id = match event {
                Event::Finished {
                    id,
                    result,
                    start,
                    duration,
                } => {
                    execution_times.insert(
                        id,
                        TaskExecution {
                            offset: start.saturating_duration_since(began),
                            duration,
                        },
                    );

                    match result {
                        Ok(product) => {
                            states.transition(id, Status::Running, Status::Succeeded);
                            outputs[id] = Some(Arc::new(product));
                        }
                        // No error is recorded, so dependents are cancelled
                        // rather than failed.
                        Err(TaskError::Cancelled(_)) => {
                            states.transition(id, Status::Running, Status::Cancelled);
                            tracing::info!("{} stopped on cancellation", plan.instances[id].label);
                        }
                        Err(error) => {
                            states.transition(id, Status::Running, Status::Failed);
                            tracing::warn!("{} failed: {}", plan.instances[id].label, error);
                            errors[id] = Some(error);
                        }
                    }
                    id
                }
                Event::Discarded { id } => id,
            };

            settled += 1;
            root_span.pb_inc(1);
            release(plan, id, &mut counts, &mut queue);
        }
    });
}

fn release(plan: &Plan, id: usize, counts: &mut [usize], queue: &mut VecDeque<usize>) {
    for dependent in plan
        .graph
        .neighbors_directed(NodeIndex::new(id), Direction::Outgoing)
    {
        let dependent = dependent.index();
        counts[dependent] -= 1;
        if counts[dependent] == 0 {
            queue.push_back(dependent);
        }
    }
}

/// Looks at the settled producers of an instantiation and decides what
/// happens to it. A failed required producer fails the consumer without
/// running it; a failed optional producer is left out of the invocation.
fn decide(
    shared: &Shared<'_>,
    id: usize,
    outputs: &[Option<Arc<Product>>],
    errors: &[Option<TaskError>],
) -> Decision {
    if shared.env.cancel.is_cancelled() {
        return Decision::Cancel;
    }

    let instance = &shared.plan.instances[id];

    enum Upstream {
        Ready(Arc<Product>),
        Failed(TaskError),
        Cancelled,
    }

    let upstream = |producer: usize| match (&outputs[producer], &errors[producer]) {
        (Some(product), _) => Upstream::Ready(product.clone()),
        (None, Some(cause)) => Upstream::Failed(TaskError::UpstreamFailed {
            producer: shared.plan.instances[producer].label.clone(),
            cause: Box::new(cause.clone()),
        }),
        (None, None) => Upstream::Cancelled,
    };

    let main = match &instance.main {
        Binding::Frames(_) => None,
        Binding::Upstream { producer, .. } => match upstream(*producer) {
            Upstream::Ready(product) => Some(product),
            Upstream::Failed(error) => return Decision::Fail(error),
            Upstream::Cancelled => return Decision::Cancel,
        },
    };

    let mut associated = Vec::with_capacity(instance.associated.len());
    for binding in &instance.associated {
        match binding {
            Binding::Frames(product) => associated.push(product.clone()),
            Binding::Upstream { producer, optional } => match upstream(*producer) {
                Upstream::Ready(product) => associated.push(product),
                Upstream::Failed(_) | Upstream::Cancelled if *optional => {
                    tracing::debug!(
                        "{}: proceeding without optional input {}",
                        instance.label,
                        shared.plan.instances[*producer].label
                    );
                }
                Upstream::Failed(error) => return Decision::Fail(error),
                Upstream::Cancelled => return Decision::Cancel,
            },
        }
    }

    if let Some(error) = &instance.blocked {
        return Decision::Fail(error.clone());
    }

    Decision::Spawn(Inputs { main, associated })
}

fn spawn<'scope, 'a: 'scope>(
    s: &rayon::Scope<'scope>,
    shared: &'scope Shared<'a>,
    id: usize,
    inputs: Inputs,
    style: ProgressStyle,
    sender: Sender<Event>,
) {
    s.spawn(move |_| {
        let cancelled = shared.env.cancel.is_cancelled()
            && shared.states.transition(id, Status::Ready, Status::Cancelled);

        if cancelled || !shared.states.transition(id, Status::Ready, Status::Running) {
            let _ = sender.send(Event::Discarded { id });
            return;
        }

        let instance = &shared.plan.instances[id];
        let task = &shared.workflow.graph[instance.task];

        let span = tracing::span!(Level::INFO, "task", name = %instance.label);
        if shared.env.options.progress {
            span.pb_set_style(&style);
            span.pb_set_message(&format!("Running {}", instance.label));
        }
        let _enter = span.enter();

        let main = match &inputs.main {
            Some(product) => MainInput::Product(product),
            None => MainInput::Frames(
                instance
                    .group
                    .as_ref()
                    .map(|g| g.frames.as_slice())
                    .unwrap_or_default(),
            ),
        };

        let invocation = Invocation {
            task: task.name(),
            recipe: task.recipe(),
            instance: &instance.label,
            main,
            associated: inputs.associated.iter().map(AsRef::as_ref).collect(),
            options: task.options(),
            cancel: &shared.env.cancel,
        };

        let start = Instant::now();
        let result = execute(shared.env, task, &instance.representative, &invocation);
        let duration = start.elapsed();

        let _ = sender.send(Event::Finished {
            id,
            result,
            start,
            duration,
        });
    });
}

/// Invokes the recipe and turns whatever it does, including panicking, into
/// a product or a task error.
fn execute(
    env: &Environment,
    task: &TaskNode,
    representative: &crate::Metadata,
    invocation: &Invocation<'_>,
) -> Result<Product, TaskError> {
    let recipe_name = task.recipe().to_string();

    let Some(recipe) = env.recipes.get(task.recipe()) else {
        return Err(TaskError::Recipe {
            recipe: recipe_name,
            error: Arc::new(anyhow::anyhow!("recipe is not registered")),
        });
    };

    // Recipes only see shared references into data that outlives the run, so
    // a panic cannot leave anything half-updated behind.
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| recipe.run(invocation)));

    match outcome {
        Ok(Ok(output)) if output.files.is_empty() => Err(TaskError::InvalidOutput(recipe_name)),
        Ok(Ok(output)) => {
            let mut meta = representative.clone();
            meta.extend(output.meta);

            Ok(Product {
                task: task.name().to_string(),
                instance: invocation.instance.to_string(),
                files: output.files,
                meta,
            })
        }
        Ok(Err(error)) if error.is::<Cancelled>() => Err(TaskError::Cancelled(recipe_name)),
        Ok(Err(error)) => Err(TaskError::Recipe {
            recipe: recipe_name,
            error: Arc::new(error),
        }),
        Err(panic) => {
            let message = if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                String::from("unknown payload")
            };

            Err(TaskError::Panicked {
                recipe: recipe_name,
                message,
            })
        }
    }
}
