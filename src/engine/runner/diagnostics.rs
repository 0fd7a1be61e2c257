use std::collections::HashMap;
use std::fmt::{Display, Formatter, Write};
use std::sync::Arc;

use console::style;
use serde::Serialize;

use crate::Workflow;
use crate::core::MetaTarget;
use crate::engine::{Plan, Status, TaskExecution};
use crate::error::TaskError;
use crate::recipe::Product;

/// Final state of one task instantiation.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    pub label: String,
    /// Qualified name of the task.
    pub task: String,
    pub status: Status,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<TaskError>,
    pub product: Option<Arc<Product>>,
    pub meta_targets: Vec<MetaTarget>,
    pub execution: Option<TaskExecution>,
    /// Labels of the instantiations this one consumed.
    pub producers: Vec<String>,
}

fn serialize_error<S>(error: &Option<TaskError>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match error {
        Some(error) => serializer.collect_str(error),
        None => serializer.serialize_none(),
    }
}

impl InstanceReport {
    pub fn is_output(&self) -> bool {
        !self.meta_targets.is_empty()
    }

    /// Human readable causal chain, from this instantiation to the root
    /// failure.
    pub fn cause_chain(&self) -> Vec<String> {
        let Some(error) = &self.error else {
            return vec![];
        };

        let mut acc = vec![self.label.clone()];
        for link in error.chain() {
            match link {
                TaskError::UpstreamFailed { producer, .. } => acc.push(producer.clone()),
                root => acc.push(root.to_string()),
            }
        }
        acc
    }
}

/// Outcome of a workflow run.
///
/// Returned by [`Workflow::run`], and carried by
/// [`RunFailure`](crate::RunFailure) when the run failed. Instantiations are
/// listed in plan order.
#[derive(Debug, Default, Serialize)]
pub struct RunReport {
    pub instances: Vec<InstanceReport>,
}

impl RunReport {
    pub(crate) fn new(
        workflow: &Workflow,
        plan: &Plan,
        statuses: Vec<Status>,
        outputs: Vec<Option<Arc<Product>>>,
        errors: Vec<Option<TaskError>>,
        mut execution_times: HashMap<usize, TaskExecution>,
    ) -> Self {
        let instances = plan
            .instances
            .iter()
            .zip(statuses)
            .zip(outputs)
            .zip(errors)
            .enumerate()
            .map(|(id, (((instance, status), product), error))| InstanceReport {
                label: instance.label.clone(),
                task: instance.name.to_string(),
                status,
                error,
                product,
                meta_targets: workflow.graph[instance.task].meta_targets().to_vec(),
                execution: execution_times.remove(&id),
                producers: plan.producers(id).into_iter().map(String::from).collect(),
            })
            .collect();

        Self { instances }
    }

    pub fn get(&self, label: &str) -> Option<&InstanceReport> {
        self.instances.iter().find(|i| i.label == label)
    }

    /// Instantiations of the given task.
    pub fn of_task<'a>(&'a self, task: &'a str) -> impl Iterator<Item = &'a InstanceReport> {
        self.instances.iter().filter(move |i| i.task == task)
    }

    pub fn count(&self, status: Status) -> usize {
        self.instances.iter().filter(|i| i.status == status).count()
    }

    pub fn products(&self) -> impl Iterator<Item = &Arc<Product>> {
        self.instances.iter().filter_map(|i| i.product.as_ref())
    }

    /// Successful meta-tagged instantiations, which get delivered.
    pub fn deliverables(&self) -> impl Iterator<Item = &InstanceReport> {
        self.instances
            .iter()
            .filter(|i| i.is_output() && i.status == Status::Succeeded)
    }

    /// Meta-tagged instantiations that did not succeed.
    pub fn failed_outputs(&self) -> Vec<InstanceReport> {
        self.instances
            .iter()
            .filter(|i| i.is_output() && i.status == Status::Failed)
            .cloned()
            .collect()
    }

    /// Meta-tagged instantiations that never produced anything, whether they
    /// failed or were cancelled.
    pub fn missing_outputs(&self) -> Vec<&InstanceReport> {
        self.instances
            .iter()
            .filter(|i| i.is_output() && i.status != Status::Succeeded)
            .collect()
    }

    /// Every meta-tagged instantiation succeeded.
    pub fn is_success(&self) -> bool {
        self.missing_outputs().is_empty()
    }

    /// A short styled summary for the terminal.
    pub fn summary(&self) -> String {
        let mut f = String::new();

        let _ = writeln!(
            f,
            "{} succeeded, {} failed, {} cancelled",
            style(self.count(Status::Succeeded)).green(),
            style(self.count(Status::Failed)).red(),
            style(self.count(Status::Cancelled)).yellow(),
        );

        for item in &self.instances {
            let text = item.status.to_string();
            let status = match item.status {
                Status::Succeeded => style(text).green(),
                Status::Failed => style(text).red().bold(),
                Status::Cancelled => style(text).yellow(),
                _ => style(text).dim(),
            };

            let _ = write!(f, "  {} {}", status, item.label);
            if item.is_output() {
                let targets: Vec<_> = item.meta_targets.iter().map(MetaTarget::as_str).collect();
                let _ = write!(f, " {}", style(format!("({})", targets.join(", "))).dim());
            }
            if let Some(error) = &item.error {
                let _ = write!(f, ": {}", error.root());
            }
            let _ = writeln!(f);
        }

        f
    }

    /// Renders the instantiation graph as a Mermaid diagram, color-coded by
    /// status.
    ///
    /// * **Green**: Succeeded
    /// * **Red**: Failed
    /// * **Yellow**: Cancelled
    /// * **Grey**: Never settled
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let ids: HashMap<&str, usize> = self
            .instances
            .iter()
            .enumerate()
            .map(|(i, item)| (item.label.as_str(), i))
            .collect();

        for (i, item) in self.instances.iter().enumerate() {
            let name = item.label.replace('"', "\\\"");

            let extra = match item.execution {
                Some(exec) => format!("{:.2?}", exec.duration),
                None => item.status.to_string(),
            };

            let color = match item.status {
                Status::Succeeded => "#90EE90",
                Status::Failed => "#FF7F7F",
                Status::Cancelled => "#FFE680",
                _ => "#D3D3D3",
            };

            let _ = writeln!(f, "    {i}[\"{name}\\n{extra}\"]");
            let _ = writeln!(f, "    style {i} fill:{color}");

            if item.is_output() {
                let _ = writeln!(f, "    {i} --> Output");
            }
        }

        let _ = writeln!(f, "    Output[Output]");

        for (i, item) in self.instances.iter().enumerate() {
            for producer in &item.producers {
                if let Some(source) = ids.get(producer.as_str()) {
                    let _ = writeln!(f, "    {source} --> {i}");
                }
            }
        }

        f
    }
}

// WATERFALL

struct XmlSafe<'a>(&'a str);

impl Display for XmlSafe<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => f.write_str("&lt;")?,
                '>' => f.write_str("&gt;")?,
                '&' => f.write_str("&amp;")?,
                '"' => f.write_str("&quot;")?,
                '\'' => f.write_str("&apos;")?,
                _ => f.write_char(c)?,
            }
        }
        Ok(())
    }
}

const ROW_HEIGHT: u32 = 24;
const LABEL_WIDTH: u32 = 320;
const CHART_WIDTH: u32 = 720;
const PADDING: u32 = 10;

impl RunReport {
    /// Renders the executed instantiations as an SVG waterfall chart.
    pub fn render_waterfall(&self) -> String {
        let mut ran: Vec<(&str, TaskExecution)> = self
            .instances
            .iter()
            .filter_map(|i| i.execution.map(|e| (i.label.as_str(), e)))
            .collect();

        if ran.is_empty() {
            return r#"<svg width="200" height="50" xmlns="http://www.w3.org/2000/svg"><text x="10" y="30" font-family="sans-serif">No tasks ran</text></svg>"#
                .to_string();
        }

        ran.sort_by_key(|(_, e)| e.offset);

        let total_micros = ran
            .iter()
            .map(|(_, e)| (e.offset + e.duration).as_micros())
            .max()
            .unwrap_or_default()
            .max(1) as f64;

        let width = LABEL_WIDTH + CHART_WIDTH + PADDING * 3;
        let height = (ran.len() as u32 + 1) * ROW_HEIGHT + PADDING;

        let mut svg = String::with_capacity(ran.len() * 300);
        let _ = write!(
            svg,
            r#"<svg width="{width}" height="{height}" xmlns="http://www.w3.org/2000/svg"><style>text {{ font-family: sans-serif; font-size: 12px; }} .bar {{ fill: #3b82f6; }}</style>"#
        );

        for (row, (label, exec)) in ran.iter().enumerate() {
            let y = (row as u32 + 1) * ROW_HEIGHT;
            let x = (LABEL_WIDTH + PADDING) as f64
                + exec.offset.as_micros() as f64 / total_micros * CHART_WIDTH as f64;
            let w = (exec.duration.as_micros() as f64 / total_micros * CHART_WIDTH as f64).max(1.0);

            let _ = write!(
                svg,
                r#"<text x="{PADDING}" y="{}">{}</text><rect class="bar" x="{x:.1}" y="{}" width="{w:.1}" height="{}"><title>{:.2?}</title></rect>"#,
                y + ROW_HEIGHT / 2,
                XmlSafe(label),
                y + 4,
                ROW_HEIGHT - 8,
                exec.duration,
            );
        }

        svg.push_str("</svg>");
        svg
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn item(label: &str, status: Status, targets: Vec<MetaTarget>) -> InstanceReport {
        InstanceReport {
            label: label.into(),
            task: label.into(),
            status,
            error: None,
            product: None,
            meta_targets: targets,
            execution: None,
            producers: vec![],
        }
    }

    #[test]
    fn test_success_ignores_untagged_failures() {
        let report = RunReport {
            instances: vec![
                item("a", Status::Failed, vec![]),
                item("b", Status::Succeeded, vec![MetaTarget::SCIENCE]),
            ],
        };
        assert!(report.is_success());
        assert_eq!(report.deliverables().count(), 1);

        let report = RunReport {
            instances: vec![item("c", Status::Failed, vec![MetaTarget::SCIENCE])],
        };
        assert!(!report.is_success());
        assert_eq!(report.failed_outputs().len(), 1);
    }

    #[test]
    fn test_cancelled_output_is_not_success() {
        let report = RunReport {
            instances: vec![
                item("bias", Status::Succeeded, vec![MetaTarget::QC1_CALIB]),
                item("science", Status::Cancelled, vec![MetaTarget::SCIENCE]),
                item("sci_extract", Status::Cancelled, vec![]),
            ],
        };

        assert!(!report.is_success());
        assert!(report.failed_outputs().is_empty());

        let missing: Vec<_> = report.missing_outputs().iter().map(|i| i.label.as_str()).collect();
        assert_eq!(missing, vec!["science"]);
    }

    #[test]
    fn test_cause_chain() {
        let mut failed = item("dark", Status::Failed, vec![]);
        failed.error = Some(TaskError::UpstreamFailed {
            producer: "bias".into(),
            cause: Box::new(TaskError::InvalidOutput("andes_cal_bias".into())),
        });

        assert_eq!(
            failed.cause_chain(),
            vec![
                "dark".to_string(),
                "bias".to_string(),
                "Recipe 'andes_cal_bias' returned no products".to_string(),
            ]
        );
    }

    #[test]
    fn test_render() {
        let mut a = item("bias", Status::Succeeded, vec![]);
        a.execution = Some(TaskExecution {
            offset: Duration::ZERO,
            duration: Duration::from_millis(3),
        });
        let mut b = item("dark<x>", Status::Failed, vec![MetaTarget::QC1_CALIB]);
        b.producers = vec!["bias".into()];

        let report = RunReport {
            instances: vec![a, b],
        };

        let mermaid = report.render_mermaid();
        assert!(mermaid.contains("0 --> 1"));
        assert!(mermaid.contains("1 --> Output"));
        assert!(mermaid.contains("style 1 fill:#FF7F7F"));

        let svg = report.render_waterfall();
        assert!(svg.contains("<title>"));
        assert!(!svg.contains("dark<x>"));
    }
}
