// Copyright (c) 2026 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Status reports for operators and the orchestrator's UI.
//!
//! Reports are plain serializable views assembled from the registry and
//! the engine. Anything the engine did not say renders as
//! `"Not Specified"` rather than an empty cell, and log retrieval is
//! best-effort: a report never fails because logs did.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::application::provisioning::ProvisioningService;
use crate::domain::backend::{BackendError, ContainerBackend, NodeDescriptor};
use crate::domain::instance::{AgentInstance, TaskSummary};
use crate::domain::job::JobIdentifier;
use crate::domain::size::format_size;

pub const NOT_SPECIFIED: &str = "Not Specified";

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("agent instance `{0}` is not registered")]
    NotFound(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Detailed view of one agent instance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusReport {
    pub name: String,
    pub service_id: String,
    pub image: String,
    pub command: String,
    pub args: String,
    pub environment: Vec<String>,
    pub hosts: String,
    pub constraints: String,
    pub memory_limit: String,
    pub memory_reservation: String,
    pub created_at: Option<DateTime<Utc>>,
    pub job: Option<JobIdentifier>,
    pub job_representation: String,
    pub tasks: Vec<TaskReport>,
    pub logs: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskReport {
    pub id: String,
    pub node_id: String,
    pub state: String,
    pub desired_state: String,
    pub message: String,
    pub error: String,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Cluster-wide view: nodes plus every tracked instance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatusReport {
    pub nodes: Vec<NodeReport>,
    pub instances: Vec<InstanceSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeReport {
    pub id: String,
    pub hostname: String,
    pub role: String,
    pub availability: String,
    pub state: String,
    pub address: String,
    pub engine_version: String,
    pub os: String,
    pub architecture: String,
    pub cpus: String,
    pub memory: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub name: String,
    pub service_id: String,
    pub image: String,
    pub job: Option<JobIdentifier>,
    pub created_at: Option<DateTime<Utc>>,
    pub state: String,
}

pub struct StatusService {
    backend: Arc<dyn ContainerBackend>,
    provisioning: Arc<ProvisioningService>,
}

impl StatusService {
    pub fn new(backend: Arc<dyn ContainerBackend>, provisioning: Arc<ProvisioningService>) -> Self {
        Self {
            backend,
            provisioning,
        }
    }

    pub async fn cluster_report(&self) -> Result<ClusterStatusReport, StatusError> {
        self.provisioning
            .refresh(self.provisioning.defaults())
            .await?;
        let nodes = self
            .backend
            .list_nodes()
            .await?
            .into_iter()
            .map(node_report)
            .collect();
        let instances = self
            .provisioning
            .registry()
            .snapshot()
            .into_iter()
            .map(instance_summary)
            .collect();
        Ok(ClusterStatusReport { nodes, instances })
    }

    pub async fn agent_report(&self, name: &str) -> Result<AgentStatusReport, StatusError> {
        self.provisioning
            .refresh(self.provisioning.defaults())
            .await?;
        let registry = self.provisioning.registry();
        let instance = registry
            .get(name)
            .ok_or_else(|| StatusError::NotFound(name.to_string()))?;
        let logs = match self.backend.instance_logs(name).await {
            Ok(text) => {
                if !text.trim().is_empty() {
                    registry.update_log_tail(name, text.clone());
                }
                text
            }
            Err(err) => {
                warn!("Could not fetch logs for {}: {}", name, err);
                match registry.log_tail(name) {
                    Some(tail) => format!("{tail}\n(log fetch failed: {err})"),
                    None => format!("Logs are not available: {err}"),
                }
            }
        };
        Ok(build_agent_report(&instance, logs))
    }
}

// ============================================================================
// Report builders
// ============================================================================

pub fn build_agent_report(instance: &AgentInstance, logs: String) -> AgentStatusReport {
    AgentStatusReport {
        name: instance.name.clone(),
        service_id: instance.id.clone(),
        image: or_not_specified(instance.image.as_deref()),
        command: join_or_not_specified(&instance.command),
        args: join_or_not_specified(&instance.args),
        environment: instance.visible_environment(),
        hosts: join_or_not_specified(&instance.hosts),
        constraints: join_or_not_specified(&instance.constraints),
        memory_limit: format_or_not_specified(instance.memory_limit),
        memory_reservation: format_or_not_specified(instance.memory_reservation),
        created_at: instance.created_at,
        job: instance.job.clone(),
        job_representation: instance
            .job
            .as_ref()
            .map(|job| job.represent())
            .unwrap_or_else(|| NOT_SPECIFIED.to_string()),
        tasks: instance.tasks.iter().map(task_report).collect(),
        logs,
    }
}

fn task_report(task: &TaskSummary) -> TaskReport {
    TaskReport {
        id: task.id.clone(),
        node_id: or_not_specified(task.node_id.as_deref()),
        state: or_not_specified(Some(task.state.as_str())),
        desired_state: or_not_specified(task.desired_state.as_deref()),
        message: task.message.clone().unwrap_or_default(),
        error: task.error.clone().unwrap_or_default(),
        timestamp: task.timestamp,
    }
}

fn node_report(node: NodeDescriptor) -> NodeReport {
    NodeReport {
        hostname: or_not_specified(node.hostname.as_deref()),
        role: or_not_specified(node.role.as_deref()),
        availability: or_not_specified(node.availability.as_deref()),
        state: or_not_specified(node.state.as_deref()),
        address: or_not_specified(node.address.as_deref()),
        engine_version: or_not_specified(node.engine_version.as_deref()),
        os: or_not_specified(node.os.as_deref()),
        architecture: or_not_specified(node.architecture.as_deref()),
        cpus: node
            .nano_cpus
            .map(|nanos| (nanos as f64 / 1e9).to_string())
            .unwrap_or_else(|| NOT_SPECIFIED.to_string()),
        memory: format_or_not_specified(node.memory_bytes),
        id: node.id,
    }
}

fn instance_summary(instance: AgentInstance) -> InstanceSummary {
    InstanceSummary {
        state: headline_state(&instance.tasks),
        image: or_not_specified(instance.image.as_deref()),
        created_at: instance.created_at,
        name: instance.name,
        service_id: instance.id,
        job: instance.job,
    }
}

/// State of the most recently updated task, the one an operator means by
/// "what is this instance doing".
fn headline_state(tasks: &[TaskSummary]) -> String {
    tasks
        .iter()
        .max_by_key(|task| task.timestamp)
        .map(|task| or_not_specified(Some(task.state.as_str())))
        .unwrap_or_else(|| NOT_SPECIFIED.to_string())
}

fn or_not_specified(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => NOT_SPECIFIED.to_string(),
    }
}

fn join_or_not_specified(items: &[String]) -> String {
    if items.is_empty() {
        NOT_SPECIFIED.to_string()
    } else {
        items.join("\n")
    }
}

fn format_or_not_specified(bytes: Option<i64>) -> String {
    match bytes {
        Some(bytes) if bytes > 0 => format_size(bytes),
        _ => NOT_SPECIFIED.to_string(),
    }
}
