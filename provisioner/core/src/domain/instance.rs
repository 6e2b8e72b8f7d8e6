// Copyright (c) 2026 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Running agent instances and the labels that tie them to build jobs.
//!
//! The engine is the source of truth: every instance the provisioner
//! creates is labelled with its creator and the JSON-encoded job identity,
//! so a restarted daemon can re-adopt its fleet from a plain listing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::job::JobIdentifier;

/// Label carrying the JSON-encoded [`JobIdentifier`].
pub const JOB_IDENTIFIER_LABEL: &str = "cd.gantry.job-identifier";
/// Label marking instances this provisioner owns; also the list selector.
pub const CREATED_BY_LABEL: &str = "cd.gantry.created-by";
pub const PROVISIONER_NAME: &str = "gantry";

/// Environment injected into every launched agent.
pub const SERVER_URL_ENV: &str = "AGENT_SERVER_URL";
pub const AUTO_REGISTER_KEY_ENV: &str = "AGENT_AUTO_REGISTER_KEY";
pub const AUTO_REGISTER_ENVIRONMENT_ENV: &str = "AGENT_AUTO_REGISTER_ENVIRONMENT";
pub const AGENT_ID_ENV: &str = "AGENT_AUTO_REGISTER_AGENT_ID";

/// The job label on an engine object could not be read back.
#[derive(Debug, Error)]
pub enum CorrelationError {
    #[error("instance carries no job identifier label")]
    Missing,
    #[error("job identifier label is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub fn encode_job_label(job: &JobIdentifier) -> Result<String, serde_json::Error> {
    serde_json::to_string(job)
}

pub fn decode_job_label(raw: Option<&str>) -> Result<JobIdentifier, CorrelationError> {
    let raw = raw.ok_or(CorrelationError::Missing)?;
    Ok(serde_json::from_str(raw)?)
}

/// Auto-registration material forwarded from the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub auto_register_key: Option<String>,
    pub environment: Option<String>,
}

/// Condensed state of one scheduling unit of an instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskSummary {
    pub id: String,
    pub node_id: Option<String>,
    pub state: String,
    pub desired_state: Option<String>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// One agent instance as the engine reports it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentInstance {
    /// Engine-assigned object id.
    pub id: String,
    /// Instance name; doubles as the agent id the orchestrator knows.
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub image: Option<String>,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub environment: Vec<String>,
    pub hosts: Vec<String>,
    pub constraints: Vec<String>,
    pub memory_limit: Option<i64>,
    pub memory_reservation: Option<i64>,
    pub job: Option<JobIdentifier>,
    pub tasks: Vec<TaskSummary>,
}

impl AgentInstance {
    /// Environment entries safe to show in status reports. The
    /// auto-register key is a credential and never leaves the daemon.
    pub fn visible_environment(&self) -> Vec<String> {
        self.environment
            .iter()
            .filter(|entry| {
                let key = entry
                    .split_once('=')
                    .map(|(key, _)| key)
                    .unwrap_or(entry.as_str());
                key != AUTO_REGISTER_KEY_ENV
            })
            .cloned()
            .collect()
    }
}
