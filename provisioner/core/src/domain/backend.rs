// Copyright (c) 2026 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Container backend abstraction.
//!
//! Everything the provisioner needs from a container engine, expressed in
//! domain terms. The Swarm adapter in `infrastructure` implements this;
//! tests substitute an in-memory double.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::instance::{AgentInstance, AgentRegistration};
use crate::domain::job::JobIdentifier;
use crate::domain::profile::AgentProfile;
use crate::domain::settings::ClusterSettings;

/// Engine API level below which mounts and secrets cannot be attached to
/// services.
pub const MIN_MOUNT_SECRET_VERSION: ApiVersion = ApiVersion {
    major: 1,
    minor: 26,
};

/// Engine API version, ordered numerically (`1.26` > `1.9`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl ApiVersion {
    /// Parses the dotted form the engine reports, e.g. `"1.41"`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (major, minor) = raw.trim().split_once('.')?;
        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The engine could not be reached, timed out, or answered garbage.
    #[error("container engine unavailable: {0}")]
    Unavailable(String),
    /// The engine understood the request and refused it.
    #[error("{0}")]
    Rejected(String),
    #[error("no such instance: {0}")]
    NotFound(String),
    #[error("Docker API version {required} or higher is required to use {feature} (cluster reports {actual})")]
    UnsupportedVersion {
        feature: &'static str,
        required: ApiVersion,
        actual: ApiVersion,
    },
}

/// An engine-managed secret, by id and name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub id: String,
    pub name: String,
}

/// Raw description of one cluster node, as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeDescriptor {
    pub id: String,
    pub hostname: Option<String>,
    pub role: Option<String>,
    pub availability: Option<String>,
    pub state: Option<String>,
    pub address: Option<String>,
    pub engine_version: Option<String>,
    pub os: Option<String>,
    pub architecture: Option<String>,
    pub nano_cpus: Option<i64>,
    pub memory_bytes: Option<i64>,
}

#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Launches one agent instance for `job` and returns its identity.
    async fn create_instance(
        &self,
        profile: &AgentProfile,
        settings: &ClusterSettings,
        registration: &AgentRegistration,
        job: &JobIdentifier,
    ) -> Result<AgentInstance, BackendError>;

    /// Lists every instance this provisioner created, with task state.
    async fn list_instances(&self) -> Result<Vec<AgentInstance>, BackendError>;

    /// Removes an instance by name. `NotFound` if the engine has no such
    /// instance.
    async fn remove_instance(&self, name: &str) -> Result<(), BackendError>;

    /// Engine API version, used to gate mounts and secrets.
    async fn api_version(&self) -> Result<ApiVersion, BackendError>;

    /// Names of volumes known to the engine.
    async fn list_volumes(&self) -> Result<Vec<String>, BackendError>;

    /// Secrets known to the engine.
    async fn list_secrets(&self) -> Result<Vec<SecretRef>, BackendError>;

    /// Cluster nodes, for the status report.
    async fn list_nodes(&self) -> Result<Vec<NodeDescriptor>, BackendError>;

    /// Recent log output of one instance, newest lines last.
    async fn instance_logs(&self, name: &str) -> Result<String, BackendError>;
}
