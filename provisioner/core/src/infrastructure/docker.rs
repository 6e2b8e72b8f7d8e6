// Copyright (c) 2026 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Docker Swarm backend: one agent instance is one replicated service
//! with a single replica and restarts disabled.
//!
//! All engine traffic funnels through here. Every call carries a timeout
//! so a wedged engine degrades into a clean `Unavailable` error instead
//! of hanging a provisioning request.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::errors::Error as BollardError;
use bollard::models::{
    Limit, Mount, MountTypeEnum, NetworkAttachmentConfig, Node, ResourceObject, Service,
    ServiceSpec, ServiceSpecMode, ServiceSpecModeReplicated, Task, TaskSpec,
    TaskSpecContainerSpec, TaskSpecContainerSpecFile, TaskSpecContainerSpecSecrets,
    TaskSpecPlacement, TaskSpecResources, TaskSpecRestartPolicy,
    TaskSpecRestartPolicyConditionEnum,
};
use bollard::query_parameters::{
    ListNodesOptions, ListSecretsOptions, ListServicesOptions, ListTasksOptions,
    ListVolumesOptions, LogsOptions,
};
use bollard::Docker;
use futures::StreamExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::backend::{
    ApiVersion, BackendError, ContainerBackend, NodeDescriptor, SecretRef,
    MIN_MOUNT_SECRET_VERSION,
};
use crate::domain::instance::{
    decode_job_label, encode_job_label, AgentInstance, AgentRegistration, TaskSummary,
    AGENT_ID_ENV, AUTO_REGISTER_ENVIRONMENT_ENV, AUTO_REGISTER_KEY_ENV, CREATED_BY_LABEL,
    JOB_IDENTIFIER_LABEL, PROVISIONER_NAME, SERVER_URL_ENV,
};
use crate::domain::job::JobIdentifier;
use crate::domain::profile::{AgentProfile, HostEntry, MountSpec, SecretSpec};
use crate::domain::settings::ClusterSettings;

const CONNECT_TIMEOUT_SECS: u64 = 120;
const LOG_TAIL_LINES: usize = 200;

pub struct SwarmBackend {
    docker: Docker,
    call_timeout: Duration,
}

impl SwarmBackend {
    /// Connects to the engine at `uri` (`unix://` or `tcp://`/`http://`),
    /// or lets the client auto-detect when no URI is given.
    pub fn connect(uri: Option<&str>, call_timeout: Duration) -> Result<Self, BackendError> {
        let connected = match uri.map(str::trim).filter(|uri| !uri.is_empty()) {
            None => Docker::connect_with_local_defaults(),
            #[cfg(unix)]
            Some(uri) if uri.starts_with("unix://") => {
                Docker::connect_with_unix(uri, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            Some(uri) if uri.starts_with("tcp://") || uri.starts_with("http://") => {
                Docker::connect_with_http(uri, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            Some(other) => {
                return Err(BackendError::Unavailable(format!(
                    "unsupported docker URI `{other}`"
                )))
            }
        };
        let docker = connected.map_err(|err| {
            BackendError::Unavailable(format!("Failed to connect to Docker: {err}"))
        })?;
        Ok(Self {
            docker,
            call_timeout,
        })
    }

    async fn call<T, F>(&self, fut: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, BollardError>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result.map_err(map_engine_error),
            Err(_) => Err(BackendError::Unavailable(format!(
                "engine call timed out after {:?}",
                self.call_timeout
            ))),
        }
    }

    /// Resolves secret names to engine ids. The engine insists on ids in
    /// the service spec even though operators write names.
    async fn resolve_secrets(
        &self,
        specs: &[SecretSpec],
    ) -> Result<Option<Vec<TaskSpecContainerSpecSecrets>>, BackendError> {
        if specs.is_empty() {
            return Ok(None);
        }
        let catalog = self.list_secrets().await?;
        let mut resolved = Vec::with_capacity(specs.len());
        for spec in specs {
            let known = catalog
                .iter()
                .find(|secret| secret.name == spec.source)
                .ok_or_else(|| {
                    BackendError::Rejected(format!("Secret `{}` does not exist.", spec.source))
                })?;
            resolved.push(TaskSpecContainerSpecSecrets {
                file: Some(TaskSpecContainerSpecFile {
                    name: Some(spec.target.clone()),
                    ..Default::default()
                }),
                secret_id: Some(known.id.clone()),
                secret_name: Some(known.name.clone()),
            });
        }
        Ok(Some(resolved))
    }
}

#[async_trait]
impl ContainerBackend for SwarmBackend {
    async fn create_instance(
        &self,
        profile: &AgentProfile,
        settings: &ClusterSettings,
        registration: &AgentRegistration,
        job: &JobIdentifier,
    ) -> Result<AgentInstance, BackendError> {
        let name = format!("agent-{}", Uuid::new_v4().simple());

        let mounts = profile
            .parsed_mounts()
            .map_err(|err| BackendError::Rejected(err.to_string()))?;
        let secret_specs = profile
            .parsed_secrets()
            .map_err(|err| BackendError::Rejected(err.to_string()))?;
        let hosts = profile
            .parsed_hosts()
            .map_err(|err| BackendError::Rejected(err.to_string()))?;

        if !mounts.is_empty() || !secret_specs.is_empty() {
            let version = self.api_version().await?;
            if version < MIN_MOUNT_SECRET_VERSION {
                return Err(BackendError::UnsupportedVersion {
                    feature: "mounts and secrets",
                    required: MIN_MOUNT_SECRET_VERSION,
                    actual: version,
                });
            }
        }
        let secrets = self.resolve_secrets(&secret_specs).await?;

        let memory_limit = parse_memory(profile.max_memory.as_deref())?;
        let memory_reservation = parse_memory(profile.reserved_memory.as_deref())?;

        let mut env = profile.environment.clone();
        env.push(format!("{}={}", SERVER_URL_ENV, settings.server_url));
        env.push(format!("{AGENT_ID_ENV}={name}"));
        if let Some(key) = &registration.auto_register_key {
            env.push(format!("{AUTO_REGISTER_KEY_ENV}={key}"));
        }
        if let Some(environment) = &registration.environment {
            env.push(format!("{AUTO_REGISTER_ENVIRONMENT_ENV}={environment}"));
        }

        let job_label = encode_job_label(job)
            .map_err(|err| BackendError::Rejected(format!("could not encode job label: {err}")))?;
        let mut labels = HashMap::new();
        labels.insert(CREATED_BY_LABEL.to_string(), PROVISIONER_NAME.to_string());
        labels.insert(JOB_IDENTIFIER_LABEL.to_string(), job_label);

        let host_lines: Vec<String> = hosts.iter().map(HostEntry::to_line).collect();
        let container_spec = TaskSpecContainerSpec {
            image: profile.image.clone(),
            labels: Some(labels.clone()),
            command: non_empty(profile.command.clone()),
            env: Some(env.clone()),
            mounts: build_mounts(&mounts),
            secrets,
            hosts: non_empty(host_lines.clone()),
            ..Default::default()
        };
        let resources = TaskSpecResources {
            limits: memory_limit.map(|bytes| Limit {
                memory_bytes: Some(bytes),
                ..Default::default()
            }),
            reservations: memory_reservation.map(|bytes| ResourceObject {
                memory_bytes: Some(bytes),
                ..Default::default()
            }),
            ..Default::default()
        };
        let placement = TaskSpecPlacement {
            constraints: non_empty(profile.constraints.clone()),
            ..Default::default()
        };
        let networks: Option<Vec<NetworkAttachmentConfig>> = non_empty(
            profile
                .networks
                .iter()
                .map(|network| NetworkAttachmentConfig {
                    target: Some(network.clone()),
                    ..Default::default()
                })
                .collect(),
        );

        let spec = ServiceSpec {
            name: Some(name.clone()),
            labels: Some(labels),
            task_template: Some(TaskSpec {
                container_spec: Some(container_spec),
                resources: Some(resources),
                placement: Some(placement),
                // One-shot build agents; the orchestrator re-provisions,
                // the engine must not.
                restart_policy: Some(TaskSpecRestartPolicy {
                    condition: Some(TaskSpecRestartPolicyConditionEnum::NONE),
                    ..Default::default()
                }),
                networks,
                ..Default::default()
            }),
            mode: Some(ServiceSpecMode {
                replicated: Some(ServiceSpecModeReplicated { replicas: Some(1) }),
                ..Default::default()
            }),
            ..Default::default()
        };

        let credentials = settings
            .private_registry
            .as_ref()
            .map(|registry| DockerCredentials {
                username: Some(registry.username.clone()),
                password: Some(registry.password.clone()),
                serveraddress: Some(registry.server.clone()),
                ..Default::default()
            });

        let response = self
            .call(self.docker.create_service(spec, credentials))
            .await?;
        let id = response.id.unwrap_or_default();
        if let Some(warnings) = response
            .warnings
            .as_deref()
            .filter(|warnings| !warnings.is_empty())
        {
            warn!("Service {} created with warnings: {:?}", name, warnings);
        }
        info!(
            "Created swarm service {} ({}) for job {}",
            name,
            id,
            job.represent()
        );

        Ok(AgentInstance {
            id,
            name,
            created_at: Some(chrono::Utc::now()),
            image: profile.image.clone(),
            command: profile.command.clone(),
            args: Vec::new(),
            environment: env,
            hosts: host_lines,
            constraints: profile.constraints.clone(),
            memory_limit,
            memory_reservation,
            job: Some(job.clone()),
            tasks: Vec::new(),
        })
    }

    async fn list_instances(&self) -> Result<Vec<AgentInstance>, BackendError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{CREATED_BY_LABEL}={PROVISIONER_NAME}")],
        );
        let services = self
            .call(self.docker.list_services(Some(ListServicesOptions {
                filters: Some(filters),
                ..Default::default()
            })))
            .await?;
        let tasks = self
            .call(self.docker.list_tasks(None::<ListTasksOptions>))
            .await?;
        Ok(services
            .into_iter()
            .map(|service| map_instance(service, &tasks))
            .collect())
    }

    async fn remove_instance(&self, name: &str) -> Result<(), BackendError> {
        self.call(self.docker.delete_service(name)).await?;
        info!("Removed swarm service {}", name);
        Ok(())
    }

    async fn api_version(&self) -> Result<ApiVersion, BackendError> {
        let version = self.call(self.docker.version()).await?;
        version
            .api_version
            .as_deref()
            .and_then(ApiVersion::parse)
            .ok_or_else(|| {
                BackendError::Unavailable("engine did not report an API version".to_string())
            })
    }

    async fn list_volumes(&self) -> Result<Vec<String>, BackendError> {
        let response = self
            .call(self.docker.list_volumes(None::<ListVolumesOptions>))
            .await?;
        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|volume| volume.name)
            .collect())
    }

    async fn list_secrets(&self) -> Result<Vec<SecretRef>, BackendError> {
        let secrets = self
            .call(self.docker.list_secrets(None::<ListSecretsOptions>))
            .await?;
        Ok(secrets
            .into_iter()
            .filter_map(|secret| {
                let id = secret.id?;
                let name = secret.spec.and_then(|spec| spec.name)?;
                Some(SecretRef { id, name })
            })
            .collect())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeDescriptor>, BackendError> {
        let nodes = self
            .call(self.docker.list_nodes(None::<ListNodesOptions>))
            .await?;
        Ok(nodes.into_iter().map(map_node).collect())
    }

    async fn instance_logs(&self, name: &str) -> Result<String, BackendError> {
        let options = LogsOptions {
            stdout: true,
            stderr: true,
            tail: LOG_TAIL_LINES.to_string(),
            ..Default::default()
        };
        let collect = async {
            let mut stream = self.docker.service_logs(name, Some(options));
            let mut text = String::new();
            while let Some(entry) = stream.next().await {
                match entry? {
                    bollard::container::LogOutput::StdOut { message }
                    | bollard::container::LogOutput::StdErr { message } => {
                        text.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
            Ok::<String, BollardError>(text)
        };
        match tokio::time::timeout(self.call_timeout, collect).await {
            Ok(result) => result.map_err(map_engine_error),
            Err(_) => Err(BackendError::Unavailable(format!(
                "log fetch timed out after {:?}",
                self.call_timeout
            ))),
        }
    }
}

fn map_engine_error(error: BollardError) -> BackendError {
    match error {
        BollardError::DockerResponseServerError {
            status_code: 404,
            message,
        } => BackendError::NotFound(message),
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => BackendError::Rejected(format!("{message} (HTTP {status_code})")),
        other => BackendError::Unavailable(other.to_string()),
    }
}

fn parse_memory(raw: Option<&str>) -> Result<Option<i64>, BackendError> {
    raw.map(crate::domain::size::parse_size)
        .transpose()
        .map(|bytes| bytes.map(|bytes| bytes as i64))
        .map_err(|err| BackendError::Rejected(err.to_string()))
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

fn build_mounts(mounts: &[MountSpec]) -> Option<Vec<Mount>> {
    non_empty(
        mounts
            .iter()
            .map(|mount| Mount {
                typ: Some(MountTypeEnum::VOLUME),
                source: mount.source.clone(),
                target: Some(mount.target.clone()),
                read_only: Some(mount.read_only),
                ..Default::default()
            })
            .collect(),
    )
}

fn map_instance(service: Service, tasks: &[Task]) -> AgentInstance {
    let id = service.id.unwrap_or_default();
    let spec = service.spec.unwrap_or_default();
    let name = spec.name.unwrap_or_else(|| id.clone());
    let labels = spec.labels.unwrap_or_default();
    let job = match decode_job_label(labels.get(JOB_IDENTIFIER_LABEL).map(String::as_str)) {
        Ok(job) => Some(job),
        Err(err) => {
            warn!("Service {} has no usable job label: {}", name, err);
            None
        }
    };
    let task_template = spec.task_template.unwrap_or_default();
    let container = task_template.container_spec.unwrap_or_default();
    let resources = task_template.resources.unwrap_or_default();
    let memory_limit = resources
        .limits
        .as_ref()
        .and_then(|limits| limits.memory_bytes);
    let memory_reservation = resources
        .reservations
        .as_ref()
        .and_then(|reservations| reservations.memory_bytes);
    let constraints = task_template
        .placement
        .and_then(|placement| placement.constraints)
        .unwrap_or_default();

    let mut summaries: Vec<TaskSummary> = tasks
        .iter()
        .filter(|task| task.service_id.as_deref() == Some(id.as_str()))
        .map(map_task)
        .collect();
    summaries.sort_by(|a, b| a.id.cmp(&b.id));

    AgentInstance {
        created_at: service.created_at,
        image: container.image,
        command: container.command.unwrap_or_default(),
        args: container.args.unwrap_or_default(),
        environment: container.env.unwrap_or_default(),
        hosts: container.hosts.unwrap_or_default(),
        constraints,
        memory_limit,
        memory_reservation,
        job,
        tasks: summaries,
        id,
        name,
    }
}

fn map_task(task: &Task) -> TaskSummary {
    let status = task.status.clone().unwrap_or_default();
    TaskSummary {
        id: task.id.clone().unwrap_or_default(),
        node_id: task.node_id.clone(),
        state: status
            .state
            .map(|state| format!("{state:?}"))
            .unwrap_or_default(),
        desired_state: task.desired_state.map(|state| format!("{state:?}")),
        message: status.message,
        error: status.err,
        timestamp: status.timestamp,
    }
}

fn map_node(node: Node) -> NodeDescriptor {
    let spec = node.spec.unwrap_or_default();
    let description = node.description.unwrap_or_default();
    let platform = description.platform.unwrap_or_default();
    let resources = description.resources.unwrap_or_default();
    let status = node.status.unwrap_or_default();
    NodeDescriptor {
        id: node.id.unwrap_or_default(),
        hostname: description.hostname,
        role: spec.role.map(|role| format!("{role:?}")),
        availability: spec
            .availability
            .map(|availability| format!("{availability:?}")),
        state: status.state.map(|state| format!("{state:?}")),
        address: status.addr,
        engine_version: description
            .engine
            .and_then(|engine| engine.engine_version),
        os: platform.os,
        architecture: platform.architecture,
        nano_cpus: resources.nano_cpus,
        memory_bytes: resources.memory_bytes,
    }
}
