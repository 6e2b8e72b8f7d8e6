// Copyright (c) 2026 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Provisioning service: the one path by which agent instances come into
//! existence and leave it.
//!
//! Every mutation starts from engine ground truth. A provisioning call
//! validates the profile, reconciles the registry against a fresh engine
//! snapshot, claims a capacity slot and only then creates the instance;
//! the slot is committed once the instance is registered and returned
//! automatically on any earlier exit.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, gauge};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::application::admission::{AdmissionController, AdmissionState, CapacityExceeded};
use crate::application::registry::InstanceRegistry;
use crate::application::validators::ValidationPipeline;
use crate::domain::backend::{BackendError, ContainerBackend};
use crate::domain::instance::{AgentInstance, AgentRegistration};
use crate::domain::job::JobIdentifier;
use crate::domain::profile::{AgentProfile, Properties};
use crate::domain::settings::{ClusterSettings, SettingsError};
use crate::domain::validation::ValidationResult;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("profile rejected: {0}")]
    InvalidProfile(ValidationResult),
    #[error(transparent)]
    InvalidSettings(#[from] SettingsError),
    #[error(transparent)]
    CapacityExceeded(#[from] CapacityExceeded),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// One request to launch an agent for a scheduled job.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub profile: Properties,
    pub cluster: Properties,
    pub registration: AgentRegistration,
    pub job: JobIdentifier,
}

pub struct ProvisioningService {
    backend: Arc<dyn ContainerBackend>,
    registry: Arc<InstanceRegistry>,
    admission: AdmissionController,
    profile_pipeline: ValidationPipeline,
    defaults: ClusterSettings,
}

impl ProvisioningService {
    pub fn new(
        backend: Arc<dyn ContainerBackend>,
        registry: Arc<InstanceRegistry>,
        defaults: ClusterSettings,
    ) -> Self {
        let admission = AdmissionController::new(defaults.max_instances);
        let profile_pipeline = ValidationPipeline::profile(Arc::clone(&backend));
        Self {
            backend,
            registry,
            admission,
            profile_pipeline,
            defaults,
        }
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn defaults(&self) -> &ClusterSettings {
        &self.defaults
    }

    pub fn admission_state(&self) -> AdmissionState {
        self.admission.state()
    }

    pub async fn validate_profile(&self, properties: &Properties) -> ValidationResult {
        self.profile_pipeline.run(properties).await
    }

    /// Request-scoped settings: a request carrying cluster properties
    /// overrides the daemon defaults wholesale.
    pub fn settings_for(&self, cluster: &Properties) -> Result<ClusterSettings, SettingsError> {
        if cluster.is_empty() {
            Ok(self.defaults.clone())
        } else {
            ClusterSettings::from_properties(cluster)
        }
    }

    /// One reconcile pass: snapshot the engine, merge the registry,
    /// re-target admission around the observed count. A failed listing
    /// leaves the registry untouched.
    pub async fn refresh(&self, settings: &ClusterSettings) -> Result<(), BackendError> {
        let snapshot_started = Instant::now();
        let live = self.backend.list_instances().await?;
        self.registry.reconcile(snapshot_started, live);
        let observed = self.registry.instance_count();
        self.admission.resize(settings.max_instances, observed);
        gauge!("gantry_agents_running").set(observed as f64);
        debug!(
            "Reconciled {} agent instances against a ceiling of {}",
            observed, settings.max_instances
        );
        Ok(())
    }

    pub async fn provision(&self, request: &ProvisionRequest) -> Result<AgentInstance, ProvisionError> {
        let validation = self.profile_pipeline.run(&request.profile).await;
        if !validation.is_ok() {
            return Err(ProvisionError::InvalidProfile(validation));
        }
        let settings = self.settings_for(&request.cluster)?;
        let profile = AgentProfile::from_properties(&request.profile);

        self.refresh(&settings).await?;
        let ticket = self.admission.try_admit()?;

        let instance = self
            .backend
            .create_instance(&profile, &settings, &request.registration, &request.job)
            .await?;
        info!(
            "Created agent instance {} for job {}",
            instance.name,
            request.job.represent()
        );
        self.registry.register(instance.clone());
        ticket.commit();
        counter!("gantry_agents_created_total").increment(1);
        Ok(instance)
    }

    pub async fn terminate(&self, name: &str) -> Result<(), BackendError> {
        self.backend.remove_instance(name).await?;
        self.registry.remove(name);
        counter!("gantry_agents_removed_total").increment(1);
        info!("Terminated agent instance {}", name);
        Ok(())
    }

    /// Removes instances the orchestrator does not recognize once they
    /// outlive the auto-register window. Returns the names actually
    /// removed; individual removal failures are logged and skipped so one
    /// wedged instance cannot shield the rest.
    pub async fn terminate_unregistered(
        &self,
        known: &[String],
        settings: &ClusterSettings,
    ) -> Result<Vec<String>, BackendError> {
        self.refresh(settings).await?;
        let stale = self
            .registry
            .unregistered_instances(known, settings.auto_register_window());
        let mut removed = Vec::with_capacity(stale.len());
        for name in stale {
            match self.terminate(&name).await {
                Ok(()) => removed.push(name),
                Err(err) => warn!("Could not remove unregistered instance {}: {}", name, err),
            }
        }
        Ok(removed)
    }
}
