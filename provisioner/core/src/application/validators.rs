// Copyright (c) 2026 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Validation pipelines for agent profiles and cluster settings.
//!
//! Each validator contributes zero or more keyed errors; a pipeline runs
//! its validators in order and concatenates everything they found, so the
//! operator sees the full list in one round. Engine-dependent checks
//! (volumes, secrets, API level) collapse to a single clear error when
//! the engine cannot be asked.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;
use url::Url;

use crate::domain::backend::{BackendError, ContainerBackend, MIN_MOUNT_SECRET_VERSION};
use crate::domain::profile::{keys, AgentProfile, Properties};
use crate::domain::settings::keys as cluster_keys;
use crate::domain::size::parse_size;
use crate::domain::validation::ValidationResult;

/// Smallest admissible memory setting, matching the engine's own floor.
const MEMORY_FLOOR: u64 = 4 * 1024 * 1024;

/// Path suffix every orchestrator callback URL carries.
pub const SERVER_URL_SUFFIX: &str = "/go";

#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, properties: &Properties) -> ValidationResult;
}

pub struct ValidationPipeline {
    validators: Vec<Box<dyn Validator>>,
}

impl ValidationPipeline {
    /// Pipeline for agent profiles. Consults the engine for volumes,
    /// secrets and the API level.
    pub fn profile(backend: Arc<dyn ContainerBackend>) -> Self {
        Self {
            validators: vec![
                Box::new(RequiredFieldsValidator),
                Box::new(KnownFieldsValidator),
                Box::new(MemoryValidator),
                Box::new(MountsValidator {
                    backend: Arc::clone(&backend),
                }),
                Box::new(SecretsValidator { backend }),
                Box::new(HostsValidator),
            ],
        }
    }

    /// Pipeline for cluster settings. Purely local.
    pub fn cluster() -> Self {
        Self {
            validators: vec![
                Box::new(ServerUrlValidator),
                Box::new(MaxInstancesValidator),
                Box::new(PrivateRegistryValidator),
            ],
        }
    }

    pub async fn run(&self, properties: &Properties) -> ValidationResult {
        let mut result = ValidationResult::new();
        for validator in &self.validators {
            result.merge(validator.validate(properties).await);
        }
        result
    }
}

// ============================================================================
// Profile validators
// ============================================================================

struct RequiredFieldsValidator;

#[async_trait]
impl Validator for RequiredFieldsValidator {
    async fn validate(&self, properties: &Properties) -> ValidationResult {
        let mut result = ValidationResult::new();
        let image = properties.get(keys::IMAGE).map(|v| v.trim()).unwrap_or("");
        if image.is_empty() {
            result.add_error(keys::IMAGE, "Image must not be blank.");
        }
        result
    }
}

struct KnownFieldsValidator;

#[async_trait]
impl Validator for KnownFieldsValidator {
    async fn validate(&self, properties: &Properties) -> ValidationResult {
        let mut result = ValidationResult::new();
        let mut unknown: Vec<&String> = properties
            .keys()
            .filter(|key| !keys::ALL.contains(&key.as_str()))
            .collect();
        unknown.sort();
        for key in unknown {
            result.add_error(key, "Is an unknown property");
        }
        result
    }
}

struct MemoryValidator;

impl MemoryValidator {
    /// Parses one memory property, recording floor violations and parse
    /// failures. Returns the byte count only if it parsed.
    fn parse_field(
        properties: &Properties,
        key: &'static str,
        result: &mut ValidationResult,
    ) -> Option<u64> {
        let raw = properties
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())?;
        match parse_size(raw) {
            Ok(bytes) => {
                if bytes < MEMORY_FLOOR {
                    result.add_error(key, "Minimum allowed value is 4M");
                }
                Some(bytes)
            }
            Err(err) => {
                result.add_error(key, err.to_string());
                None
            }
        }
    }
}

#[async_trait]
impl Validator for MemoryValidator {
    async fn validate(&self, properties: &Properties) -> ValidationResult {
        let mut result = ValidationResult::new();
        let max = Self::parse_field(properties, keys::MAX_MEMORY, &mut result);
        let reserved = Self::parse_field(properties, keys::RESERVED_MEMORY, &mut result);
        if let (Some(max), Some(reserved)) = (max, reserved) {
            if max < reserved {
                result.add_error(keys::MAX_MEMORY, "Max memory is lower than reserved memory");
            }
        }
        result
    }
}

/// Confirms the engine is new enough for `feature`, or explains why the
/// question could not be answered.
async fn check_api_version(
    backend: &dyn ContainerBackend,
    feature: &'static str,
) -> Result<(), String> {
    match backend.api_version().await {
        Ok(version) if version < MIN_MOUNT_SECRET_VERSION => {
            Err(BackendError::UnsupportedVersion {
                feature,
                required: MIN_MOUNT_SECRET_VERSION,
                actual: version,
            }
            .to_string())
        }
        Ok(_) => Ok(()),
        Err(err) => Err(format!("Could not determine Docker API version: {err}")),
    }
}

struct MountsValidator {
    backend: Arc<dyn ContainerBackend>,
}

#[async_trait]
impl Validator for MountsValidator {
    async fn validate(&self, properties: &Properties) -> ValidationResult {
        let mut result = ValidationResult::new();
        let profile = AgentProfile::from_properties(properties);
        if profile.mounts.is_none() {
            return result;
        }
        let mounts = match profile.parsed_mounts() {
            Ok(mounts) => mounts,
            Err(err) => {
                result.add_error(keys::MOUNTS, err.to_string());
                return result;
            }
        };
        if let Err(message) = check_api_version(self.backend.as_ref(), "volume mounts").await {
            result.add_error(keys::MOUNTS, message);
            return result;
        }
        let volumes = match self.backend.list_volumes().await {
            Ok(volumes) => volumes,
            Err(err) => {
                warn!("Could not list volumes while validating a profile: {}", err);
                result.add_error(keys::MOUNTS, format!("Could not list volumes: {err}"));
                return result;
            }
        };
        for mount in &mounts {
            if let Some(source) = &mount.source {
                if !volumes.iter().any(|volume| volume == source) {
                    result.add_error(keys::MOUNTS, format!("Volume `{source}` does not exist."));
                }
            }
        }
        result
    }
}

struct SecretsValidator {
    backend: Arc<dyn ContainerBackend>,
}

#[async_trait]
impl Validator for SecretsValidator {
    async fn validate(&self, properties: &Properties) -> ValidationResult {
        let mut result = ValidationResult::new();
        let profile = AgentProfile::from_properties(properties);
        if profile.secrets.is_none() {
            return result;
        }
        let secrets = match profile.parsed_secrets() {
            Ok(secrets) => secrets,
            Err(err) => {
                result.add_error(keys::SECRETS, err.to_string());
                return result;
            }
        };
        if let Err(message) = check_api_version(self.backend.as_ref(), "secrets").await {
            result.add_error(keys::SECRETS, message);
            return result;
        }
        let catalog = match self.backend.list_secrets().await {
            Ok(catalog) => catalog,
            Err(err) => {
                warn!("Could not list secrets while validating a profile: {}", err);
                result.add_error(keys::SECRETS, format!("Could not list secrets: {err}"));
                return result;
            }
        };
        for secret in &secrets {
            if !catalog.iter().any(|known| known.name == secret.source) {
                result.add_error(
                    keys::SECRETS,
                    format!("Secret `{}` does not exist.", secret.source),
                );
            }
        }
        result
    }
}

struct HostsValidator;

#[async_trait]
impl Validator for HostsValidator {
    async fn validate(&self, properties: &Properties) -> ValidationResult {
        let mut result = ValidationResult::new();
        let profile = AgentProfile::from_properties(properties);
        if let Err(err) = profile.parsed_hosts() {
            result.add_error(keys::HOSTS, err.to_string());
        }
        result
    }
}

// ============================================================================
// Cluster validators
// ============================================================================

struct ServerUrlValidator;

#[async_trait]
impl Validator for ServerUrlValidator {
    async fn validate(&self, properties: &Properties) -> ValidationResult {
        let mut result = ValidationResult::new();
        let raw = properties
            .get(cluster_keys::SERVER_URL)
            .map(|v| v.trim())
            .unwrap_or("");
        if raw.is_empty() {
            result.add_error(cluster_keys::SERVER_URL, "Server URL must not be blank.");
            return result;
        }
        let url = match Url::parse(raw) {
            Ok(url) => url,
            Err(_) => {
                result.add_error(cluster_keys::SERVER_URL, "Server URL must be a valid URL.");
                return result;
            }
        };
        if url.scheme() != "https" {
            result.add_error(cluster_keys::SERVER_URL, "Server URL must be a HTTPS URL.");
            return result;
        }
        if is_loopback(&url) {
            result.add_error(
                cluster_keys::SERVER_URL,
                "Server URL must not point to localhost; agents resolve it from inside the cluster.",
            );
            return result;
        }
        if !url.path().ends_with(SERVER_URL_SUFFIX) {
            result.add_error(cluster_keys::SERVER_URL, "Server URL must end with `/go`.");
        }
        result
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

struct MaxInstancesValidator;

#[async_trait]
impl Validator for MaxInstancesValidator {
    async fn validate(&self, properties: &Properties) -> ValidationResult {
        let mut result = ValidationResult::new();
        let raw = properties
            .get(cluster_keys::MAX_INSTANCES)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty());
        if let Some(raw) = raw {
            if raw.parse::<usize>().ok().filter(|n| *n > 0).is_none() {
                result.add_error(cluster_keys::MAX_INSTANCES, "Must be a positive integer.");
            }
        }
        result
    }
}

struct PrivateRegistryValidator;

#[async_trait]
impl Validator for PrivateRegistryValidator {
    async fn validate(&self, properties: &Properties) -> ValidationResult {
        let mut result = ValidationResult::new();
        let enabled = properties
            .get(cluster_keys::PRIVATE_REGISTRY_ENABLED)
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if !enabled {
            return result;
        }
        let checks = [
            (
                cluster_keys::PRIVATE_REGISTRY_SERVER,
                "Private registry server must not be blank.",
            ),
            (
                cluster_keys::PRIVATE_REGISTRY_USERNAME,
                "Private registry username must not be blank.",
            ),
            (
                cluster_keys::PRIVATE_REGISTRY_PASSWORD,
                "Private registry password must not be blank.",
            ),
        ];
        for (key, message) in checks {
            let blank = properties
                .get(key)
                .map(|v| v.trim().is_empty())
                .unwrap_or(true);
            if blank {
                result.add_error(key, message);
            }
        }
        result
    }
}
