// Copyright (c) 2026 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Cluster settings: per-cluster connection and capacity configuration.
//!
//! Like agent profiles these arrive as a flat property map. The daemon
//! carries one default set from its command line; a request may override
//! it by sending its own cluster properties.

use std::time::Duration;

use thiserror::Error;

use crate::domain::profile::Properties;

pub const DEFAULT_MAX_INSTANCES: usize = 10;
pub const DEFAULT_AUTO_REGISTER_TIMEOUT_MINUTES: u64 = 10;

/// Property names understood by cluster settings.
pub mod keys {
    pub const SERVER_URL: &str = "server_url";
    pub const MAX_INSTANCES: &str = "max_instances";
    pub const AUTO_REGISTER_TIMEOUT: &str = "auto_register_timeout";
    pub const DOCKER_URI: &str = "docker_uri";
    pub const PRIVATE_REGISTRY_ENABLED: &str = "private_registry_enabled";
    pub const PRIVATE_REGISTRY_SERVER: &str = "private_registry_server";
    pub const PRIVATE_REGISTRY_USERNAME: &str = "private_registry_username";
    pub const PRIVATE_REGISTRY_PASSWORD: &str = "private_registry_password";
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("`{0}` must not be blank")]
    MissingField(&'static str),
    #[error("`{0}` must be a positive integer")]
    InvalidNumber(&'static str),
}

/// Credentials for pulling agent images from a private registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub server: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSettings {
    /// Callback URL the launched agents register against.
    pub server_url: String,
    /// Ceiling on concurrently running agent instances.
    pub max_instances: usize,
    /// Minutes an instance may exist without registering before cleanup
    /// treats it as stale.
    pub auto_register_timeout: u64,
    /// Engine endpoint this cluster talks to. Informational on requests;
    /// the daemon connects once at startup.
    pub docker_uri: Option<String>,
    pub private_registry: Option<RegistryCredentials>,
}

impl ClusterSettings {
    pub fn from_properties(properties: &Properties) -> Result<Self, SettingsError> {
        let server_url = required(properties, keys::SERVER_URL)?;
        let max_instances = match optional(properties, keys::MAX_INSTANCES) {
            None => DEFAULT_MAX_INSTANCES,
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(SettingsError::InvalidNumber(keys::MAX_INSTANCES))?,
        };
        let auto_register_timeout = match optional(properties, keys::AUTO_REGISTER_TIMEOUT) {
            None => DEFAULT_AUTO_REGISTER_TIMEOUT_MINUTES,
            Some(raw) => raw
                .parse::<u64>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(SettingsError::InvalidNumber(keys::AUTO_REGISTER_TIMEOUT))?,
        };
        let private_registry_enabled = optional(properties, keys::PRIVATE_REGISTRY_ENABLED)
            .map(|value| value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let private_registry = if private_registry_enabled {
            Some(RegistryCredentials {
                server: required(properties, keys::PRIVATE_REGISTRY_SERVER)?,
                username: required(properties, keys::PRIVATE_REGISTRY_USERNAME)?,
                password: required(properties, keys::PRIVATE_REGISTRY_PASSWORD)?,
            })
        } else {
            None
        };
        Ok(Self {
            server_url,
            max_instances,
            auto_register_timeout,
            docker_uri: optional(properties, keys::DOCKER_URI),
            private_registry,
        })
    }

    /// How long an instance may stay unregistered before it is fair game
    /// for cleanup.
    pub fn auto_register_window(&self) -> Duration {
        Duration::from_secs(self.auto_register_timeout * 60)
    }
}

fn optional(properties: &Properties, key: &str) -> Option<String> {
    properties
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn required(properties: &Properties, key: &'static str) -> Result<String, SettingsError> {
    optional(properties, key).ok_or(SettingsError::MissingField(key))
}
