// Copyright (c) 2026 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Agent profile: the operator-authored template describing what kind of
//! build agent to launch for a job.
//!
//! Profiles arrive as a flat string-to-string property map. Multi-valued
//! properties pack one entry per line; mount and secret lines carry
//! comma-separated `key=value` pairs. Parsing is strict where a malformed
//! line could silently launch the wrong container, lenient on whitespace.

use std::collections::HashMap;
use std::net::IpAddr;

use thiserror::Error;

/// Raw property map as the orchestrator sends it.
pub type Properties = HashMap<String, String>;

/// Property names understood by agent profiles.
pub mod keys {
    pub const IMAGE: &str = "Image";
    pub const COMMAND: &str = "Command";
    pub const ENVIRONMENT: &str = "Environment";
    pub const MAX_MEMORY: &str = "MaxMemory";
    pub const RESERVED_MEMORY: &str = "ReservedMemory";
    pub const MOUNTS: &str = "Mounts";
    pub const SECRETS: &str = "Secrets";
    pub const HOSTS: &str = "Hosts";
    pub const CONSTRAINTS: &str = "Constraints";
    pub const NETWORKS: &str = "Networks";

    pub const ALL: [&str; 10] = [
        IMAGE,
        COMMAND,
        ENVIRONMENT,
        MAX_MEMORY,
        RESERVED_MEMORY,
        MOUNTS,
        SECRETS,
        HOSTS,
        CONSTRAINTS,
        NETWORKS,
    ];
}

/// A single line of a multi-valued property could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("{0}")]
    InvalidMount(String),
    #[error("{0}")]
    InvalidSecret(String),
    #[error("{0}")]
    InvalidHost(String),
}

/// Parsed agent profile. Raw multi-line properties for mounts, secrets and
/// hosts are kept verbatim so validation can echo the offending line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentProfile {
    pub image: Option<String>,
    pub command: Vec<String>,
    pub environment: Vec<String>,
    pub max_memory: Option<String>,
    pub reserved_memory: Option<String>,
    pub mounts: Option<String>,
    pub secrets: Option<String>,
    pub hosts: Option<String>,
    pub constraints: Vec<String>,
    pub networks: Vec<String>,
}

impl AgentProfile {
    pub fn from_properties(properties: &Properties) -> Self {
        Self {
            image: trimmed(properties, keys::IMAGE),
            command: lines_of(properties, keys::COMMAND),
            environment: lines_of(properties, keys::ENVIRONMENT),
            max_memory: trimmed(properties, keys::MAX_MEMORY),
            reserved_memory: trimmed(properties, keys::RESERVED_MEMORY),
            mounts: trimmed(properties, keys::MOUNTS),
            secrets: trimmed(properties, keys::SECRETS),
            hosts: trimmed(properties, keys::HOSTS),
            constraints: lines_of(properties, keys::CONSTRAINTS),
            networks: properties
                .get(keys::NETWORKS)
                .map(|raw| split_list(raw))
                .unwrap_or_default(),
        }
    }

    pub fn parsed_mounts(&self) -> Result<Vec<MountSpec>, SpecError> {
        parse_lines(self.mounts.as_deref(), MountSpec::parse)
    }

    pub fn parsed_secrets(&self) -> Result<Vec<SecretSpec>, SpecError> {
        parse_lines(self.secrets.as_deref(), SecretSpec::parse)
    }

    pub fn parsed_hosts(&self) -> Result<Vec<HostEntry>, SpecError> {
        parse_lines(self.hosts.as_deref(), HostEntry::parse)
    }
}

/// One volume attached to the agent container.
///
/// Line format: `source=volume-name, target=/path/in/container, readonly`.
/// `source` is optional (anonymous volume); `readonly` defaults to false
/// and may carry an explicit `=true`/`=false` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: Option<String>,
    pub target: String,
    pub read_only: bool,
}

impl MountSpec {
    pub fn parse(line: &str) -> Result<Self, SpecError> {
        let pairs = parse_key_values(line);
        let target = value_of(&pairs, "target")
            .ok_or_else(|| {
                SpecError::InvalidMount(format!(
                    "Invalid mount target specification `{line}`. `target` has to be specified."
                ))
            })?
            .to_string();
        let source = value_of(&pairs, "source").map(str::to_string);
        let read_only = if has_key(&pairs, "readonly") {
            value_of(&pairs, "readonly")
                .map(|value| !value.eq_ignore_ascii_case("false"))
                .unwrap_or(true)
        } else {
            false
        };
        Ok(Self {
            source,
            target,
            read_only,
        })
    }
}

/// One engine-managed secret exposed to the agent container as a file.
///
/// Line format: `src=secret-name, target=file-name`. The file name
/// defaults to the secret name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretSpec {
    pub source: String,
    pub target: String,
}

impl SecretSpec {
    pub fn parse(line: &str) -> Result<Self, SpecError> {
        let pairs = parse_key_values(line);
        let source = value_of(&pairs, "src")
            .ok_or_else(|| {
                SpecError::InvalidSecret(format!(
                    "Invalid secret specification `{line}`. Must specify property `src` with value."
                ))
            })?
            .to_string();
        let target = value_of(&pairs, "target")
            .map(str::to_string)
            .unwrap_or_else(|| source.clone());
        Ok(Self { source, target })
    }
}

/// One extra `/etc/hosts` entry: an IP followed by one or more hostnames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub ip: String,
    pub hostnames: Vec<String>,
}

impl HostEntry {
    pub fn parse(line: &str) -> Result<Self, SpecError> {
        let mut tokens = line.split_whitespace();
        let ip = tokens.next().ok_or_else(|| invalid_host(line))?;
        if ip.parse::<IpAddr>().is_err() {
            return Err(invalid_host(line));
        }
        let hostnames: Vec<String> = tokens.map(str::to_string).collect();
        if hostnames.is_empty() {
            return Err(invalid_host(line));
        }
        Ok(Self {
            ip: ip.to_string(),
            hostnames,
        })
    }

    /// Engine wire form: `IP hostname [hostname...]`.
    pub fn to_line(&self) -> String {
        format!("{} {}", self.ip, self.hostnames.join(" "))
    }
}

fn invalid_host(line: &str) -> SpecError {
    SpecError::InvalidHost(format!(
        "Host entry `{line}` must be in `IP-ADDRESS HOST-1 HOST-2...` format."
    ))
}

/// Splits a multi-line property into trimmed, non-empty lines.
pub fn split_lines(raw: &str) -> Vec<String> {
    raw.split(['\n', '\r'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Splits a property that accepts either newline or comma separators.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(['\n', '\r', ','])
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_lines<T>(
    raw: Option<&str>,
    parse: impl Fn(&str) -> Result<T, SpecError>,
) -> Result<Vec<T>, SpecError> {
    raw.map(split_lines)
        .unwrap_or_default()
        .iter()
        .map(|line| parse(line))
        .collect()
}

fn trimmed(properties: &Properties, key: &str) -> Option<String> {
    properties
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn lines_of(properties: &Properties, key: &str) -> Vec<String> {
    properties
        .get(key)
        .map(|raw| split_lines(raw))
        .unwrap_or_default()
}

fn parse_key_values(line: &str) -> Vec<(String, String)> {
    line.split([';', ','])
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(|segment| match segment.split_once('=') {
            Some((key, value)) => (key.trim().to_string(), value.trim().to_string()),
            None => (segment.to_string(), String::new()),
        })
        .collect()
}

fn value_of<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(key))
        .map(|(_, value)| value.as_str())
        .filter(|value| !value.is_empty())
}

fn has_key(pairs: &[(String, String)], key: &str) -> bool {
    pairs.iter().any(|(name, _)| name.eq_ignore_ascii_case(key))
}
