// Copyright (c) 2026 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0
//! In-memory registry of the instances the daemon believes exist.
//!
//! Engine snapshots are merged in rather than swapped in: details a plain
//! listing cannot see (cached log tails, locally-decoded job pairings,
//! first-seen times) survive the merge, and an instance registered while
//! the snapshot was already in flight is not mistaken for a vanished one.

use std::collections::HashMap;
use std::mem;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;

use crate::domain::instance::AgentInstance;

struct Tracked {
    instance: AgentInstance,
    first_seen: Instant,
    log_tail: Option<String>,
}

#[derive(Default)]
pub struct InstanceRegistry {
    instances: RwLock<HashMap<String, Tracked>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an instance the daemon just created.
    pub fn register(&self, instance: AgentInstance) {
        let mut instances = self.instances.write();
        instances.insert(
            instance.name.clone(),
            Tracked {
                instance,
                first_seen: Instant::now(),
                log_tail: None,
            },
        );
    }

    /// Merges an engine snapshot that started at `snapshot_started`.
    ///
    /// Live instances replace their tracked versions but keep the locally
    /// known extras. A tracked instance missing from the snapshot is
    /// dropped, unless it was registered after the snapshot began and the
    /// listing simply could not have seen it yet.
    pub fn reconcile(&self, snapshot_started: Instant, live: Vec<AgentInstance>) {
        let mut instances = self.instances.write();
        let mut previous = mem::take(&mut *instances);
        for mut instance in live {
            match previous.remove(&instance.name) {
                Some(tracked) => {
                    if instance.job.is_none() {
                        instance.job = tracked.instance.job;
                    }
                    instances.insert(
                        instance.name.clone(),
                        Tracked {
                            instance,
                            first_seen: tracked.first_seen,
                            log_tail: tracked.log_tail,
                        },
                    );
                }
                None => {
                    instances.insert(
                        instance.name.clone(),
                        Tracked {
                            instance,
                            first_seen: Instant::now(),
                            log_tail: None,
                        },
                    );
                }
            }
        }
        for (name, tracked) in previous {
            if tracked.first_seen >= snapshot_started {
                instances.insert(name, tracked);
            } else {
                debug!("Instance {} vanished from the engine; dropping it", name);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<AgentInstance> {
        self.instances
            .read()
            .get(name)
            .map(|tracked| tracked.instance.clone())
    }

    pub fn remove(&self, name: &str) -> Option<AgentInstance> {
        self.instances
            .write()
            .remove(name)
            .map(|tracked| tracked.instance)
    }

    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    /// All tracked instances, sorted by name for stable reports.
    pub fn snapshot(&self) -> Vec<AgentInstance> {
        let mut all: Vec<AgentInstance> = self
            .instances
            .read()
            .values()
            .map(|tracked| tracked.instance.clone())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn update_log_tail(&self, name: &str, tail: impl Into<String>) {
        if let Some(tracked) = self.instances.write().get_mut(name) {
            tracked.log_tail = Some(tail.into());
        }
    }

    pub fn log_tail(&self, name: &str) -> Option<String> {
        self.instances
            .read()
            .get(name)
            .and_then(|tracked| tracked.log_tail.clone())
    }

    /// Names of tracked instances the orchestrator does not know about and
    /// that have been around longer than `window`. Engine creation time is
    /// authoritative; the local first-seen time covers instances the
    /// engine did not timestamp. A creation time in the future counts as
    /// fresh.
    pub fn unregistered_instances(&self, known: &[String], window: Duration) -> Vec<String> {
        let now = Utc::now();
        let mut stale: Vec<String> = self
            .instances
            .read()
            .iter()
            .filter(|(name, _)| !known.iter().any(|k| k == *name))
            .filter(|(_, tracked)| match tracked.instance.created_at {
                Some(created) => now
                    .signed_duration_since(created)
                    .to_std()
                    .map(|age| age >= window)
                    .unwrap_or(false),
                None => tracked.first_seen.elapsed() >= window,
            })
            .map(|(name, _)| name.clone())
            .collect();
        stale.sort();
        stale
    }
}
