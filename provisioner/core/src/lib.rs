// Copyright (c) 2026 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Gantry core
//!
//! Provides elastic build-agent provisioning on Docker Swarm.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Implements the provisioner

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
