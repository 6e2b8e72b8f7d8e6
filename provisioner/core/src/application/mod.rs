// Copyright (c) 2026 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Application
//!
//! Provides the provisioning, reconciliation and status services.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Implements the service orchestration

pub mod admission;
pub mod registry;
pub mod validators;
pub mod provisioning;
pub mod status;
