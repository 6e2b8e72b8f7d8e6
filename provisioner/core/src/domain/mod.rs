// Copyright (c) 2026 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Provides the value types and contracts of the provisioner.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Implements the core model

pub mod size;
pub mod job;
pub mod profile;
pub mod settings;
pub mod validation;
pub mod instance;
pub mod backend;
