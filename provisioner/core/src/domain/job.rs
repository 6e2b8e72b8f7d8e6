// Copyright (c) 2026 Gantry Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Identity of the build job an agent instance is provisioned for.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Fully-qualified coordinates of one scheduled build job.
///
/// The orchestrator sends this alongside every provisioning request; it is
/// stamped onto the created instance so the pairing survives restarts of
/// the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobIdentifier {
    pub pipeline_name: String,
    pub pipeline_counter: i64,
    #[serde(default)]
    pub pipeline_label: String,
    pub stage_name: String,
    pub stage_counter: String,
    pub job_name: String,
    pub job_id: i64,
}

impl JobIdentifier {
    /// Canonical `pipeline/counter/stage/stage-counter/job` path, the form
    /// used in logs and status reports.
    pub fn represent(&self) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.pipeline_name, self.pipeline_counter, self.stage_name, self.stage_counter, self.job_name
        )
    }
}

impl fmt::Display for JobIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.represent())
    }
}
