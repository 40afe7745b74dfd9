// SPDX-License-Identifier: MIT OR Apache-2.0
//! Crash-safe workflow progress snapshots.
//!
//! A single JSON file captures the minimum needed to resume after a process
//! exit or reboot. Writes are atomic: temp file in the same directory,
//! fsync, rename. Snapshots are written before any outbound result publish
//! so a crash can never lose a state the service already saw.

use crate::state::{AgentRestartState, RebootState, WorkflowState};
use dua_core::UpdateId;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Current snapshot schema version.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// The persisted snapshot.
///
/// Field names are part of the on-disk contract and deliberately
/// PascalCase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WorkflowSnapshot {
    /// Snapshot schema version; unknown versions are treated as absent.
    pub schema_version: u32,
    /// Root-level workflow state at write time.
    pub workflow_step: WorkflowState,
    /// Root result code.
    pub result_code: i32,
    /// Root extended result code.
    pub extended_result_code: i32,
    /// Reboot scheduling state.
    pub system_reboot_state: RebootState,
    /// Agent-restart scheduling state.
    pub agent_restart_state: AgentRestartState,
    /// The update this workflow is expected to install.
    pub expected_update_id: UpdateId,
    /// Deployment-assigned workflow id.
    pub workflow_id: String,
    /// Update type of the step in flight, when one is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_type: Option<String>,
    /// Installed criteria of the step in flight, when one is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_criteria: Option<String>,
    /// Sandbox directory of the workflow.
    pub work_folder: PathBuf,
    /// The report payload that was (or will be) published for this state.
    pub reporting_json: serde_json::Value,
}

/// Errors raised by snapshot I/O.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// The snapshot could not be written or fsynced.
    #[error("cannot persist snapshot to `{path}`: {source}")]
    Write {
        /// Destination path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The snapshot could not be serialized.
    #[error("cannot serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl WorkflowSnapshot {
    /// Atomically write the snapshot: temp file, fsync, rename.
    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        let json = serde_json::to_vec_pretty(self)?;
        let write_err = |source| SnapshotError::Write {
            path: path.display().to_string(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp).map_err(write_err)?;
            file.write_all(&json).map_err(write_err)?;
            file.sync_all().map_err(write_err)?;
        }
        std::fs::rename(&tmp, path).map_err(write_err)?;
        debug!(path = %path.display(), step = ?self.workflow_step, "snapshot persisted");
        Ok(())
    }

    /// Load a snapshot if one exists and speaks a known schema version.
    ///
    /// A malformed or future-versioned file is logged and treated as
    /// absent — a fresh start beats refusing to boot.
    #[must_use]
    pub fn load(path: &Path) -> Option<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), %err, "cannot read snapshot");
                return None;
            }
        };
        match serde_json::from_str::<Self>(&text) {
            Ok(snapshot) if snapshot.schema_version == SNAPSHOT_SCHEMA_VERSION => Some(snapshot),
            Ok(snapshot) => {
                warn!(
                    path = %path.display(),
                    version = snapshot.schema_version,
                    "unknown snapshot schema version, ignoring"
                );
                None
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "snapshot unparseable, ignoring");
                None
            }
        }
    }

    /// Delete the snapshot file; absence is not an error.
    pub fn delete(path: &Path) {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "snapshot deleted"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), %err, "cannot delete snapshot"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WorkflowSnapshot {
        WorkflowSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            workflow_step: WorkflowState::InstallSucceeded,
            result_code: 600,
            extended_result_code: 0,
            system_reboot_state: RebootState::Required,
            agent_restart_state: AgentRestartState::None,
            expected_update_id: UpdateId::new("contoso", "toaster", "1.0"),
            workflow_id: "wf-7".into(),
            update_type: Some("microsoft/swupdate:2".into()),
            installed_criteria: Some("1.0".into()),
            work_folder: PathBuf::from("/var/lib/agent/sandbox/wf-7"),
            reporting_json: serde_json::json!({ "resultCode": 600 }),
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("workflow.json");
        let snapshot = sample();
        snapshot.save(&path).unwrap();
        assert_eq!(WorkflowSnapshot::load(&path), Some(snapshot));
    }

    #[test]
    fn field_names_are_pascal_case() {
        let json = serde_json::to_value(sample()).unwrap();
        for key in [
            "SchemaVersion",
            "WorkflowStep",
            "ResultCode",
            "ExtendedResultCode",
            "SystemRebootState",
            "AgentRestartState",
            "ExpectedUpdateId",
            "WorkflowId",
            "UpdateType",
            "InstalledCriteria",
            "WorkFolder",
            "ReportingJson",
        ] {
            assert!(json.get(key).is_some(), "missing key {key}");
        }
    }

    #[test]
    fn missing_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(WorkflowSnapshot::load(&dir.path().join("absent.json")), None);
    }

    #[test]
    fn unparseable_file_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflow.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert_eq!(WorkflowSnapshot::load(&path), None);
    }

    #[test]
    fn future_schema_version_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflow.json");
        let mut snapshot = sample();
        snapshot.schema_version = SNAPSHOT_SCHEMA_VERSION + 1;
        snapshot.save(&path).unwrap();
        assert_eq!(WorkflowSnapshot::load(&path), None);
    }

    #[test]
    fn save_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflow.json");
        let mut snapshot = sample();
        snapshot.save(&path).unwrap();
        snapshot.workflow_step = WorkflowState::ApplySucceeded;
        snapshot.result_code = 700;
        snapshot.save(&path).unwrap();
        let loaded = WorkflowSnapshot::load(&path).unwrap();
        assert_eq!(loaded.workflow_step, WorkflowState::ApplySucceeded);
        assert_eq!(loaded.result_code, 700);
        // No stray temp file is left behind.
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflow.json");
        sample().save(&path).unwrap();
        WorkflowSnapshot::delete(&path);
        WorkflowSnapshot::delete(&path);
        assert!(!path.exists());
    }
}
