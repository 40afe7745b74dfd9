// SPDX-License-Identifier: MIT OR Apache-2.0
//! Workflow states and the reboot/restart scheduling ladder.

use serde::{Deserialize, Serialize};

/// Per-node (and root-level, for reporting) workflow state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    /// Nothing in flight.
    Idle,
    /// A deployment was accepted and the tree is materialized.
    DeploymentInProgress,
    /// The download phase is running.
    DownloadStarted,
    /// Every payload is in the sandbox and verified.
    DownloadSucceeded,
    /// The install phase is running.
    InstallStarted,
    /// Install completed (possibly with a pending reboot request).
    InstallSucceeded,
    /// The apply phase is running.
    ApplyStarted,
    /// Terminal: the update is live.
    ApplySucceeded,
    /// Terminal: the workflow failed.
    Failed,
    /// Terminal: restore after a failed apply itself failed.
    FailedRestoreFailed,
    /// Terminal: the workflow was cancelled.
    Cancelled,
}

impl WorkflowState {
    /// `true` for states no `step()` call will ever leave.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ApplySucceeded | Self::Failed | Self::FailedRestoreFailed | Self::Cancelled
        )
    }
}

/// What the service asked the agent to do with a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeploymentAction {
    /// Run the update described by the manifest.
    ProcessDeployment,
    /// Cancel the in-flight workflow.
    Cancel,
}

/// Persisted reboot scheduling state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebootState {
    /// No reboot involved.
    #[default]
    None,
    /// A handler requested a reboot; the outer daemon will perform it.
    Required,
    /// The snapshot was written on the way into a reboot.
    InProgress,
}

/// Persisted agent-restart scheduling state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentRestartState {
    /// No restart involved.
    #[default]
    None,
    /// A handler requested an agent restart.
    Required,
    /// The snapshot was written on the way into a restart.
    InProgress,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(WorkflowState::ApplySucceeded.is_terminal());
        assert!(WorkflowState::Failed.is_terminal());
        assert!(WorkflowState::FailedRestoreFailed.is_terminal());
        assert!(WorkflowState::Cancelled.is_terminal());
        assert!(!WorkflowState::Idle.is_terminal());
        assert!(!WorkflowState::DownloadStarted.is_terminal());
        assert!(!WorkflowState::InstallSucceeded.is_terminal());
    }

    #[test]
    fn deployment_action_wire_names() {
        assert_eq!(
            serde_json::to_string(&DeploymentAction::ProcessDeployment).unwrap(),
            "\"processDeployment\""
        );
        assert_eq!(serde_json::to_string(&DeploymentAction::Cancel).unwrap(), "\"cancel\"");
    }
}
