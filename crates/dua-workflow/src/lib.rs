// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! dua-workflow
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The orchestrator state machine.
pub mod engine;
/// Crash-safe progress snapshots.
pub mod persistence;
/// Per-workflow sandbox directories.
pub mod sandbox;
/// Workflow states and scheduling ladders.
pub mod state;
/// The arena-allocated workflow tree.
pub mod tree;

pub use engine::{
    Deployment, EngineConfig, EngineTick, ManifestVerifier, ReportSink, WorkflowEngine,
    WorkflowReport,
};
pub use persistence::{SNAPSHOT_SCHEMA_VERSION, WorkflowSnapshot};
pub use state::{AgentRestartState, DeploymentAction, RebootState, WorkflowState};
pub use tree::{NodeId, NodeKind, WorkflowNode, WorkflowTree};
