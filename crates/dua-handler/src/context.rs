// SPDX-License-Identifier: MIT OR Apache-2.0
//! The opaque handle a handler receives for one step invocation.
//!
//! Handlers never see the workflow tree. The engine builds a [`StepContext`]
//! per invocation carrying exactly the accessors the handler contract
//! grants: manifest-derived properties, the sandbox path, file entities,
//! selected components, the cancellation token, and the post-action
//! requesters.

use crate::cancel::CancellationToken;
use dua_core::{FileEntity, UpdateId, UpdateType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// One device component a step may target, as produced by a component
/// enumerator extension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    /// Stable component identifier.
    #[serde(default)]
    pub id: Option<String>,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Manufacturer string.
    #[serde(default)]
    pub manufacturer: Option<String>,
    /// Model string.
    #[serde(default)]
    pub model: Option<String>,
    /// Component firmware/software version.
    #[serde(default)]
    pub version: Option<String>,
    /// Component group.
    #[serde(default)]
    pub group: Option<String>,
    /// Arbitrary additional properties.
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl Component {
    /// A named field (`id`, `name`, ...) as a string, if set.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        match name {
            "id" => self.id.as_deref(),
            "name" => self.name.as_deref(),
            "manufacturer" => self.manufacturer.as_deref(),
            "model" => self.model.as_deref(),
            "version" => self.version.as_deref(),
            "group" => self.group.as_deref(),
            _ => None,
        }
    }

    /// An entry of `properties` rendered as a string, if present.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<String> {
        self.properties.get(name).map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

/// Reboot/agent-restart requests raised during a handler invocation.
///
/// Clones share state. The engine drains these after every invocation and
/// propagates them to the workflow root; requests are sticky.
#[derive(Clone, Default)]
pub struct PostActionFlags {
    inner: Arc<PostActionsInner>,
}

#[derive(Default)]
struct PostActionsInner {
    reboot: AtomicBool,
    immediate_reboot: AtomicBool,
    agent_restart: AtomicBool,
    immediate_agent_restart: AtomicBool,
}

impl PostActionFlags {
    /// Fresh flags with nothing requested.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a reboot after the workflow completes.
    pub fn request_reboot(&self) {
        self.inner.reboot.store(true, Ordering::SeqCst);
    }

    /// Request a reboot before any further step runs.
    pub fn request_immediate_reboot(&self) {
        self.inner.immediate_reboot.store(true, Ordering::SeqCst);
    }

    /// Request an agent restart after the workflow completes.
    pub fn request_agent_restart(&self) {
        self.inner.agent_restart.store(true, Ordering::SeqCst);
    }

    /// Request an agent restart before any further step runs.
    pub fn request_immediate_agent_restart(&self) {
        self.inner.immediate_agent_restart.store(true, Ordering::SeqCst);
    }

    /// Whether a (deferred) reboot was requested.
    #[must_use]
    pub fn reboot_requested(&self) -> bool {
        self.inner.reboot.load(Ordering::SeqCst)
    }

    /// Whether an immediate reboot was requested.
    #[must_use]
    pub fn immediate_reboot_requested(&self) -> bool {
        self.inner.immediate_reboot.load(Ordering::SeqCst)
    }

    /// Whether a (deferred) agent restart was requested.
    #[must_use]
    pub fn agent_restart_requested(&self) -> bool {
        self.inner.agent_restart.load(Ordering::SeqCst)
    }

    /// Whether an immediate agent restart was requested.
    #[must_use]
    pub fn immediate_agent_restart_requested(&self) -> bool {
        self.inner.immediate_agent_restart.load(Ordering::SeqCst)
    }

    /// Whether anything at all was requested.
    #[must_use]
    pub fn any_requested(&self) -> bool {
        self.reboot_requested()
            || self.immediate_reboot_requested()
            || self.agent_restart_requested()
            || self.immediate_agent_restart_requested()
    }
}

impl std::fmt::Debug for PostActionFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostActionFlags")
            .field("reboot", &self.reboot_requested())
            .field("immediate_reboot", &self.immediate_reboot_requested())
            .field("agent_restart", &self.agent_restart_requested())
            .field(
                "immediate_agent_restart",
                &self.immediate_agent_restart_requested(),
            )
            .finish()
    }
}

/// Everything a handler may know about the step it is executing.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Deployment-assigned workflow id.
    pub workflow_id: String,
    /// Identity of the update this step belongs to.
    pub update_id: UpdateId,
    /// Update type that resolved to this handler.
    pub update_type: UpdateType,
    /// Sandbox directory owned by the engine; scratch for the handler.
    pub work_folder: PathBuf,
    /// The step's installed criteria, if declared.
    pub installed_criteria: Option<String>,
    /// Handler-interpreted step properties.
    pub handler_properties: serde_json::Map<String, serde_json::Value>,
    /// Payload files of this step, with URLs and hashes.
    pub files: Vec<FileEntity>,
    /// Components selected for this step; empty targets the host device.
    pub selected_components: Vec<Component>,
    cancellation: CancellationToken,
    post_actions: PostActionFlags,
}

impl StepContext {
    /// Build a context; called by the engine only.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        workflow_id: impl Into<String>,
        update_id: UpdateId,
        update_type: UpdateType,
        work_folder: PathBuf,
        installed_criteria: Option<String>,
        handler_properties: serde_json::Map<String, serde_json::Value>,
        files: Vec<FileEntity>,
        selected_components: Vec<Component>,
        cancellation: CancellationToken,
        post_actions: PostActionFlags,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            update_id,
            update_type,
            work_folder,
            installed_criteria,
            handler_properties,
            files,
            selected_components,
            cancellation,
            post_actions,
        }
    }

    /// The sandbox directory.
    #[must_use]
    pub fn work_folder(&self) -> &Path {
        &self.work_folder
    }

    /// Where the handler result file for this step lives.
    #[must_use]
    pub fn result_file_path(&self) -> PathBuf {
        self.work_folder.join(crate::script::RESULT_FILE_NAME)
    }

    /// A string-valued handler property by name.
    #[must_use]
    pub fn handler_property(&self, name: &str) -> Option<&str> {
        self.handler_properties.get(name).and_then(|v| v.as_str())
    }

    /// Whether cancellation has been requested for this workflow node.
    #[must_use]
    pub fn is_cancellation_requested(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// The token itself, for handlers that await cancellation.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Reboot/restart requesters; sticky, drained by the engine.
    #[must_use]
    pub fn post_actions(&self) -> &PostActionFlags {
        &self.post_actions
    }
}
