// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! dua-handler
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Cooperative cancellation primitives.
pub mod cancel;
/// The opaque workflow handle handlers receive.
pub mod context;
/// Download-handler plug-in contract and payload download seam.
pub mod download;
/// Subprocess argument marshalling and the handler result file.
pub mod script;
/// A handler that simulates update work; used by tests and demo deployments.
pub mod simulator;

use async_trait::async_trait;
use dua_core::result::codes;
use dua_core::{UpdateResult, UpdateType};
use std::collections::HashMap;
use std::sync::Arc;

pub use cancel::CancellationToken;
pub use context::{Component, PostActionFlags, StepContext};
pub use download::{ContentDownloader, DownloadHandler, DownloadHandlerRegistry};
pub use script::{HandlerAction, read_result_file};
pub use simulator::SimulatorHandler;

/// A content handler: the implementor of one update type.
///
/// Handlers receive a [`StepContext`] that is opaque except for its
/// accessors and must not block indefinitely; long work is expected to poll
/// [`StepContext::is_cancellation_requested`] and bail out with a
/// cancelled result.
#[async_trait]
pub trait ContentHandler: Send + Sync {
    /// Download every payload the step references into the sandbox.
    ///
    /// Implementations may short-circuit with
    /// [`codes::DOWNLOAD_SKIPPED_UPDATE_ALREADY_INSTALLED`] when the
    /// installed criteria already holds.
    async fn download(&self, context: &StepContext) -> UpdateResult;

    /// Apply the update to the device or the selected component.
    ///
    /// Must be idempotent with respect to the step's installed criteria.
    async fn install(&self, context: &StepContext) -> UpdateResult;

    /// Finalize the update (e.g. flip the boot slot).
    async fn apply(&self, context: &StepContext) -> UpdateResult;

    /// Revert in-progress work if possible.
    async fn cancel(&self, context: &StepContext) -> UpdateResult;

    /// Report whether the step's installed criteria is already satisfied.
    ///
    /// Must be a pure function of device state and the criteria string.
    async fn is_installed(&self, context: &StepContext) -> UpdateResult;

    /// Snapshot state needed to undo a later `apply`. Optional.
    async fn backup(&self, _context: &StepContext) -> UpdateResult {
        UpdateResult::success(codes::BACKUP_SUCCESS_UNSUPPORTED)
    }

    /// Undo a failed `apply` from the last backup. Optional.
    async fn restore(&self, _context: &StepContext) -> UpdateResult {
        UpdateResult::success(codes::RESTORE_SUCCESS_UNSUPPORTED)
    }
}

/// Name-versioned registry of [`ContentHandler`] implementations.
///
/// Keys are [`UpdateType`]s (`provider/name:version`, case-folded at parse
/// time). Registration happens once at startup; the engine resolves a step's
/// update type here and fails the step with `UNKNOWN_UPDATE_TYPE` when the
/// lookup misses.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<UpdateType, Arc<dyn ContentHandler>>,
}

impl HandlerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an update type, replacing any previous entry.
    pub fn register(&mut self, update_type: UpdateType, handler: impl ContentHandler + 'static) {
        self.handlers.insert(update_type, Arc::new(handler));
    }

    /// Register an already-shared handler.
    pub fn register_arc(&mut self, update_type: UpdateType, handler: Arc<dyn ContentHandler>) {
        self.handlers.insert(update_type, handler);
    }

    /// Resolve an update type to its handler.
    #[must_use]
    pub fn get(&self, update_type: &UpdateType) -> Option<Arc<dyn ContentHandler>> {
        self.handlers.get(update_type).cloned()
    }

    /// Whether a handler is registered for the update type.
    #[must_use]
    pub fn contains(&self, update_type: &UpdateType) -> bool {
        self.handlers.contains_key(update_type)
    }

    /// Sorted list of registered update types.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        let mut v: Vec<String> = self.handlers.keys().map(ToString::to_string).collect();
        v.sort();
        v
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.list())
            .finish()
    }
}
