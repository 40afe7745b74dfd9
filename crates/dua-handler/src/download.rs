// SPDX-License-Identifier: MIT OR Apache-2.0
//! The download seam: the generic payload downloader contract and the
//! download-handler plug-in contract consulted before it.
//!
//! The engine never speaks HTTP itself. For each payload it (a) consults the
//! step's download-handler plug-in, if the manifest names one, and (b) falls
//! back to the [`ContentDownloader`] the daemon wired in. Hash verification
//! always runs afterwards, regardless of which path produced the file.

use crate::context::StepContext;
use async_trait::async_trait;
use dua_core::result::codes;
use dua_core::{FileEntity, UpdateResult};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Fetch-URL-to-local-file contract implemented by the delivery layer.
#[async_trait]
pub trait ContentDownloader: Send + Sync {
    /// Download `url` into `target`, replacing any partial file.
    async fn download(&self, url: &str, target: &Path) -> UpdateResult;
}

/// Outcome classification for a download-handler consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadHandlerOutcome {
    /// The plug-in produced the target file; skip the network download.
    SkipDownload,
    /// Fall back to the full download.
    FullDownloadRequired,
    /// The plug-in failed fatally; fail the step.
    Fatal,
}

impl DownloadHandlerOutcome {
    /// Classify a plug-in result per the contract: success-skip and
    /// required-full-download are explicit; any other failure degrades to a
    /// full download unless the result code marks it fatal by being the
    /// cancelled code.
    #[must_use]
    pub fn from_result(result: &UpdateResult) -> Self {
        match result.result_code {
            codes::DOWNLOAD_HANDLER_SUCCESS_SKIP_DOWNLOAD => Self::SkipDownload,
            codes::DOWNLOAD_HANDLER_REQUIRED_FULL_DOWNLOAD => Self::FullDownloadRequired,
            codes::FAILURE_CANCELLED => Self::Fatal,
            _ if result.is_success() => Self::SkipDownload,
            _ => Self::FullDownloadRequired,
        }
    }
}

/// A download-handler plug-in (e.g. delta reconstruction from a source
/// cache), consulted per payload before the generic download.
#[async_trait]
pub trait DownloadHandler: Send + Sync {
    /// Try to produce `target_path` without a full download.
    ///
    /// Returns [`codes::DOWNLOAD_HANDLER_SUCCESS_SKIP_DOWNLOAD`] when the
    /// file was produced, [`codes::DOWNLOAD_HANDLER_REQUIRED_FULL_DOWNLOAD`]
    /// to decline (e.g. a source-cache miss), or a failure.
    async fn process_update(
        &self,
        context: &StepContext,
        file: &FileEntity,
        target_path: &Path,
    ) -> UpdateResult;

    /// Called once after the root workflow succeeds so the plug-in can,
    /// for instance, move payloads into its persistent source cache.
    async fn on_update_workflow_completed(&self, _context: &StepContext) {}
}

/// Registry of download-handler plug-ins keyed by their manifest id
/// (e.g. `microsoft/delta-download-handler:1`, compared case-insensitively).
#[derive(Default)]
pub struct DownloadHandlerRegistry {
    handlers: HashMap<String, Arc<dyn DownloadHandler>>,
}

impl DownloadHandlerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plug-in under its manifest id.
    pub fn register(&mut self, id: impl AsRef<str>, handler: impl DownloadHandler + 'static) {
        self.handlers
            .insert(id.as_ref().to_ascii_lowercase(), Arc::new(handler));
    }

    /// Resolve a manifest `downloadHandler.id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn DownloadHandler>> {
        self.handlers.get(&id.to_ascii_lowercase()).cloned()
    }

    /// All registered plug-ins, for workflow-completed fan-out.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn DownloadHandler>)> {
        self.handlers.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of registered plug-ins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no plug-in is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for DownloadHandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        f.debug_struct("DownloadHandlerRegistry").field("ids", &ids).finish()
    }
}
