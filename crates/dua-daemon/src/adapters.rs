// SPDX-License-Identifier: MIT OR Apache-2.0

//! Adapters that plug one crate's seam into another's implementation.

use async_trait::async_trait;
use dua_core::result::codes;
use dua_core::{Facility, UpdateResult, erc};
use dua_handler::ContentDownloader;
use dua_rootkey::{RootKeyPackageSource, RootKeyStore};
use dua_workflow::engine::{ManifestVerifier, ReportSink, WorkflowReport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Delivery seam
// ---------------------------------------------------------------------------

/// Local-filesystem downloader: serves `file://` URLs and plain paths.
///
/// The production delivery library implements [`ContentDownloader`] itself;
/// this stand-in covers demo deployments and on-device testing where
/// payloads are pre-staged on disk.
#[derive(Debug, Default)]
pub struct FsDownloader;

#[async_trait]
impl ContentDownloader for FsDownloader {
    async fn download(&self, url: &str, target: &Path) -> UpdateResult {
        let source = url.strip_prefix("file://").unwrap_or(url);
        match tokio::fs::copy(source, target).await {
            Ok(bytes) => {
                debug!(url, bytes, "payload copied");
                UpdateResult::success(codes::DOWNLOAD_SUCCESS)
            }
            Err(err) => UpdateResult::failure_with_details(
                erc(Facility::DeliveryOptimization, err.raw_os_error().unwrap_or(0) as u32),
                format!("cannot fetch `{url}`: {err}"),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Manifest verification seam
// ---------------------------------------------------------------------------

/// How the engine verifies manifest signatures.
#[derive(Clone)]
pub enum ManifestPolicy {
    /// Verify against the active root-key set.
    Verify(RootKeyStore),
    /// Accept everything; development devices without a root-key source.
    TrustAll,
}

impl ManifestVerifier for ManifestPolicy {
    fn verify(&self, manifest_json: &str, signature: &str) -> Result<(), String> {
        match self {
            Self::Verify(store) => {
                dua_rootkey::verify_manifest(manifest_json, signature, &store.snapshot())
                    .map_err(|err| err.to_string())
            }
            Self::TrustAll => {
                warn!("manifest signature not verified (trust-all policy)");
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Report seam
// ---------------------------------------------------------------------------

/// Buffers engine reports for the loop to forward as `updrslt_req`.
pub struct QueueingReporter {
    tx: mpsc::UnboundedSender<WorkflowReport>,
}

impl QueueingReporter {
    /// Reporter plus the receiving end the loop drains.
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<WorkflowReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl ReportSink for QueueingReporter {
    async fn publish(&self, report: WorkflowReport) {
        if self.tx.send(report).is_err() {
            warn!("report receiver dropped; report lost");
        }
    }
}

// ---------------------------------------------------------------------------
// Root-key package source
// ---------------------------------------------------------------------------

/// Fetches the root-key package through the delivery seam into a staging
/// path, then hands back the text.
pub struct DownloadedPackageSource {
    downloader: Arc<dyn ContentDownloader>,
    package_url: String,
    staging_path: PathBuf,
}

impl DownloadedPackageSource {
    /// Source reading `package_url` via `downloader` into `staging_path`.
    #[must_use]
    pub fn new(
        downloader: Arc<dyn ContentDownloader>,
        package_url: String,
        staging_path: PathBuf,
    ) -> Self {
        Self {
            downloader,
            package_url,
            staging_path,
        }
    }
}

#[async_trait]
impl RootKeyPackageSource for DownloadedPackageSource {
    async fn fetch(&self) -> Result<String, String> {
        let result = self
            .downloader
            .download(&self.package_url, &self.staging_path)
            .await;
        if !result.is_success() {
            return Err(result.result_details.unwrap_or_else(|| "download failed".into()));
        }
        tokio::fs::read_to_string(&self.staging_path)
            .await
            .map_err(|err| err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_downloader_copies_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("payload.bin");
        std::fs::write(&source, b"bytes").unwrap();
        let target = dir.path().join("out.bin");

        let result = FsDownloader
            .download(&format!("file://{}", source.display()), &target)
            .await;
        assert!(result.is_success());
        assert_eq!(std::fs::read(&target).unwrap(), b"bytes");
    }

    #[tokio::test]
    async fn fs_downloader_reports_delivery_facility_on_miss() {
        let dir = tempfile::tempdir().unwrap();
        let result = FsDownloader
            .download("file:///nonexistent/payload.bin", &dir.path().join("out"))
            .await;
        assert!(!result.is_success());
        assert_eq!(
            dua_core::facility_of(result.extended_result_code),
            Some(Facility::DeliveryOptimization)
        );
    }

    #[tokio::test]
    async fn trust_all_policy_accepts() {
        assert!(ManifestPolicy::TrustAll.verify("{}", "sig").is_ok());
    }

    #[tokio::test]
    async fn queueing_reporter_forwards_reports() {
        let (reporter, mut rx) = QueueingReporter::new();
        reporter
            .publish(WorkflowReport {
                workflow_id: "wf".into(),
                update_id: None,
                state: dua_workflow::WorkflowState::ApplySucceeded,
                result: UpdateResult::success(700),
                cancel_requested_after_terminal: false,
            })
            .await;
        assert_eq!(rx.recv().await.unwrap().workflow_id, "wf");
    }
}
