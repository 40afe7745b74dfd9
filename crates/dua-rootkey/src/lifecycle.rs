// SPDX-License-Identifier: MIT OR Apache-2.0

//! The background rotation operation.
//!
//! A retriable operation fetches the signed package (the source downloads
//! to its staging path and hands back the text), verifies it under the
//! currently active keys, and swaps the store iff the version advances.
//! The daemon re-arms the operation on its refresh interval.

use crate::package::RootKeyPackage;
use crate::store::RootKeyStore;
use crate::verify::verify_package;
use async_trait::async_trait;
use dua_retry::{AttemptStart, OperationLogic};
use std::sync::Arc;
use tracing::{info, warn};

/// Where root-key packages come from (staging download handled inside).
#[async_trait]
pub trait RootKeyPackageSource: Send + Sync {
    /// Fetch the current package document.
    async fn fetch(&self) -> Result<String, String>;
}

/// Operation logic: fetch → parse → verify → swap.
pub struct RotationLogic {
    source: Arc<dyn RootKeyPackageSource>,
    store: RootKeyStore,
    accept_test_packages: bool,
}

impl RotationLogic {
    /// Rotation against the given source and store.
    #[must_use]
    pub fn new(source: Arc<dyn RootKeyPackageSource>, store: RootKeyStore) -> Self {
        Self {
            source,
            store,
            accept_test_packages: false,
        }
    }

    /// Accept packages flagged `isTest`; test devices only.
    #[must_use]
    pub fn accepting_test_packages(mut self) -> Self {
        self.accept_test_packages = true;
        self
    }
}

#[async_trait]
impl OperationLogic for RotationLogic {
    fn name(&self) -> &'static str {
        "root-key-rotation"
    }

    async fn begin_attempt(&mut self, _attempt: u32, _correlation_id: &str) -> AttemptStart {
        let text = match self.source.fetch().await {
            Ok(text) => text,
            Err(err) => return AttemptStart::Retry(format!("package fetch failed: {err}")),
        };
        let package = match RootKeyPackage::from_json(&text) {
            Ok(package) => package,
            // A truncated download parses the same as a malformed one;
            // retry rather than latching a failure.
            Err(err) => return AttemptStart::Retry(format!("package unparseable: {err}")),
        };
        if package.protected.is_test && !self.accept_test_packages {
            return AttemptStart::Fatal("test package rejected on production device".into());
        }

        let current = self.store.snapshot();
        if let Err(err) = verify_package(&package, &current) {
            warn!(%err, "root-key package failed verification");
            return AttemptStart::Retry(format!("package verification failed: {err}"));
        }

        if self.store.swap_if_newer(&package) {
            info!(version = package.protected.version, "root-key set updated");
        }
        AttemptStart::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dua_retry::{OperationState, RetriableOperation, RetryParams};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    struct StaticSource {
        body: Mutex<Result<String, String>>,
    }

    #[async_trait]
    impl RootKeyPackageSource for StaticSource {
        async fn fetch(&self) -> Result<String, String> {
            self.body.lock().unwrap().clone()
        }
    }

    fn params() -> RetryParams {
        RetryParams {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter: 0.0,
            ..RetryParams::default()
        }
    }

    #[tokio::test]
    async fn fetch_failure_schedules_retry() {
        let source = Arc::new(StaticSource {
            body: Mutex::new(Err("offline".into())),
        });
        let store = RootKeyStore::new(crate::store::ActiveKeySet::default());
        let mut op = RetriableOperation::new(RotationLogic::new(source, store), params());
        assert_eq!(op.do_work(Instant::now()).await, OperationState::Idle);
        assert_eq!(op.bookkeeping().attempt_count, 1);
    }

    #[tokio::test]
    async fn unparseable_package_schedules_retry() {
        let source = Arc::new(StaticSource {
            body: Mutex::new(Ok("{ not json".into())),
        });
        let store = RootKeyStore::new(crate::store::ActiveKeySet::default());
        let mut op = RetriableOperation::new(RotationLogic::new(source, store), params());
        assert_eq!(op.do_work(Instant::now()).await, OperationState::Idle);
    }

    #[tokio::test]
    async fn verified_package_rotates_the_store() {
        use crate::verify::tests::TestSigner;

        let signer = TestSigner::generate("kid-1");
        let baked = crate::store::ActiveKeySet::baked_in(std::collections::BTreeMap::from([(
            "kid-1".to_owned(),
            signer.root_key(),
        )]));
        let store = RootKeyStore::new(baked);
        let package = signer.package(9);
        let source = Arc::new(StaticSource {
            body: Mutex::new(Ok(serde_json::to_string(&package).unwrap())),
        });

        let mut op =
            RetriableOperation::new(RotationLogic::new(source, store.clone()), params());
        assert_eq!(
            op.do_work(Instant::now()).await,
            OperationState::CompletedSuccess
        );
        assert_eq!(store.version(), 9);
    }

    #[tokio::test]
    async fn test_package_is_fatal_on_production_devices() {
        use crate::verify::tests::TestSigner;

        let signer = TestSigner::generate("kid-1");
        let mut package = signer.package(9);
        package.protected.is_test = true;
        let source = Arc::new(StaticSource {
            body: Mutex::new(Ok(serde_json::to_string(&package).unwrap())),
        });
        let store = RootKeyStore::new(crate::store::ActiveKeySet::default());
        let mut op = RetriableOperation::new(RotationLogic::new(source, store), params());
        assert_eq!(
            op.do_work(Instant::now()).await,
            OperationState::CompletedFailure
        );
    }
}
