// SPDX-License-Identifier: MIT OR Apache-2.0
//! Cross-crate property-based tests for the universal invariants: hash
//! integrity, persistence round-trips, retry bounds, correlation
//! uniqueness, monotone cancellation, and root-key version monotonicity.

use dua_core::files::base64_sha256;
use dua_core::{UpdateId, verify_file};
use dua_handler::CancellationToken;
use dua_retry::{RetryParams, backoff_delay};
use dua_rootkey::{ActiveKeySet, RootKeyPackage, RootKeyStore};
use dua_workflow::{
    AgentRestartState, RebootState, SNAPSHOT_SCHEMA_VERSION, WorkflowSnapshot, WorkflowState,
};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::time::Duration;

fn arb_safe_string() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_.-]{1,20}"
}

fn arb_update_id() -> impl Strategy<Value = UpdateId> {
    (arb_safe_string(), arb_safe_string(), arb_safe_string())
        .prop_map(|(provider, name, version)| UpdateId::new(provider, name, version))
}

fn arb_workflow_state() -> impl Strategy<Value = WorkflowState> {
    prop_oneof![
        Just(WorkflowState::Idle),
        Just(WorkflowState::DeploymentInProgress),
        Just(WorkflowState::DownloadStarted),
        Just(WorkflowState::DownloadSucceeded),
        Just(WorkflowState::InstallStarted),
        Just(WorkflowState::InstallSucceeded),
        Just(WorkflowState::ApplyStarted),
        Just(WorkflowState::ApplySucceeded),
        Just(WorkflowState::Failed),
        Just(WorkflowState::FailedRestoreFailed),
        Just(WorkflowState::Cancelled),
    ]
}

fn arb_snapshot() -> impl Strategy<Value = WorkflowSnapshot> {
    (
        arb_workflow_state(),
        any::<i32>(),
        any::<i32>(),
        arb_update_id(),
        arb_safe_string(),
        proptest::option::of(arb_safe_string()),
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(
            |(state, rc, erc, update_id, workflow_id, criteria, reboot, restart)| {
                WorkflowSnapshot {
                    schema_version: SNAPSHOT_SCHEMA_VERSION,
                    workflow_step: state,
                    result_code: rc,
                    extended_result_code: erc,
                    system_reboot_state: if reboot {
                        RebootState::Required
                    } else {
                        RebootState::None
                    },
                    agent_restart_state: if restart {
                        AgentRestartState::Required
                    } else {
                        AgentRestartState::None
                    },
                    expected_update_id: update_id,
                    workflow_id,
                    update_type: Some("microsoft/swupdate:2".to_owned()),
                    installed_criteria: criteria,
                    work_folder: std::path::PathBuf::from("/var/lib/agent/sandbox/wf"),
                    reporting_json: serde_json::json!({ "resultCode": rc }),
                }
            },
        )
}

proptest! {
    /// Any snapshot survives serialize → disk → deserialize unchanged.
    #[test]
    fn persistence_round_trip(snapshot in arb_snapshot()) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflow.json");
        snapshot.save(&path).unwrap();
        let loaded = WorkflowSnapshot::load(&path).unwrap();
        prop_assert_eq!(loaded, snapshot);
    }

    /// Every payload verifies against its own digest, and any single-bit
    /// flip is detected.
    #[test]
    fn hash_integrity_detects_any_single_bit_flip(
        mut payload in proptest::collection::vec(any::<u8>(), 1..512),
        flip_byte in any::<prop::sample::Index>(),
        flip_bit in 0u8..8,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        let mut hashes = BTreeMap::new();
        hashes.insert("sha256".to_owned(), base64_sha256(&payload));

        std::fs::write(&path, &payload).unwrap();
        prop_assert!(verify_file(&path, payload.len() as u64, &hashes).is_ok());

        let index = flip_byte.index(payload.len());
        payload[index] ^= 1 << flip_bit;
        std::fs::write(&path, &payload).unwrap();
        prop_assert!(verify_file(&path, payload.len() as u64, &hashes).is_err());
    }

    /// Backoff delays stay inside [initial_delay, max_delay] for every
    /// jitter draw.
    #[test]
    fn retry_delay_is_bounded(
        attempt in 0u32..64,
        rand01 in 0.0f64..1.0,
        jitter in 0.0f64..=1.0,
        initial_ms in 1u64..10_000,
        span_ms in 0u64..3_600_000,
    ) {
        let params = RetryParams {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(initial_ms + span_ms),
            jitter,
            ..RetryParams::default()
        };
        let delay = backoff_delay(&params, attempt, rand01);
        prop_assert!(delay >= params.initial_delay);
        prop_assert!(delay <= params.max_delay);
    }

    /// The active root-key version never decreases, whatever package
    /// versions arrive in whatever order.
    #[test]
    fn root_key_version_is_nondecreasing(versions in proptest::collection::vec(0u64..100, 1..20)) {
        let store = RootKeyStore::new(ActiveKeySet::default());
        let mut last = store.version();
        for version in versions {
            let package: RootKeyPackage = serde_json::from_value(serde_json::json!({
                "protected": {
                    "isTest": false,
                    "version": version,
                    "published": 1759300000,
                    "rootKeys": { "kid": { "keyType": "RSA", "n": "AQAB", "e": "AQAB" } }
                },
                "signatures": []
            })).unwrap();
            store.swap_if_newer(&package);
            prop_assert!(store.version() >= last);
            last = store.version();
        }
    }

}

/// Every attempt of every operation gets correlation data no other attempt
/// ever carried, so a response can match at most one request.
#[tokio::test]
async fn correlation_ids_are_unique_across_operations_and_attempts() {
    use async_trait::async_trait;
    use dua_retry::{AttemptStart, OperationLogic, RetriableOperation};
    use std::time::Instant;

    struct AlwaysInFlight;

    #[async_trait]
    impl OperationLogic for AlwaysInFlight {
        fn name(&self) -> &'static str {
            "probe"
        }
        async fn begin_attempt(&mut self, _attempt: u32, _correlation_id: &str) -> AttemptStart {
            AttemptStart::InFlight
        }
    }

    let params = RetryParams {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter: 0.0,
        ..RetryParams::default()
    };
    let mut seen = std::collections::HashSet::new();
    for _ in 0..8 {
        let mut op = RetriableOperation::new(AlwaysInFlight, params);
        let mut t = Instant::now();
        for _ in 0..8 {
            op.do_work(t).await;
            assert!(seen.insert(op.correlation_id().unwrap().to_owned()));
            op.complete_failure(t, true).await;
            t += Duration::from_secs(1);
        }
    }
    assert_eq!(seen.len(), 64);
}

#[test]
fn cancellation_is_monotonic_across_clones() {
    let token = CancellationToken::new();
    let clones: Vec<_> = (0..8).map(|_| token.clone()).collect();
    token.cancel();
    for clone in &clones {
        assert!(clone.is_cancelled());
    }
    // No API un-cancels; a later clone of a cancelled token is cancelled.
    assert!(token.clone().is_cancelled());
}
