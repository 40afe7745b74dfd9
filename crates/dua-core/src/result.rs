// SPDX-License-Identifier: MIT OR Apache-2.0

//! The uniform result triple used end-to-end.
//!
//! Every handler invocation, workflow phase, and cloud report carries an
//! [`UpdateResult`]: a banded `result_code`, a facility-tagged
//! `extended_result_code`, and optional free-form detail text.
//!
//! Code bands per phase:
//!
//! | Band | Phase |
//! |------|-------|
//! | 500s | Download |
//! | 600s | Install |
//! | 700s | Apply |
//! | 800s | Cancel |
//! | 900s | IsInstalled |
//! | 1000s | Backup |
//! | 1100s | Restore |
//!
//! A result is a success iff `result_code > 0`. Several success values are
//! "success with a variant": they encode a side effect the engine must act
//! on, such as [`codes::INSTALL_REQUIRED_IMMEDIATE_REBOOT`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// UpdateResult
// ---------------------------------------------------------------------------

/// Outcome of a handler invocation or workflow phase.
///
/// Wire shape (also the on-disk shape of the handler result file):
///
/// ```json
/// { "resultCode": 700, "extendedResultCode": 0, "resultDetails": "ok" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResult {
    /// Banded result code; `0` means failure, anything else success.
    pub result_code: i32,
    /// Facility-tagged 32-bit extended code; see [`Facility`].
    pub extended_result_code: i32,
    /// Optional human-readable detail, surfaced verbatim to the service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_details: Option<String>,
}

impl UpdateResult {
    /// A plain success with the given banded code.
    #[must_use]
    pub fn success(result_code: i32) -> Self {
        Self {
            result_code,
            extended_result_code: 0,
            result_details: None,
        }
    }

    /// A failure carrying the given extended code.
    #[must_use]
    pub fn failure(extended_result_code: i32) -> Self {
        Self {
            result_code: codes::FAILURE,
            extended_result_code,
            result_details: None,
        }
    }

    /// A failure with extended code and detail text.
    #[must_use]
    pub fn failure_with_details(extended_result_code: i32, details: impl Into<String>) -> Self {
        Self {
            result_code: codes::FAILURE,
            extended_result_code,
            result_details: Some(details.into()),
        }
    }

    /// The cancelled outcome: distinguished from both success and failure.
    #[must_use]
    pub fn cancelled() -> Self {
        Self {
            result_code: codes::FAILURE_CANCELLED,
            extended_result_code: 0,
            result_details: None,
        }
    }

    /// Attach or replace the detail text.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.result_details = Some(details.into());
        self
    }

    /// Success iff the result code is positive.
    ///
    /// `0` is the generic failure; [`codes::FAILURE_CANCELLED`] is negative
    /// so that cancellation is never mistaken for a success band.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result_code > 0
    }

    /// `true` for the dedicated cancelled code.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.result_code == codes::FAILURE_CANCELLED
    }

    /// Rewrite a silent `(0, 0)` pair with a discoverability sentinel.
    ///
    /// A handler that reports `result_code == 0` with
    /// `extended_result_code == 0` looks success-adjacent while carrying no
    /// information at all. The engine never forwards such a pair; it stamps
    /// [`erc_value::UNREPORTED_ERROR`] so the failure stays discoverable.
    #[must_use]
    pub fn with_discovery_sentinel(mut self) -> Self {
        if self.result_code == codes::FAILURE && self.extended_result_code == 0 {
            self.extended_result_code = erc_value::UNREPORTED_ERROR;
        }
        self
    }
}

impl fmt::Display for UpdateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rc={} erc={:#010x}",
            self.result_code, self.extended_result_code as u32
        )?;
        if let Some(details) = &self.result_details {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Result code bands
// ---------------------------------------------------------------------------

/// Banded result code constants.
///
/// The bands are part of the wire contract; values in a band that are not
/// named here are reserved.
pub mod codes {
    /// Generic failure.
    pub const FAILURE: i32 = 0;
    /// The operation observed a cancellation request and stopped.
    pub const FAILURE_CANCELLED: i32 = -1;
    /// Generic success outside any phase band.
    pub const SUCCESS: i32 = 1;

    /// Download completed and payloads verified.
    pub const DOWNLOAD_SUCCESS: i32 = 500;
    /// Download is still running (interim reporting only).
    pub const DOWNLOAD_IN_PROGRESS: i32 = 501;
    /// Download skipped: target file already present and valid.
    pub const DOWNLOAD_SKIPPED_FILE_EXISTS: i32 = 502;
    /// Download skipped: installed criteria already satisfied.
    pub const DOWNLOAD_SKIPPED_UPDATE_ALREADY_INSTALLED: i32 = 503;
    /// Download-handler plug-in produced the file; no network download.
    pub const DOWNLOAD_HANDLER_SUCCESS_SKIP_DOWNLOAD: i32 = 520;
    /// Download-handler plug-in declined; fall back to a full download.
    pub const DOWNLOAD_HANDLER_REQUIRED_FULL_DOWNLOAD: i32 = 521;

    /// Install completed.
    pub const INSTALL_SUCCESS: i32 = 600;
    /// Install is still running (interim reporting only).
    pub const INSTALL_IN_PROGRESS: i32 = 601;
    /// Install skipped: installed criteria already satisfied.
    pub const INSTALL_SKIPPED_UPDATE_ALREADY_INSTALLED: i32 = 603;
    /// Install skipped: the step selected no matching components.
    pub const INSTALL_SKIPPED_NO_MATCHING_COMPONENTS: i32 = 604;
    /// Install succeeded and the device must reboot before anything else runs.
    pub const INSTALL_REQUIRED_IMMEDIATE_REBOOT: i32 = 605;
    /// Install succeeded; a reboot is required after the workflow finishes.
    pub const INSTALL_REQUIRED_REBOOT: i32 = 606;
    /// Install succeeded and the agent must restart before anything else runs.
    pub const INSTALL_REQUIRED_IMMEDIATE_AGENT_RESTART: i32 = 607;
    /// Install succeeded; an agent restart is required after the workflow.
    pub const INSTALL_REQUIRED_AGENT_RESTART: i32 = 608;

    /// Apply completed; the update is live.
    pub const APPLY_SUCCESS: i32 = 700;
    /// Apply is still running (interim reporting only).
    pub const APPLY_IN_PROGRESS: i32 = 701;
    /// Apply succeeded; a reboot is required after the workflow finishes.
    pub const APPLY_REQUIRED_REBOOT: i32 = 705;
    /// Apply succeeded and the device must reboot immediately.
    pub const APPLY_REQUIRED_IMMEDIATE_REBOOT: i32 = 706;
    /// Apply succeeded and the agent must restart immediately.
    pub const APPLY_REQUIRED_IMMEDIATE_AGENT_RESTART: i32 = 707;
    /// Apply succeeded; an agent restart is required after the workflow.
    pub const APPLY_REQUIRED_AGENT_RESTART: i32 = 708;

    /// Cancel completed; in-progress work was reverted.
    pub const CANCEL_SUCCESS: i32 = 800;
    /// The handler could not cancel at this point.
    pub const CANCEL_UNABLE_TO_CANCEL: i32 = 801;

    /// Installed criteria is satisfied on the device.
    pub const IS_INSTALLED_INSTALLED: i32 = 900;
    /// Installed criteria is not satisfied.
    pub const IS_INSTALLED_NOT_INSTALLED: i32 = 901;

    /// Backup completed.
    pub const BACKUP_SUCCESS: i32 = 1000;
    /// Handler does not support backup; treated as success.
    pub const BACKUP_SUCCESS_UNSUPPORTED: i32 = 1001;

    /// Restore completed.
    pub const RESTORE_SUCCESS: i32 = 1100;
    /// Handler does not support restore; treated as success.
    pub const RESTORE_SUCCESS_UNSUPPORTED: i32 = 1101;
}

/// Side effect a success-with-variant code asks the engine to schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PostActionRequest {
    /// No scheduling request.
    None,
    /// Reboot once the workflow reaches a terminal state.
    Reboot,
    /// Reboot before any further step runs.
    ImmediateReboot,
    /// Restart the agent once the workflow reaches a terminal state.
    AgentRestart,
    /// Restart the agent before any further step runs.
    ImmediateAgentRestart,
}

impl PostActionRequest {
    /// Map a result code to the scheduling request it encodes, if any.
    #[must_use]
    pub fn from_result_code(code: i32) -> Self {
        match code {
            codes::INSTALL_REQUIRED_REBOOT | codes::APPLY_REQUIRED_REBOOT => Self::Reboot,
            codes::INSTALL_REQUIRED_IMMEDIATE_REBOOT | codes::APPLY_REQUIRED_IMMEDIATE_REBOOT => {
                Self::ImmediateReboot
            }
            codes::INSTALL_REQUIRED_AGENT_RESTART | codes::APPLY_REQUIRED_AGENT_RESTART => {
                Self::AgentRestart
            }
            codes::INSTALL_REQUIRED_IMMEDIATE_AGENT_RESTART
            | codes::APPLY_REQUIRED_IMMEDIATE_AGENT_RESTART => Self::ImmediateAgentRestart,
            _ => Self::None,
        }
    }
}

// ---------------------------------------------------------------------------
// Extended result codes
// ---------------------------------------------------------------------------

/// Facility tag occupying the top nibble of an extended result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Facility {
    /// Content-handler family (install, apply, result-file parsing, ...).
    ContentHandler = 0x3,
    /// Download-handler plug-in family; see [`DownloadHandlerComponent`].
    DownloadHandler = 0x9,
    /// Agent core: engine, cloud client, catastrophic internal errors.
    AgentCore = 0xA,
    /// Delivery-optimization library error passthrough.
    DeliveryOptimization = 0xD,
    /// OS errno echoed into the low bits.
    Errno = 0xE,
}

/// Sub-component byte used inside the [`Facility::DownloadHandler`] family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DownloadHandlerComponent {
    /// The extension manager that locates and loads plug-ins.
    ExtensionManager = 0x0,
    /// A plug-in itself.
    Plugin = 0x1,
    /// Shared plug-in support code.
    Common = 0x2,
    /// The persistent source-update cache.
    SourceCache = 0x3,
    /// The delta processor.
    DeltaProcessor = 0x4,
}

/// Compose an extended result code from a facility and a 28-bit component code.
#[must_use]
pub const fn erc(facility: Facility, code: u32) -> i32 {
    (((facility as u32) << 28) | (code & 0x0FFF_FFFF)) as i32
}

/// Compose a download-handler-family code with its sub-component byte.
#[must_use]
pub const fn erc_download_handler(component: DownloadHandlerComponent, code: u32) -> i32 {
    erc(
        Facility::DownloadHandler,
        ((component as u32) << 20) | (code & 0x000F_FFFF),
    )
}

/// Echo an OS errno into the errno facility.
#[must_use]
pub const fn erc_errno(errno: i32) -> i32 {
    erc(Facility::Errno, errno as u32)
}

/// Extract the facility nibble from an extended result code.
#[must_use]
pub fn facility_of(extended_result_code: i32) -> Option<Facility> {
    match (extended_result_code as u32) >> 28 {
        0x3 => Some(Facility::ContentHandler),
        0x9 => Some(Facility::DownloadHandler),
        0xA => Some(Facility::AgentCore),
        0xD => Some(Facility::DeliveryOptimization),
        0xE => Some(Facility::Errno),
        _ => None,
    }
}

/// Well-known extended result code values.
pub mod erc_value {
    use super::{DownloadHandlerComponent, Facility, erc, erc_download_handler};

    /// Stamped over a silent `(0, 0)` pair before reporting.
    pub const UNREPORTED_ERROR: i32 = erc(Facility::AgentCore, 0x000_0001);
    /// Manifest signature did not verify against the active root keys.
    pub const SIGNATURE_VALIDATION_FAILED: i32 = erc(Facility::AgentCore, 0x000_0002);
    /// No handler is registered for the step's update type.
    pub const UNKNOWN_UPDATE_TYPE: i32 = erc(Facility::AgentCore, 0x000_0003);
    /// A reference step could not be resolved to a child manifest.
    pub const UNRESOLVABLE_REFERENCE_STEP: i32 = erc(Facility::AgentCore, 0x000_0004);
    /// Reference-step resolution exceeded the depth bound or revisited an id.
    pub const MANIFEST_REFERENCE_CYCLE: i32 = erc(Facility::AgentCore, 0x000_0005);
    /// The manifest failed structural validation.
    pub const MANIFEST_VALIDATION_FAILED: i32 = erc(Facility::AgentCore, 0x000_0006);
    /// None of the manifest's compatibility sets matched the device.
    pub const INCOMPATIBLE_UPDATE: i32 = erc(Facility::AgentCore, 0x000_0007);
    /// A component panicked; the panic was converted at the boundary.
    pub const COMPONENT_PANIC: i32 = erc(Facility::AgentCore, 0x000_0008);
    /// An aborted deployment was replaced by a newer one.
    pub const DEPLOYMENT_SUPERSEDED: i32 = erc(Facility::AgentCore, 0x000_0009);

    /// A downloaded payload's size did not match the manifest.
    pub const FILE_SIZE_MISMATCH: i32 = erc(Facility::ContentHandler, 0x10_0001);
    /// A downloaded payload's hash did not match the manifest.
    pub const FILE_HASH_MISMATCH: i32 = erc(Facility::ContentHandler, 0x10_0002);
    /// The manifest declared a hash algorithm the agent cannot compute.
    pub const UNSUPPORTED_HASH_ALGORITHM: i32 = erc(Facility::ContentHandler, 0x10_0003);
    /// The handler result file was missing or unparseable.
    pub const PARSE_RESULT_FILE: i32 = erc(Facility::ContentHandler, 0x10_0004);
    /// The step referenced a file id absent from the manifest file table.
    pub const UNKNOWN_FILE_ID: i32 = erc(Facility::ContentHandler, 0x10_0005);
    /// No download URL was supplied for a payload file.
    pub const MISSING_FILE_URL: i32 = erc(Facility::ContentHandler, 0x10_0006);

    /// The source cache had no usable source update.
    pub const SOURCE_CACHE_MISS: i32 =
        erc_download_handler(DownloadHandlerComponent::SourceCache, 0x0_0001);
    /// The delta processor failed to reconstruct the target.
    pub const DELTA_RECONSTRUCTION_FAILED: i32 =
        erc_download_handler(DownloadHandlerComponent::DeltaProcessor, 0x0_0001);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_iff_nonzero() {
        assert!(UpdateResult::success(codes::APPLY_SUCCESS).is_success());
        assert!(!UpdateResult::cancelled().is_success());
        assert!(!UpdateResult::failure(erc_value::UNKNOWN_UPDATE_TYPE).is_success());
    }

    #[test]
    fn cancelled_is_distinguished() {
        let r = UpdateResult::cancelled();
        assert!(r.is_cancelled());
        assert!(!UpdateResult::success(codes::SUCCESS).is_cancelled());
    }

    #[test]
    fn facility_occupies_top_nibble() {
        let code = erc(Facility::DeliveryOptimization, 0x0ABCDEF);
        assert_eq!((code as u32) >> 28, 0xD);
        assert_eq!(facility_of(code), Some(Facility::DeliveryOptimization));
    }

    #[test]
    fn erc_masks_component_bits() {
        // Component codes wider than 28 bits must not bleed into the facility.
        let code = erc(Facility::ContentHandler, 0xFFFF_FFFF);
        assert_eq!(facility_of(code), Some(Facility::ContentHandler));
    }

    #[test]
    fn download_handler_subcomponent_byte() {
        let code = erc_download_handler(DownloadHandlerComponent::DeltaProcessor, 7);
        assert_eq!((code as u32) >> 28, 0x9);
        assert_eq!(((code as u32) >> 20) & 0xF, 0x4);
        assert_eq!((code as u32) & 0x000F_FFFF, 7);
    }

    #[test]
    fn errno_echo() {
        let code = erc_errno(13);
        assert_eq!(facility_of(code), Some(Facility::Errno));
        assert_eq!(code & 0x0FFF_FFFF, 13);
    }

    #[test]
    fn sentinel_replaces_silent_zero_pair() {
        let r = UpdateResult::failure(0).with_discovery_sentinel();
        assert_eq!(r.extended_result_code, erc_value::UNREPORTED_ERROR);
    }

    #[test]
    fn sentinel_leaves_real_erc_alone() {
        let r = UpdateResult::failure(42).with_discovery_sentinel();
        assert_eq!(r.extended_result_code, 42);
    }

    #[test]
    fn sentinel_leaves_successes_and_cancellation_alone() {
        let r = UpdateResult::success(codes::APPLY_SUCCESS).with_discovery_sentinel();
        assert_eq!(r.extended_result_code, 0);
        let c = UpdateResult::cancelled().with_discovery_sentinel();
        assert_eq!(c.extended_result_code, 0);
    }

    #[test]
    fn post_action_mapping() {
        use PostActionRequest as P;
        assert_eq!(
            P::from_result_code(codes::INSTALL_REQUIRED_IMMEDIATE_REBOOT),
            P::ImmediateReboot
        );
        assert_eq!(
            P::from_result_code(codes::APPLY_REQUIRED_AGENT_RESTART),
            P::AgentRestart
        );
        assert_eq!(P::from_result_code(codes::APPLY_SUCCESS), P::None);
        assert_eq!(P::from_result_code(codes::FAILURE), P::None);
    }

    #[test]
    fn wire_shape_is_camel_case() {
        let r = UpdateResult {
            result_code: 700,
            extended_result_code: 0,
            result_details: Some("done".into()),
        };
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["resultCode"], 700);
        assert_eq!(json["extendedResultCode"], 0);
        assert_eq!(json["resultDetails"], "done");
    }

    #[test]
    fn missing_details_round_trips_as_none() {
        let r: UpdateResult =
            serde_json::from_str(r#"{"resultCode":0,"extendedResultCode":5}"#).unwrap();
        assert_eq!(r.result_details, None);
    }

    mod properties {
        use super::super::*;
        use proptest::prelude::*;

        fn arb_facility() -> impl Strategy<Value = Facility> {
            prop_oneof![
                Just(Facility::ContentHandler),
                Just(Facility::DownloadHandler),
                Just(Facility::AgentCore),
                Just(Facility::DeliveryOptimization),
                Just(Facility::Errno),
            ]
        }

        proptest! {
            #[test]
            fn facility_round_trips(facility in arb_facility(), code in 0u32..0x0FFF_FFFF) {
                let composed = erc(facility, code);
                prop_assert_eq!(facility_of(composed), Some(facility));
                prop_assert_eq!((composed as u32) & 0x0FFF_FFFF, code);
            }

            #[test]
            fn sentinel_never_erases_a_reported_code(erc_in in 1i32..) {
                let r = UpdateResult::failure(erc_in).with_discovery_sentinel();
                prop_assert_eq!(r.extended_result_code, erc_in);
            }

            #[test]
            fn sentinel_never_touches_successes(code in 1i32..2000) {
                let r = UpdateResult::success(code).with_discovery_sentinel();
                prop_assert_eq!(r.extended_result_code, 0);
            }
        }
    }
}
