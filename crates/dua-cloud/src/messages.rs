// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire message payloads and the response-code taxonomy.
//!
//! Message types ride in the `mt` MQTT user property; payloads are JSON.
//! The manifest travels as a *string* field so the signed bytes reach the
//! verifier untouched.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Message-type property values used by the core.
pub mod msgtype {
    /// Enrollment request (agent → service).
    pub const ENR_REQ: &str = "enr_req";
    /// Enrollment response (service → agent).
    pub const ENR_RESP: &str = "enr_resp";
    /// Enrollment change notification (service → agent).
    pub const ENR_CN: &str = "enr_cn";
    /// Agent-info request (agent → service).
    pub const AINFO_REQ: &str = "ainfo_req";
    /// Agent-info response (service → agent).
    pub const AINFO_RESP: &str = "ainfo_resp";
    /// Update-available notification (service → agent).
    pub const UPD_CN: &str = "upd_cn";
    /// Update request (agent → service).
    pub const UPD_REQ: &str = "upd_req";
    /// Update response carrying the deployment (service → agent).
    pub const UPD_RESP: &str = "upd_resp";
    /// Update-result request (agent → service).
    pub const UPDRSLT_REQ: &str = "updrslt_req";
    /// Update-result receipt acknowledgment (service → agent).
    pub const UPDRSLT_RESP: &str = "updrslt_resp";
    /// Deferred update-result acknowledgment (service → agent).
    pub const UPDRSLT_ACK: &str = "updrslt_ack";
}

// ---------------------------------------------------------------------------
// Response codes
// ---------------------------------------------------------------------------

/// Service-side outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum ResponseCode {
    /// The request was accepted.
    Success,
    /// The request was malformed; retrying cannot help.
    BadRequest,
    /// The service is busy; retry with backoff.
    Busy,
    /// The request conflicts with service state; do not retry.
    Conflict,
    /// Transient service failure; retry with backoff.
    ServerError,
    /// The device is not enrolled; re-run enrollment first.
    AgentNotEnrolled,
}

impl ResponseCode {
    /// How the retry framework should treat this code.
    #[must_use]
    pub fn recovery(&self) -> Recovery {
        match self {
            Self::Success => Recovery::Done,
            Self::Busy | Self::ServerError => Recovery::Retry,
            Self::BadRequest | Self::Conflict => Recovery::Fail,
            Self::AgentNotEnrolled => Recovery::Reenroll,
        }
    }
}

/// Recovery classification of a [`ResponseCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Terminal success.
    Done,
    /// Retry with backoff.
    Retry,
    /// Terminal failure until external state changes.
    Fail,
    /// Cascade to the enrollment operation.
    Reenroll,
}

/// Detail accompanying a non-success [`ResponseCode`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum ResponseExtendedCode {
    /// No further detail.
    #[default]
    None,
    /// The payload could not be parsed.
    UnableToParse,
    /// A required value is missing or invalid.
    MissingOrInvalidValue,
    /// Correlation data is missing or invalid.
    MissingOrInvalidCorrelationId,
    /// The `mt` property is missing or invalid.
    MissingOrInvalidMessageType,
    /// The `pid` property is missing or invalid.
    MissingOrInvalidProtocolVersion,
    /// The sender speaks a different protocol version.
    ProtocolVersionMismatch,
    /// The content type is missing or invalid.
    MissingOrInvalidContentType,
}

/// Result block carried by every response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResponseResult {
    /// Outcome code.
    pub code: ResponseCode,
    /// Optional detail code.
    #[serde(default)]
    pub extended_code: ResponseExtendedCode,
}

impl ResponseResult {
    /// A plain success block.
    #[must_use]
    pub fn success() -> Self {
        Self {
            code: ResponseCode::Success,
            extended_code: ResponseExtendedCode::None,
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// `enr_req` payload; identity rides in the topic and session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentRequest {}

/// `enr_resp` payload.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentResponse {
    /// Service outcome.
    pub result: ResponseResult,
    /// Whether the device is enrolled.
    #[serde(default)]
    pub is_enrolled: bool,
    /// Scope the device enrolled into, when enrolled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
}

/// `enr_cn` payload: the service's enrollment view changed.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentChange {
    /// The device's new enrollment state.
    pub is_enrolled: bool,
}

/// `ainfo_req` payload: device identity and capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfoRequest {
    /// Monotonic sequence number; bumped when properties change.
    pub sequence_number: u64,
    /// Compatibility properties the service matches deployments against.
    #[serde(default)]
    pub compat_properties: BTreeMap<String, String>,
}

/// `ainfo_resp` payload.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfoResponse {
    /// Service outcome.
    pub result: ResponseResult,
}

/// `upd_req` payload; asks for the device's current deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {}

/// Workflow identity block inside deployments and result reports.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRef {
    /// Service-assigned workflow id.
    pub id: String,
    /// Requested action (`processDeployment` or `cancel`).
    pub action: String,
}

/// Deployment block of an `upd_resp`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentPayload {
    /// Workflow identity and action.
    pub workflow: WorkflowRef,
    /// Signed manifest JSON, byte-exact.
    pub update_manifest: String,
    /// Detached signature material.
    #[serde(default)]
    pub update_manifest_signature: String,
    /// File id → download URL.
    #[serde(default)]
    pub file_urls: HashMap<String, String>,
}

/// `upd_resp` payload.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResponse {
    /// Service outcome.
    pub result: ResponseResult,
    /// The current deployment; absent when nothing is assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentPayload>,
}

/// `updrslt_req` payload.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResultRequest {
    /// Workflow the result belongs to.
    pub workflow: WorkflowRef,
    /// The engine's report, verbatim.
    pub report: serde_json::Value,
}

/// `updrslt_resp` payload: receipt acknowledgment.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResultResponse {
    /// Service outcome.
    pub result: ResponseResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_codes_are_camel_case_strings() {
        assert_eq!(
            serde_json::to_string(&ResponseCode::AgentNotEnrolled).unwrap(),
            "\"agentNotEnrolled\""
        );
        assert_eq!(
            serde_json::to_string(&ResponseExtendedCode::ProtocolVersionMismatch).unwrap(),
            "\"protocolVersionMismatch\""
        );
    }

    #[test]
    fn recovery_classification() {
        use Recovery as R;
        assert_eq!(ResponseCode::Success.recovery(), R::Done);
        assert_eq!(ResponseCode::Busy.recovery(), R::Retry);
        assert_eq!(ResponseCode::ServerError.recovery(), R::Retry);
        assert_eq!(ResponseCode::BadRequest.recovery(), R::Fail);
        assert_eq!(ResponseCode::Conflict.recovery(), R::Fail);
        assert_eq!(ResponseCode::AgentNotEnrolled.recovery(), R::Reenroll);
    }

    #[test]
    fn extended_code_defaults_to_none() {
        let r: ResponseResult = serde_json::from_str(r#"{"code":"success"}"#).unwrap();
        assert_eq!(r.extended_code, ResponseExtendedCode::None);
    }

    #[test]
    fn upd_resp_round_trips_with_deployment() {
        let resp = UpdateResponse {
            result: ResponseResult::success(),
            deployment: Some(DeploymentPayload {
                workflow: WorkflowRef {
                    id: "wf-1".into(),
                    action: "processDeployment".into(),
                },
                update_manifest: r#"{"manifestVersion":5}"#.into(),
                update_manifest_signature: "sig".into(),
                file_urls: HashMap::from([("f1".to_owned(), "http://x/f1".to_owned())]),
            }),
        };
        let json = serde_json::to_string(&resp).unwrap();
        let back: UpdateResponse = serde_json::from_str(&json).unwrap();
        let deployment = back.deployment.unwrap();
        assert_eq!(deployment.workflow.id, "wf-1");
        // The manifest string is untouched by the round trip.
        assert_eq!(deployment.update_manifest, r#"{"manifestVersion":5}"#);
    }

    #[test]
    fn upd_resp_without_deployment() {
        let back: UpdateResponse =
            serde_json::from_str(r#"{"result":{"code":"success"}}"#).unwrap();
        assert!(back.deployment.is_none());
    }
}
