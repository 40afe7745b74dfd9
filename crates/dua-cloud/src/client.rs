// SPDX-License-Identifier: MIT OR Apache-2.0

//! The control-plane client: ordered operations plus response dispatch.
//!
//! Ordering invariants: agent-info runs only once enrolled; update pulls
//! run only once the agent info is confirmed; an `AgentNotEnrolled` answer
//! anywhere cascades everything back to enrollment. Responses are matched
//! to operations by correlation data, byte for byte.

use crate::messages::{
    AgentInfoRequest, AgentInfoResponse, DeploymentPayload, EnrollmentChange, EnrollmentResponse,
    Recovery, ResponseExtendedCode, UpdateResponse, UpdateResultRequest, UpdateResultResponse,
    WorkflowRef, msgtype,
};
use crate::operations::{
    AgentInfoLogic, EnrollmentLogic, OutboundQueue, OutboundRequest, UpdateRequestLogic,
    UpdateResultLogic,
};
use dua_mqtt::IncomingMessage;
use dua_retry::{OperationState, RetriableOperation, RetryParams};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

/// High-level enrollment view derived from the enrollment operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollmentState {
    /// Enrollment failed or expired; the device is not associated.
    NotEnrolled,
    /// An enrollment request is pending or scheduled.
    Requesting,
    /// The service confirmed enrollment.
    Enrolled,
}

/// A protocol-level failure recorded against an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolFailure {
    /// Operation the failure hit.
    pub operation: &'static str,
    /// The detail code.
    pub code: ResponseExtendedCode,
}

/// The client: four retriable operations sharing one outbound queue.
pub struct CloudClient {
    queue: OutboundQueue,
    enrollment: RetriableOperation<EnrollmentLogic>,
    agent_info: RetriableOperation<AgentInfoLogic>,
    update: RetriableOperation<UpdateRequestLogic>,
    result: RetriableOperation<UpdateResultLogic>,
    pending_reports: Arc<Mutex<VecDeque<UpdateResultRequest>>>,
    update_armed: bool,
    last_protocol_failure: Option<ProtocolFailure>,
}

impl CloudClient {
    /// Build a client advertising the given device properties.
    #[must_use]
    pub fn new(compat_properties: BTreeMap<String, String>, retry: RetryParams) -> Self {
        let queue: OutboundQueue = Arc::new(Mutex::new(VecDeque::new()));
        let pending_reports = Arc::new(Mutex::new(VecDeque::new()));
        let agent_info_request = AgentInfoRequest {
            sequence_number: 1,
            compat_properties,
        };
        Self {
            enrollment: RetriableOperation::new(EnrollmentLogic::new(queue.clone()), retry),
            agent_info: RetriableOperation::new(
                AgentInfoLogic::new(queue.clone(), agent_info_request),
                retry,
            ),
            update: RetriableOperation::new(UpdateRequestLogic::new(queue.clone()), retry),
            result: RetriableOperation::new(
                UpdateResultLogic::new(queue.clone(), pending_reports.clone()),
                retry,
            ),
            queue,
            pending_reports,
            update_armed: false,
            last_protocol_failure: None,
        }
    }

    /// Current enrollment view.
    #[must_use]
    pub fn enrollment_state(&self) -> EnrollmentState {
        match self.enrollment.state() {
            OperationState::CompletedSuccess => EnrollmentState::Enrolled,
            OperationState::Idle | OperationState::InProgress => EnrollmentState::Requesting,
            _ => EnrollmentState::NotEnrolled,
        }
    }

    /// Whether agent info has been confirmed for the current property set.
    #[must_use]
    pub fn agent_info_confirmed(&self) -> bool {
        self.agent_info.state() == OperationState::CompletedSuccess
    }

    /// The most recent protocol-level failure, if any.
    #[must_use]
    pub fn last_protocol_failure(&self) -> Option<&ProtocolFailure> {
        self.last_protocol_failure.as_ref()
    }

    /// Reports still waiting for a service acknowledgment.
    #[must_use]
    pub fn pending_report_count(&self) -> usize {
        self.pending_reports.lock().expect("pending lock").len()
    }

    /// Replace the advertised device properties; re-arms agent info.
    pub fn set_agent_properties(&mut self, properties: BTreeMap<String, String>) {
        if self.agent_info.logic().request().compat_properties == properties {
            return;
        }
        info!("agent properties changed, re-advertising");
        self.agent_info.logic_mut().update_request(properties);
        self.agent_info.reset();
    }

    /// Queue a workflow report for delivery as `updrslt_req`.
    pub fn enqueue_report(&mut self, workflow: WorkflowRef, report: serde_json::Value) {
        self.pending_reports
            .lock()
            .expect("pending lock")
            .push_back(UpdateResultRequest { workflow, report });
        if self.result.state().is_terminal() {
            self.result.reset();
        }
    }

    /// Ask the service for the current deployment (also armed by `upd_cn`).
    pub fn request_update_check(&mut self) {
        self.update_armed = true;
        if self.update.state().is_terminal() {
            self.update.reset();
        }
    }

    /// Drive all operations in priority order for one tick.
    pub async fn do_work(&mut self, now: Instant) {
        self.enrollment.do_work(now).await;
        if self.enrollment.state() != OperationState::CompletedSuccess {
            return;
        }
        self.agent_info.do_work(now).await;
        if self.agent_info.state() != OperationState::CompletedSuccess {
            return;
        }
        if self.update_armed {
            self.update.do_work(now).await;
        }
        if !self.pending_reports.lock().expect("pending lock").is_empty() {
            self.result.do_work(now).await;
        }
    }

    /// Take everything waiting to be published.
    #[must_use]
    pub fn drain_outbound(&mut self) -> Vec<OutboundRequest> {
        self.queue.lock().expect("outbound queue lock").drain(..).collect()
    }

    /// Tell the client its published request failed to leave the device
    /// (fast-fail publish while disconnected); schedules a retry.
    pub async fn publish_failed(&mut self, message_type: &str, now: Instant) {
        match message_type {
            msgtype::ENR_REQ => self.enrollment.complete_failure(now, true).await,
            msgtype::AINFO_REQ => self.agent_info.complete_failure(now, true).await,
            msgtype::UPD_REQ => self.update.complete_failure(now, true).await,
            msgtype::UPDRSLT_REQ => self.result.complete_failure(now, true).await,
            _ => {}
        }
    }

    /// Dispatch one inbound message.
    ///
    /// Returns a deployment when an `upd_resp` carries one.
    pub async fn handle_message(
        &mut self,
        message: &IncomingMessage,
        now: Instant,
    ) -> Option<DeploymentPayload> {
        match message.message_type.as_str() {
            msgtype::ENR_RESP => {
                self.handle_enrollment_response(message, now).await;
                None
            }
            msgtype::ENR_CN => {
                self.handle_enrollment_change(message);
                None
            }
            msgtype::AINFO_RESP => {
                self.handle_agent_info_response(message, now).await;
                None
            }
            msgtype::UPD_CN => {
                info!("update available notification");
                self.request_update_check();
                None
            }
            msgtype::UPD_RESP => self.handle_update_response(message, now).await,
            msgtype::UPDRSLT_RESP => {
                self.handle_result_response(message, now).await;
                None
            }
            msgtype::UPDRSLT_ACK => {
                debug!("deferred result acknowledgment received");
                None
            }
            other => {
                debug!(message_type = other, "ignoring unknown message type");
                None
            }
        }
    }

    // -- per-message handlers -----------------------------------------------

    async fn handle_enrollment_response(&mut self, message: &IncomingMessage, now: Instant) {
        if !correlates(&self.enrollment, message) {
            warn!("enr_resp with stale or missing correlation data");
            return;
        }
        let Some(response) =
            self.checked_payload::<EnrollmentResponse>(message, "enrollment", now).await
        else {
            return;
        };
        match response.result.code.recovery() {
            Recovery::Done if response.is_enrolled => {
                info!(scope = ?response.scope_id, "device enrolled");
                self.enrollment.complete_success(now).await;
            }
            Recovery::Done | Recovery::Retry | Recovery::Reenroll => {
                self.enrollment.complete_failure(now, true).await;
            }
            Recovery::Fail => {
                self.record_protocol_failure("enrollment", response.result.extended_code);
                self.enrollment.complete_failure(now, false).await;
            }
        }
    }

    fn handle_enrollment_change(&mut self, message: &IncomingMessage) {
        let Ok(change) = serde_json::from_slice::<EnrollmentChange>(&message.payload) else {
            warn!("unparseable enr_cn");
            return;
        };
        info!(is_enrolled = change.is_enrolled, "enrollment change notification");
        if !change.is_enrolled {
            self.cascade_to_enrollment();
        } else if self.enrollment.state().is_terminal() {
            // Re-evaluate: the service now claims we are enrolled.
            self.enrollment.reset();
        }
    }

    async fn handle_agent_info_response(&mut self, message: &IncomingMessage, now: Instant) {
        if !correlates(&self.agent_info, message) {
            warn!("ainfo_resp with stale or missing correlation data");
            return;
        }
        let Some(response) =
            self.checked_payload::<AgentInfoResponse>(message, "agent-info", now).await
        else {
            return;
        };
        match response.result.code.recovery() {
            Recovery::Done => {
                info!("agent info confirmed");
                self.agent_info.complete_success(now).await;
                // First confirmation pulls the current deployment.
                self.request_update_check();
            }
            Recovery::Retry => self.agent_info.complete_failure(now, true).await,
            Recovery::Fail => {
                self.record_protocol_failure("agent-info", response.result.extended_code);
                self.agent_info.complete_failure(now, false).await;
            }
            Recovery::Reenroll => self.cascade_to_enrollment(),
        }
    }

    async fn handle_update_response(
        &mut self,
        message: &IncomingMessage,
        now: Instant,
    ) -> Option<DeploymentPayload> {
        if !correlates(&self.update, message) {
            warn!("upd_resp with stale or missing correlation data");
            return None;
        }
        let response = self
            .checked_payload::<UpdateResponse>(message, "update-request", now)
            .await?;
        match response.result.code.recovery() {
            Recovery::Done => {
                self.update.complete_success(now).await;
                self.update_armed = false;
                response.deployment
            }
            Recovery::Retry => {
                self.update.complete_failure(now, true).await;
                None
            }
            Recovery::Fail => {
                self.record_protocol_failure("update-request", response.result.extended_code);
                self.update.complete_failure(now, false).await;
                None
            }
            Recovery::Reenroll => {
                self.cascade_to_enrollment();
                None
            }
        }
    }

    async fn handle_result_response(&mut self, message: &IncomingMessage, now: Instant) {
        if !correlates(&self.result, message) {
            warn!("updrslt_resp with stale or missing correlation data");
            return;
        }
        let Some(response) =
            self.checked_payload::<UpdateResultResponse>(message, "update-result", now).await
        else {
            return;
        };
        match response.result.code.recovery() {
            Recovery::Done => {
                self.result.complete_success(now).await;
                let mut pending = self.pending_reports.lock().expect("pending lock");
                pending.pop_front();
                let more = !pending.is_empty();
                drop(pending);
                if more {
                    self.result.reset();
                }
            }
            Recovery::Retry => self.result.complete_failure(now, true).await,
            Recovery::Fail => {
                self.record_protocol_failure("update-result", response.result.extended_code);
                self.result.complete_failure(now, false).await;
            }
            Recovery::Reenroll => self.cascade_to_enrollment(),
        }
    }

    // -- shared helpers -----------------------------------------------------

    /// Parse a response payload after the protocol-version gate.
    ///
    /// A version mismatch or unparseable body is a protocol/schema failure:
    /// the operation fails without retry until external state changes.
    async fn checked_payload<T: DeserializeOwned>(
        &mut self,
        message: &IncomingMessage,
        operation: &'static str,
        now: Instant,
    ) -> Option<T> {
        if !message.protocol_version_matches() {
            warn!(
                operation,
                pid = %message.protocol_version,
                "protocol version mismatch"
            );
            self.record_protocol_failure(operation, ResponseExtendedCode::ProtocolVersionMismatch);
            self.fail_operation(operation, now).await;
            return None;
        }
        match serde_json::from_slice::<T>(&message.payload) {
            Ok(payload) => Some(payload),
            Err(err) => {
                warn!(operation, %err, "unparseable response payload");
                self.record_protocol_failure(operation, ResponseExtendedCode::UnableToParse);
                self.fail_operation(operation, now).await;
                None
            }
        }
    }

    async fn fail_operation(&mut self, operation: &'static str, now: Instant) {
        match operation {
            "enrollment" => self.enrollment.complete_failure(now, false).await,
            "agent-info" => self.agent_info.complete_failure(now, false).await,
            "update-request" => self.update.complete_failure(now, false).await,
            "update-result" => self.result.complete_failure(now, false).await,
            _ => {}
        }
    }

    fn record_protocol_failure(&mut self, operation: &'static str, code: ResponseExtendedCode) {
        self.last_protocol_failure = Some(ProtocolFailure { operation, code });
    }

    /// `AgentNotEnrolled` (or a lost-enrollment notification) resets the
    /// whole ladder back to enrollment.
    fn cascade_to_enrollment(&mut self) {
        warn!("cascading back to enrollment");
        self.enrollment.reset();
        self.agent_info.reset();
        self.update.reset();
        self.result.reset();
    }
}

/// Does the message's correlation data match the operation's in-flight
/// attempt, byte for byte?
fn correlates<L: dua_retry::OperationLogic>(
    operation: &RetriableOperation<L>,
    message: &IncomingMessage,
) -> bool {
    match (message.correlation_data.as_deref(), operation.correlation_id()) {
        (Some(received), Some(expected)) => received == expected.as_bytes(),
        _ => false,
    }
}
