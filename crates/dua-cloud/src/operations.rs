// SPDX-License-Identifier: MIT OR Apache-2.0

//! The operation-logic halves of the cloud requests.
//!
//! Each logic's only job on attempt start is to enqueue an outbound request
//! carrying the attempt's correlation data; the agent loop publishes queued
//! requests and completes the operations when correlated responses arrive.

use crate::messages::{
    AgentInfoRequest, EnrollmentRequest, UpdateRequest, UpdateResultRequest, msgtype,
};
use async_trait::async_trait;
use dua_retry::{AttemptStart, OperationLogic};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// One outbound request waiting for the agent loop to publish it.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// Message type for the `mt` property.
    pub message_type: &'static str,
    /// JSON payload bytes.
    pub payload: Vec<u8>,
    /// Correlation data the response must echo.
    pub correlation_data: Vec<u8>,
    /// Defer rather than fail when the channel is down.
    pub defer_when_disconnected: bool,
}

/// Queue shared between the logics and the agent loop.
pub type OutboundQueue = Arc<Mutex<VecDeque<OutboundRequest>>>;

fn enqueue(queue: &OutboundQueue, request: OutboundRequest) {
    debug!(mt = request.message_type, "queueing outbound request");
    queue.lock().expect("outbound queue lock").push_back(request);
}

// ---------------------------------------------------------------------------
// Enrollment
// ---------------------------------------------------------------------------

/// Publishes `enr_req` per attempt.
pub struct EnrollmentLogic {
    queue: OutboundQueue,
}

impl EnrollmentLogic {
    /// Logic feeding the shared outbound queue.
    #[must_use]
    pub fn new(queue: OutboundQueue) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl OperationLogic for EnrollmentLogic {
    fn name(&self) -> &'static str {
        "enrollment"
    }

    async fn begin_attempt(&mut self, _attempt: u32, correlation_id: &str) -> AttemptStart {
        let payload = serde_json::to_vec(&EnrollmentRequest::default()).unwrap_or_default();
        enqueue(
            &self.queue,
            OutboundRequest {
                message_type: msgtype::ENR_REQ,
                payload,
                correlation_data: correlation_id.as_bytes().to_vec(),
                defer_when_disconnected: false,
            },
        );
        AttemptStart::InFlight
    }
}

// ---------------------------------------------------------------------------
// Agent info
// ---------------------------------------------------------------------------

/// Publishes `ainfo_req` carrying the current property set.
pub struct AgentInfoLogic {
    queue: OutboundQueue,
    request: AgentInfoRequest,
}

impl AgentInfoLogic {
    /// Logic advertising the given initial properties.
    #[must_use]
    pub fn new(queue: OutboundQueue, request: AgentInfoRequest) -> Self {
        Self { queue, request }
    }

    /// The property set currently advertised.
    #[must_use]
    pub fn request(&self) -> &AgentInfoRequest {
        &self.request
    }

    /// Replace the advertised properties, bumping the sequence number.
    pub fn update_request(&mut self, properties: std::collections::BTreeMap<String, String>) {
        self.request.sequence_number += 1;
        self.request.compat_properties = properties;
    }
}

#[async_trait]
impl OperationLogic for AgentInfoLogic {
    fn name(&self) -> &'static str {
        "agent-info"
    }

    async fn begin_attempt(&mut self, _attempt: u32, correlation_id: &str) -> AttemptStart {
        let payload = serde_json::to_vec(&self.request).unwrap_or_default();
        enqueue(
            &self.queue,
            OutboundRequest {
                message_type: msgtype::AINFO_REQ,
                payload,
                correlation_data: correlation_id.as_bytes().to_vec(),
                defer_when_disconnected: false,
            },
        );
        AttemptStart::InFlight
    }
}

// ---------------------------------------------------------------------------
// Update request
// ---------------------------------------------------------------------------

/// Publishes `upd_req` to pull the current deployment.
pub struct UpdateRequestLogic {
    queue: OutboundQueue,
}

impl UpdateRequestLogic {
    /// Logic feeding the shared outbound queue.
    #[must_use]
    pub fn new(queue: OutboundQueue) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl OperationLogic for UpdateRequestLogic {
    fn name(&self) -> &'static str {
        "update-request"
    }

    async fn begin_attempt(&mut self, _attempt: u32, correlation_id: &str) -> AttemptStart {
        let payload = serde_json::to_vec(&UpdateRequest::default()).unwrap_or_default();
        enqueue(
            &self.queue,
            OutboundRequest {
                message_type: msgtype::UPD_REQ,
                payload,
                correlation_data: correlation_id.as_bytes().to_vec(),
                defer_when_disconnected: false,
            },
        );
        AttemptStart::InFlight
    }
}

// ---------------------------------------------------------------------------
// Update result
// ---------------------------------------------------------------------------

/// Publishes the frontmost pending `updrslt_req`.
///
/// Result reports must survive connection loss, so these publishes are
/// deferred rather than failed when the channel is down.
pub struct UpdateResultLogic {
    queue: OutboundQueue,
    pending: Arc<Mutex<VecDeque<UpdateResultRequest>>>,
}

impl UpdateResultLogic {
    /// Logic draining the shared pending-report queue.
    #[must_use]
    pub fn new(queue: OutboundQueue, pending: Arc<Mutex<VecDeque<UpdateResultRequest>>>) -> Self {
        Self { queue, pending }
    }
}

#[async_trait]
impl OperationLogic for UpdateResultLogic {
    fn name(&self) -> &'static str {
        "update-result"
    }

    async fn begin_attempt(&mut self, _attempt: u32, correlation_id: &str) -> AttemptStart {
        let front = self
            .pending
            .lock()
            .expect("pending reports lock")
            .front()
            .cloned();
        let Some(report) = front else {
            return AttemptStart::Retry("no pending report".into());
        };
        let payload = serde_json::to_vec(&report).unwrap_or_default();
        enqueue(
            &self.queue,
            OutboundRequest {
                message_type: msgtype::UPDRSLT_REQ,
                payload,
                correlation_data: correlation_id.as_bytes().to_vec(),
                defer_when_disconnected: true,
            },
        );
        AttemptStart::InFlight
    }
}
