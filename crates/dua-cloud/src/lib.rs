// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! dua-cloud
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The ordered-operation coordinator.
pub mod client;
/// Wire payload models and response codes.
pub mod messages;
/// Operation logics and the outbound queue.
pub mod operations;

pub use client::{CloudClient, EnrollmentState, ProtocolFailure};
pub use messages::{
    AgentInfoRequest, DeploymentPayload, EnrollmentResponse, Recovery, ResponseCode,
    ResponseExtendedCode, ResponseResult, UpdateResponse, UpdateResultRequest, WorkflowRef, msgtype,
};
pub use operations::{OutboundQueue, OutboundRequest};
