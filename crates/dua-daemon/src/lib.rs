// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! dua-daemon
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Adapters bridging the crates' collaborator seams.
pub mod adapters;
/// The agent runtime and its cooperative loop.
pub mod runtime;

pub use adapters::{FsDownloader, ManifestPolicy};
pub use runtime::{AgentRuntime, RunOutcome};
