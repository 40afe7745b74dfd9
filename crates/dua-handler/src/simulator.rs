// SPDX-License-Identifier: MIT OR Apache-2.0
//! A content handler that simulates update work.
//!
//! Registered under `microsoft/simulator:1` by default. Every operation
//! returns a configurable result and is recorded, which is what the engine
//! tests and demo deployments need; nothing touches the OS.

use crate::context::StepContext;
use crate::{ContentHandler, HandlerAction};
use async_trait::async_trait;
use dua_core::UpdateResult;
use dua_core::result::codes;
use std::sync::Mutex;

/// Simulated outcomes per operation.
#[derive(Debug, Clone)]
pub struct SimulatorOutcomes {
    /// Result of `download`.
    pub download: UpdateResult,
    /// Result of `install`.
    pub install: UpdateResult,
    /// Result of `apply`.
    pub apply: UpdateResult,
    /// Result of `cancel`.
    pub cancel: UpdateResult,
    /// Result of `is_installed`.
    pub is_installed: UpdateResult,
}

impl Default for SimulatorOutcomes {
    fn default() -> Self {
        Self {
            download: UpdateResult::success(codes::DOWNLOAD_SUCCESS),
            install: UpdateResult::success(codes::INSTALL_SUCCESS),
            apply: UpdateResult::success(codes::APPLY_SUCCESS),
            cancel: UpdateResult::success(codes::CANCEL_SUCCESS),
            is_installed: UpdateResult::success(codes::IS_INSTALLED_NOT_INSTALLED),
        }
    }
}

/// Content handler that records invocations and replays configured results.
#[derive(Debug, Default)]
pub struct SimulatorHandler {
    outcomes: SimulatorOutcomes,
    invocations: Mutex<Vec<HandlerAction>>,
}

impl SimulatorHandler {
    /// A simulator whose every phase succeeds and whose device reports
    /// "not installed".
    #[must_use]
    pub fn succeeding() -> Self {
        Self::default()
    }

    /// A simulator whose device already satisfies the installed criteria.
    #[must_use]
    pub fn already_installed() -> Self {
        Self::with_outcomes(SimulatorOutcomes {
            is_installed: UpdateResult::success(codes::IS_INSTALLED_INSTALLED),
            ..SimulatorOutcomes::default()
        })
    }

    /// A simulator whose probe misses but whose `install` then discovers
    /// the update is already in place (races with out-of-band installs).
    #[must_use]
    pub fn already_installed_at_install() -> Self {
        Self::with_outcomes(SimulatorOutcomes {
            install: UpdateResult::success(codes::INSTALL_SKIPPED_UPDATE_ALREADY_INSTALLED),
            ..SimulatorOutcomes::default()
        })
    }

    /// A simulator with fully custom outcomes.
    #[must_use]
    pub fn with_outcomes(outcomes: SimulatorOutcomes) -> Self {
        Self {
            outcomes,
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Replace the result of one operation.
    #[must_use]
    pub fn with_result(mut self, action: HandlerAction, result: UpdateResult) -> Self {
        match action {
            HandlerAction::Download => self.outcomes.download = result,
            HandlerAction::Install => self.outcomes.install = result,
            HandlerAction::Apply => self.outcomes.apply = result,
            HandlerAction::Cancel => self.outcomes.cancel = result,
            HandlerAction::IsInstalled => self.outcomes.is_installed = result,
        }
        self
    }

    /// The operations invoked so far, in order.
    #[must_use]
    pub fn invocations(&self) -> Vec<HandlerAction> {
        self.invocations.lock().expect("simulator lock").clone()
    }

    fn record(&self, action: HandlerAction) {
        self.invocations.lock().expect("simulator lock").push(action);
    }
}

#[async_trait]
impl ContentHandler for SimulatorHandler {
    async fn download(&self, context: &StepContext) -> UpdateResult {
        self.record(HandlerAction::Download);
        if context.is_cancellation_requested() {
            return UpdateResult::cancelled();
        }
        self.outcomes.download.clone()
    }

    async fn install(&self, context: &StepContext) -> UpdateResult {
        self.record(HandlerAction::Install);
        if context.is_cancellation_requested() {
            return UpdateResult::cancelled();
        }
        self.outcomes.install.clone()
    }

    async fn apply(&self, context: &StepContext) -> UpdateResult {
        self.record(HandlerAction::Apply);
        if context.is_cancellation_requested() {
            return UpdateResult::cancelled();
        }
        self.outcomes.apply.clone()
    }

    async fn cancel(&self, _context: &StepContext) -> UpdateResult {
        self.record(HandlerAction::Cancel);
        self.outcomes.cancel.clone()
    }

    async fn is_installed(&self, _context: &StepContext) -> UpdateResult {
        self.record(HandlerAction::IsInstalled);
        self.outcomes.is_installed.clone()
    }
}
