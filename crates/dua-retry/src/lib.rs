// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! dua-retry
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Retry tuning for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryParams {
    /// Delay before the second attempt; also the floor of every delay.
    pub initial_delay: Duration,
    /// Ceiling of every delay.
    pub max_delay: Duration,
    /// Exponential growth factor.
    pub multiplier: f64,
    /// Jitter fraction in `[0, 1]`; `0` disables jitter.
    pub jitter: f64,
    /// Maximum number of attempts; `0` means unbounded.
    pub max_attempts: u32,
    /// Deadline for a single attempt before it is retried.
    pub attempt_timeout: Duration,
    /// Deadline for the operation as a whole; `None` means unbounded.
    pub overall_timeout: Option<Duration>,
}

impl Default for RetryParams {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4 * 60),
            multiplier: 2.0,
            jitter: 1.0,
            max_attempts: 0,
            attempt_timeout: Duration::from_secs(30),
            overall_timeout: None,
        }
    }
}

/// [`backoff_delay`] with a fresh jitter draw.
#[must_use]
pub fn jittered_backoff(params: &RetryParams, attempt: u32) -> Duration {
    backoff_delay(params, attempt, fastrand::f64())
}

/// Compute the delay before attempt `attempt + 1`.
///
/// `rand01` must be in `[0, 1)`; the caller injects it so tests are
/// deterministic. The jittered exponential value is clamped into
/// `[initial_delay, max_delay]` — jitter thins the wait, it never undercuts
/// the initial delay.
#[must_use]
pub fn backoff_delay(params: &RetryParams, attempt: u32, rand01: f64) -> Duration {
    let exp = params.initial_delay.as_secs_f64() * params.multiplier.powi(attempt as i32);
    let capped = exp.min(params.max_delay.as_secs_f64());
    let jittered = capped * (1.0 - params.jitter.clamp(0.0, 1.0) * rand01.clamp(0.0, 1.0));
    let clamped = jittered
        .max(params.initial_delay.as_secs_f64())
        .min(params.max_delay.as_secs_f64());
    Duration::from_secs_f64(clamped)
}

// ---------------------------------------------------------------------------
// States and outcomes
// ---------------------------------------------------------------------------

/// Observable state of a retriable operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    /// Nothing in flight; the next `do_work` at or after
    /// `next_attempt_time` starts an attempt.
    Idle,
    /// An attempt is in flight, waiting for its completion or deadline.
    InProgress,
    /// Terminal: the operation succeeded.
    CompletedSuccess,
    /// Terminal: the operation failed and will not retry until reset.
    CompletedFailure,
    /// Terminal: the overall deadline or attempt budget was exhausted.
    Expired,
    /// Terminal: the operation was cancelled.
    Cancelled,
}

impl OperationState {
    /// `true` for the four terminal states.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompletedSuccess | Self::CompletedFailure | Self::Expired | Self::Cancelled
        )
    }
}

/// What a single attempt start reported.
#[derive(Debug)]
pub enum AttemptStart {
    /// The request is in flight; completion will be fed in externally.
    InFlight,
    /// The attempt ran to successful completion inline (operations with no
    /// response to wait for).
    Completed,
    /// The attempt could not start but a later one may succeed.
    Retry(String),
    /// The attempt failed in a way retrying cannot fix.
    Fatal(String),
}

/// Timestamps and counters the framework keeps per operation.
#[derive(Debug, Clone, Default)]
pub struct Bookkeeping {
    /// When the most recent attempt started.
    pub last_attempt_time: Option<Instant>,
    /// Earliest time the next attempt may start.
    pub next_attempt_time: Option<Instant>,
    /// When the operation last completed successfully.
    pub last_success_time: Option<Instant>,
    /// When the operation last recorded an error.
    pub last_error_time: Option<Instant>,
    /// Correlation id of the in-flight attempt.
    pub correlation_id: Option<String>,
    /// Attempts started so far.
    pub attempt_count: u32,
}

// ---------------------------------------------------------------------------
// Operation logic trait
// ---------------------------------------------------------------------------

/// The operation-specific half of a retriable operation.
///
/// Implementations publish a request (or open a connection) in
/// [`begin_attempt`](OperationLogic::begin_attempt) and are notified of
/// lifecycle transitions through the `on_*` callbacks. All calls happen on
/// the agent loop task.
#[async_trait]
pub trait OperationLogic: Send {
    /// Stable name used in logs.
    fn name(&self) -> &'static str;

    /// Start one attempt. `correlation_id` is fresh per attempt and is the
    /// value responses must echo.
    async fn begin_attempt(&mut self, attempt: u32, correlation_id: &str) -> AttemptStart;

    /// The operation completed successfully.
    async fn on_success(&mut self) {}

    /// The operation completed with a non-retriable failure.
    async fn on_failure(&mut self) {}

    /// The overall deadline or attempt budget expired.
    async fn on_expired(&mut self) {}

    /// An attempt timed out or reported a retriable failure; another attempt
    /// will be scheduled.
    async fn on_retry(&mut self) {}
}

// ---------------------------------------------------------------------------
// The driver
// ---------------------------------------------------------------------------

/// Cooperative retry driver around one [`OperationLogic`].
///
/// `do_work(now)` is cheap when there is nothing to do; the agent loop calls
/// it every tick. Completions arrive from outside (a matched response, a
/// connection event) via [`complete_success`](Self::complete_success) /
/// [`complete_failure`](Self::complete_failure).
pub struct RetriableOperation<L: OperationLogic> {
    logic: L,
    params: RetryParams,
    state: OperationState,
    book: Bookkeeping,
    started_at: Option<Instant>,
    attempt_deadline: Option<Instant>,
}

impl<L: OperationLogic> RetriableOperation<L> {
    /// Wrap `logic` with the given retry parameters.
    pub fn new(logic: L, params: RetryParams) -> Self {
        Self {
            logic,
            params,
            state: OperationState::Idle,
            book: Bookkeeping::default(),
            started_at: None,
            attempt_deadline: None,
        }
    }

    /// Current state without doing any work.
    #[must_use]
    pub fn state(&self) -> OperationState {
        self.state
    }

    /// Bookkeeping snapshot.
    #[must_use]
    pub fn bookkeeping(&self) -> &Bookkeeping {
        &self.book
    }

    /// The operation-specific logic.
    #[must_use]
    pub fn logic(&self) -> &L {
        &self.logic
    }

    /// Mutable access to the operation-specific logic.
    pub fn logic_mut(&mut self) -> &mut L {
        &mut self.logic
    }

    /// Correlation id of the attempt currently in flight, if any.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.book.correlation_id.as_deref()
    }

    /// Advance the operation. Called once per agent-loop tick.
    pub async fn do_work(&mut self, now: Instant) -> OperationState {
        if self.state.is_terminal() {
            return self.state;
        }

        if let Some(overall) = self.params.overall_timeout {
            let started = *self.started_at.get_or_insert(now);
            if now.duration_since(started) >= overall {
                warn!(op = self.logic.name(), "operation expired (overall deadline)");
                self.state = OperationState::Expired;
                self.logic.on_expired().await;
                return self.state;
            }
        }

        match self.state {
            OperationState::Idle => {
                if self.book.next_attempt_time.is_some_and(|t| now < t) {
                    return self.state;
                }
                self.start_attempt(now).await
            }
            OperationState::InProgress => {
                if self.attempt_deadline.is_some_and(|d| now >= d) {
                    debug!(op = self.logic.name(), "attempt deadline missed");
                    self.schedule_retry(now).await;
                }
                self.state
            }
            _ => self.state,
        }
    }

    /// Feed in a successful completion for the in-flight attempt.
    pub async fn complete_success(&mut self, now: Instant) {
        if self.state != OperationState::InProgress {
            return;
        }
        self.state = OperationState::CompletedSuccess;
        self.book.last_success_time = Some(now);
        self.book.correlation_id = None;
        self.attempt_deadline = None;
        self.logic.on_success().await;
    }

    /// Feed in a completion failure. `retriable` selects between scheduling
    /// another attempt and the terminal `CompletedFailure`.
    pub async fn complete_failure(&mut self, now: Instant, retriable: bool) {
        if self.state != OperationState::InProgress {
            return;
        }
        self.book.last_error_time = Some(now);
        if retriable {
            self.schedule_retry(now).await;
        } else {
            self.state = OperationState::CompletedFailure;
            self.book.correlation_id = None;
            self.attempt_deadline = None;
            self.logic.on_failure().await;
        }
    }

    /// Cancel the operation; terminal and idempotent.
    pub fn cancel(&mut self) {
        if !self.state.is_terminal() {
            self.state = OperationState::Cancelled;
            self.book.correlation_id = None;
            self.attempt_deadline = None;
        }
    }

    /// Re-arm a terminal or idle operation for a fresh run.
    ///
    /// Used when external state changes invalidate a terminal result, e.g.
    /// the service answering `AgentNotEnrolled` resets enrollment.
    pub fn reset(&mut self) {
        self.state = OperationState::Idle;
        self.book = Bookkeeping::default();
        self.started_at = None;
        self.attempt_deadline = None;
    }

    async fn start_attempt(&mut self, now: Instant) -> OperationState {
        if self.params.max_attempts != 0 && self.book.attempt_count >= self.params.max_attempts {
            warn!(op = self.logic.name(), "operation expired (attempt budget)");
            self.state = OperationState::Expired;
            self.logic.on_expired().await;
            return self.state;
        }

        let attempt = self.book.attempt_count;
        self.book.attempt_count += 1;
        self.book.last_attempt_time = Some(now);
        let correlation_id = Uuid::new_v4().to_string();
        self.book.correlation_id = Some(correlation_id.clone());

        debug!(op = self.logic.name(), attempt, %correlation_id, "starting attempt");
        match self.logic.begin_attempt(attempt, &correlation_id).await {
            AttemptStart::InFlight => {
                self.state = OperationState::InProgress;
                self.attempt_deadline = Some(now + self.params.attempt_timeout);
            }
            AttemptStart::Completed => {
                self.state = OperationState::CompletedSuccess;
                self.book.last_success_time = Some(now);
                self.book.correlation_id = None;
                self.logic.on_success().await;
            }
            AttemptStart::Retry(reason) => {
                debug!(op = self.logic.name(), %reason, "attempt not started, will retry");
                self.book.last_error_time = Some(now);
                self.schedule_retry(now).await;
            }
            AttemptStart::Fatal(reason) => {
                warn!(op = self.logic.name(), %reason, "attempt failed fatally");
                self.book.last_error_time = Some(now);
                self.state = OperationState::CompletedFailure;
                self.book.correlation_id = None;
                self.logic.on_failure().await;
            }
        }
        self.state
    }

    async fn schedule_retry(&mut self, now: Instant) {
        // attempt_count was already bumped for the attempt that failed.
        let attempt = self.book.attempt_count.saturating_sub(1);
        let delay = jittered_backoff(&self.params, attempt);
        self.book.next_attempt_time = Some(now + delay);
        self.book.correlation_id = None;
        self.attempt_deadline = None;
        self.state = OperationState::Idle;
        self.logic.on_retry().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedLogic {
        starts: Arc<AtomicU32>,
        retries: Arc<AtomicU32>,
        script: Vec<fn() -> AttemptStart>,
    }

    impl ScriptedLogic {
        fn always_in_flight(starts: Arc<AtomicU32>, retries: Arc<AtomicU32>) -> Self {
            Self {
                starts,
                retries,
                script: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl OperationLogic for ScriptedLogic {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn begin_attempt(&mut self, attempt: u32, _correlation_id: &str) -> AttemptStart {
            self.starts.fetch_add(1, Ordering::SeqCst);
            match self.script.get(attempt as usize) {
                Some(f) => f(),
                None => AttemptStart::InFlight,
            }
        }

        async fn on_retry(&mut self) {
            self.retries.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn quick_params() -> RetryParams {
        RetryParams {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts: 0,
            attempt_timeout: Duration::from_millis(50),
            overall_timeout: None,
        }
    }

    #[tokio::test]
    async fn first_attempt_starts_immediately() {
        let starts = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));
        let mut op = RetriableOperation::new(
            ScriptedLogic::always_in_flight(starts.clone(), retries),
            quick_params(),
        );
        let state = op.do_work(Instant::now()).await;
        assert_eq!(state, OperationState::InProgress);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(op.correlation_id().is_some());
    }

    #[tokio::test]
    async fn missed_attempt_deadline_schedules_retry() {
        let starts = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));
        let mut op = RetriableOperation::new(
            ScriptedLogic::always_in_flight(starts.clone(), retries.clone()),
            quick_params(),
        );
        let t0 = Instant::now();
        op.do_work(t0).await;
        // Past the per-attempt deadline: the attempt is abandoned.
        let state = op.do_work(t0 + Duration::from_millis(60)).await;
        assert_eq!(state, OperationState::Idle);
        assert_eq!(retries.load(Ordering::SeqCst), 1);
        assert!(op.correlation_id().is_none());
        // Not yet due for the next attempt.
        let state = op.do_work(t0 + Duration::from_millis(61)).await;
        assert_eq!(state, OperationState::Idle);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        // Due now.
        let state = op.do_work(t0 + Duration::from_millis(200)).await;
        assert_eq!(state, OperationState::InProgress);
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn success_is_terminal_and_sticky() {
        let starts = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));
        let mut op = RetriableOperation::new(
            ScriptedLogic::always_in_flight(starts.clone(), retries),
            quick_params(),
        );
        let t0 = Instant::now();
        op.do_work(t0).await;
        op.complete_success(t0 + Duration::from_millis(5)).await;
        assert_eq!(op.state(), OperationState::CompletedSuccess);
        assert_eq!(op.do_work(t0 + Duration::from_secs(10)).await, OperationState::CompletedSuccess);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(op.bookkeeping().last_success_time.is_some());
    }

    #[tokio::test]
    async fn non_retriable_failure_is_terminal() {
        let starts = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));
        let mut op = RetriableOperation::new(
            ScriptedLogic::always_in_flight(starts.clone(), retries),
            quick_params(),
        );
        let t0 = Instant::now();
        op.do_work(t0).await;
        op.complete_failure(t0, false).await;
        assert_eq!(op.state(), OperationState::CompletedFailure);
        assert_eq!(op.do_work(t0 + Duration::from_secs(10)).await, OperationState::CompletedFailure);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retriable_failure_backs_off_then_retries() {
        let starts = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));
        let mut op = RetriableOperation::new(
            ScriptedLogic::always_in_flight(starts.clone(), retries.clone()),
            quick_params(),
        );
        let t0 = Instant::now();
        op.do_work(t0).await;
        op.complete_failure(t0, true).await;
        assert_eq!(op.state(), OperationState::Idle);
        op.do_work(t0 + Duration::from_secs(1)).await;
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        assert_eq!(retries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempt_budget_expires_operation() {
        let starts = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));
        let params = RetryParams {
            max_attempts: 2,
            ..quick_params()
        };
        let mut op = RetriableOperation::new(
            ScriptedLogic::always_in_flight(starts.clone(), retries),
            params,
        );
        let mut t = Instant::now();
        for _ in 0..2 {
            op.do_work(t).await;
            op.complete_failure(t, true).await;
            t += Duration::from_secs(1);
        }
        assert_eq!(op.do_work(t).await, OperationState::Expired);
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn overall_deadline_expires_operation() {
        let starts = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));
        let params = RetryParams {
            overall_timeout: Some(Duration::from_secs(5)),
            ..quick_params()
        };
        let mut op = RetriableOperation::new(
            ScriptedLogic::always_in_flight(starts, retries),
            params,
        );
        let t0 = Instant::now();
        op.do_work(t0).await;
        assert_eq!(op.do_work(t0 + Duration::from_secs(6)).await, OperationState::Expired);
    }

    #[tokio::test]
    async fn fatal_attempt_start_is_terminal() {
        let starts = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));
        let logic = ScriptedLogic {
            starts: starts.clone(),
            retries,
            script: vec![|| AttemptStart::Fatal("bad request".into())],
        };
        let mut op = RetriableOperation::new(logic, quick_params());
        assert_eq!(op.do_work(Instant::now()).await, OperationState::CompletedFailure);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_attempt_start_backs_off() {
        let starts = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));
        let logic = ScriptedLogic {
            starts: starts.clone(),
            retries: retries.clone(),
            script: vec![|| AttemptStart::Retry("not connected".into())],
        };
        let mut op = RetriableOperation::new(logic, quick_params());
        let t0 = Instant::now();
        assert_eq!(op.do_work(t0).await, OperationState::Idle);
        assert_eq!(retries.load(Ordering::SeqCst), 1);
        assert_eq!(op.do_work(t0 + Duration::from_secs(1)).await, OperationState::InProgress);
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancel_is_terminal() {
        let starts = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));
        let mut op = RetriableOperation::new(
            ScriptedLogic::always_in_flight(starts, retries),
            quick_params(),
        );
        op.cancel();
        assert_eq!(op.state(), OperationState::Cancelled);
        assert_eq!(op.do_work(Instant::now()).await, OperationState::Cancelled);
    }

    #[tokio::test]
    async fn reset_rearms_a_terminal_operation() {
        let starts = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));
        let mut op = RetriableOperation::new(
            ScriptedLogic::always_in_flight(starts.clone(), retries),
            quick_params(),
        );
        let t0 = Instant::now();
        op.do_work(t0).await;
        op.complete_success(t0).await;
        op.reset();
        assert_eq!(op.state(), OperationState::Idle);
        assert_eq!(op.do_work(t0 + Duration::from_secs(1)).await, OperationState::InProgress);
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fresh_correlation_id_per_attempt() {
        let starts = Arc::new(AtomicU32::new(0));
        let retries = Arc::new(AtomicU32::new(0));
        let mut op = RetriableOperation::new(
            ScriptedLogic::always_in_flight(starts, retries),
            quick_params(),
        );
        let t0 = Instant::now();
        op.do_work(t0).await;
        let first = op.correlation_id().unwrap().to_owned();
        op.complete_failure(t0, true).await;
        op.do_work(t0 + Duration::from_secs(1)).await;
        let second = op.correlation_id().unwrap().to_owned();
        assert_ne!(first, second);
    }

    mod properties {
        use super::super::*;
        use proptest::prelude::*;

        proptest! {
            /// next_attempt_time - last_attempt_time stays within
            /// [initial_delay, max_delay] for any jitter draw and attempt.
            #[test]
            fn backoff_is_bounded(
                attempt in 0u32..40,
                rand01 in 0.0f64..1.0,
                jitter in 0.0f64..=1.0,
                initial_ms in 1u64..5_000,
                span_ms in 0u64..600_000,
                multiplier in 1.0f64..4.0,
            ) {
                let params = RetryParams {
                    initial_delay: Duration::from_millis(initial_ms),
                    max_delay: Duration::from_millis(initial_ms + span_ms),
                    multiplier,
                    jitter,
                    ..RetryParams::default()
                };
                let delay = backoff_delay(&params, attempt, rand01);
                prop_assert!(delay >= params.initial_delay);
                prop_assert!(delay <= params.max_delay);
            }

            /// With jitter off the sequence of delays is nondecreasing.
            #[test]
            fn backoff_grows_without_jitter(initial_ms in 1u64..1_000, multiplier in 1.0f64..3.0) {
                let params = RetryParams {
                    initial_delay: Duration::from_millis(initial_ms),
                    max_delay: Duration::from_secs(300),
                    multiplier,
                    jitter: 0.0,
                    ..RetryParams::default()
                };
                let mut last = Duration::ZERO;
                for attempt in 0..20 {
                    let d = backoff_delay(&params, attempt, 0.0);
                    prop_assert!(d >= last);
                    last = d;
                }
            }
        }
    }
}
