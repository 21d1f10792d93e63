//! Retry policy for remote submissions.
//!
//! The policy is a pure decision over `(error kind, attempts so far,
//! operation kind)`. Checks run in a fixed order:
//!
//! 1. attempts ≥ `max_attempts` → give up
//! 2. transactional operation failing with an ambiguous-write kind
//!    (competition, deadlock, timeout) → give up without retrying
//! 3. non-transient kind (authorization, business rule, unexpected result)
//!    → give up
//! 4. otherwise pick the delay from the stage table, bump the attempt
//!    counter and retry
//!
//! # Example
//!
//! ```rust
//! use request_engine::config::RetryConfig;
//! use request_engine::error::ServiceError;
//! use request_engine::resilience::{OperationKind, RetryDecision, RetryPolicy, RetryState};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(RetryConfig::default());
//! let mut state = RetryState::default();
//!
//! let err = ServiceError::network("connection reset");
//! let decision = policy.evaluate(&mut state, &err, OperationKind::Idempotent);
//! assert_eq!(decision, RetryDecision::Retry(Duration::from_secs(10)));
//! assert_eq!(state.attempts(), 1);
//! ```

use crate::config::RetryConfig;
use crate::error::ServiceError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Whether a repeated request can cause duplicate effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Non-idempotent write. Never retried after an ambiguous failure.
    #[default]
    Transactional,
    /// Reads and writes that are safe to repeat.
    Idempotent,
}

impl OperationKind {
    pub fn is_transactional(&self) -> bool {
        matches!(self, Self::Transactional)
    }
}

/// Outcome of one policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait for the delay, then try again.
    Retry(Duration),
    /// Stop and surface the error.
    GiveUp,
}

/// Per-operation retry bookkeeping. Discard after the operation ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    attempts: u32,
    last_delay: Option<Duration>,
}

impl RetryState {
    /// Retries granted so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay handed out by the most recent retry decision.
    pub fn last_delay(&self) -> Option<Duration> {
        self.last_delay
    }
}

/// Staged-backoff retry policy.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Decide what to do after `error`. Mutates `state` only on retry.
    pub fn evaluate(
        &self,
        state: &mut RetryState,
        error: &ServiceError,
        operation: OperationKind,
    ) -> RetryDecision {
        if state.attempts >= self.config.max_attempts {
            return RetryDecision::GiveUp;
        }
        if operation.is_transactional() && error.kind.is_ambiguous_write() {
            return RetryDecision::GiveUp;
        }
        if !error.kind.is_transient() {
            return RetryDecision::GiveUp;
        }

        let delay = self.config.delay_for_attempt(state.attempts);
        state.attempts += 1;
        state.last_delay = Some(delay);
        RetryDecision::Retry(delay)
    }

    /// Drive `f` until it succeeds or the policy gives up.
    ///
    /// Returns the last error on give-up.
    pub async fn run<T, F, Fut>(&self, operation: OperationKind, mut f: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut state = RetryState::default();
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(error) => match self.evaluate(&mut state, &error, operation) {
                    RetryDecision::Retry(delay) => {
                        self.log_retry(&state, &error, delay);
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::GiveUp => {
                        debug!(kind = %error.kind, attempts = state.attempts, "Giving up");
                        return Err(error);
                    }
                },
            }
        }
    }

    /// Blocking twin of [`run`](Self::run). Sleeps the calling thread.
    pub fn run_blocking<T, F>(&self, operation: OperationKind, mut f: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> Result<T, ServiceError>,
    {
        let mut state = RetryState::default();
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(error) => match self.evaluate(&mut state, &error, operation) {
                    RetryDecision::Retry(delay) => {
                        self.log_retry(&state, &error, delay);
                        std::thread::sleep(delay);
                    }
                    RetryDecision::GiveUp => {
                        debug!(kind = %error.kind, attempts = state.attempts, "Giving up");
                        return Err(error);
                    }
                },
            }
        }
    }

    fn log_retry(&self, state: &RetryState, error: &ServiceError, delay: Duration) {
        warn!(
            kind = %error.kind,
            attempt = state.attempts,
            max_attempts = self.config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error.message,
            "Transient failure, retrying"
        );
        crate::metrics::record_retry(error.kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig::default())
    }

    #[test]
    fn test_staged_delays_for_idempotent() {
        let policy = policy();
        let mut state = RetryState::default();
        let err = ServiceError::network("reset");

        let expected = [10, 15, 30];
        for secs in expected {
            assert_eq!(
                policy.evaluate(&mut state, &err, OperationKind::Idempotent),
                RetryDecision::Retry(Duration::from_secs(secs))
            );
        }
        assert_eq!(state.attempts(), 3);
        assert_eq!(state.last_delay(), Some(Duration::from_secs(30)));

        // max_attempts reached
        assert_eq!(
            policy.evaluate(&mut state, &err, OperationKind::Idempotent),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_breakdown_stage_is_fixed() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 10,
            ..Default::default()
        });
        let mut state = RetryState::default();
        let err = ServiceError::deadlock("victim");

        let mut delays = Vec::new();
        while let RetryDecision::Retry(d) = policy.evaluate(&mut state, &err, OperationKind::Idempotent) {
            delays.push(d.as_secs());
        }
        assert_eq!(delays, vec![10, 15, 30, 90, 90, 90, 90, 90, 90, 90]);
    }

    #[test]
    fn test_transactional_ambiguous_gives_up_immediately() {
        let policy = policy();
        for kind in [ErrorKind::Competition, ErrorKind::Deadlock, ErrorKind::Timeout] {
            let mut state = RetryState::default();
            let err = ServiceError::new(kind, "ambiguous");
            assert_eq!(
                policy.evaluate(&mut state, &err, OperationKind::Transactional),
                RetryDecision::GiveUp,
                "kind {kind} should not retry a transactional write"
            );
            assert_eq!(state.attempts(), 0);
            assert_eq!(state.last_delay(), None);
        }
    }

    #[test]
    fn test_transactional_network_still_retries() {
        let policy = policy();
        let mut state = RetryState::default();
        let err = ServiceError::network("dns");
        assert_eq!(
            policy.evaluate(&mut state, &err, OperationKind::Transactional),
            RetryDecision::Retry(Duration::from_secs(10))
        );
    }

    #[test]
    fn test_fatal_kinds_give_up() {
        let policy = policy();
        for kind in [
            ErrorKind::Authorization,
            ErrorKind::BusinessRule,
            ErrorKind::UnexpectedResult,
        ] {
            let mut state = RetryState::default();
            assert_eq!(
                policy.evaluate(&mut state, &ServiceError::new(kind, "fatal"), OperationKind::Idempotent),
                RetryDecision::GiveUp
            );
        }
    }

    #[test]
    fn test_zero_max_attempts_never_retries() {
        let policy = RetryPolicy::new(RetryConfig::no_retry());
        let mut state = RetryState::default();
        assert_eq!(
            policy.evaluate(&mut state, &ServiceError::network("x"), OperationKind::Idempotent),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn test_operation_kind_default_is_transactional() {
        assert_eq!(OperationKind::default(), OperationKind::Transactional);
        assert!(OperationKind::Transactional.is_transactional());
        assert!(!OperationKind::Idempotent.is_transactional());
    }

    #[tokio::test]
    async fn test_run_retries_until_success() {
        let policy = RetryPolicy::new(RetryConfig::testing());
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result = policy
            .run(OperationKind::Idempotent, move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ServiceError::network("flaky"))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_returns_last_error() {
        let policy = RetryPolicy::new(RetryConfig::testing());
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result: Result<(), _> = policy
            .run(OperationKind::Idempotent, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::timeout("slow"))
            })
            .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::Timeout);
        // initial attempt + max_attempts retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_run_blocking_fatal_single_call() {
        let policy = RetryPolicy::new(RetryConfig::testing());
        let mut calls = 0;

        let result: Result<(), _> = policy.run_blocking(OperationKind::Idempotent, || {
            calls += 1;
            Err(ServiceError::business_rule("bad"))
        });

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
