//! Fuzz target for retry decisions and group collection.
//!
//! Arbitrary failure sequences must never push the attempt counter past
//! `max_attempts`, and draining a queue must hand out every item once.

#![no_main]

use libfuzzer_sys::fuzz_target;
use request_engine::config::RetryConfig;
use request_engine::processor::take_group;
use request_engine::{ErrorKind, OperationKind, RetryPolicy, RetryState, ServiceError};
use std::collections::VecDeque;

const KINDS: [ErrorKind; 7] = [
    ErrorKind::Competition,
    ErrorKind::Deadlock,
    ErrorKind::Timeout,
    ErrorKind::Network,
    ErrorKind::Authorization,
    ErrorKind::BusinessRule,
    ErrorKind::UnexpectedResult,
];

fuzz_target!(|data: (u8, u8, Vec<u8>)| {
    let (max, throughput, failures) = data;

    let policy = RetryPolicy::new(RetryConfig {
        max_attempts: u32::from(max % 16),
        ..RetryConfig::default()
    });
    let mut state = RetryState::default();
    for byte in &failures {
        let kind = KINDS[usize::from(*byte) % KINDS.len()];
        let operation = if byte & 0x80 == 0 {
            OperationKind::Transactional
        } else {
            OperationKind::Idempotent
        };
        policy.evaluate(&mut state, &ServiceError::new(kind, "fuzz"), operation);
        assert!(state.attempts() <= policy.config().max_attempts);
    }

    let mut pending: VecDeque<u8> = failures.iter().copied().collect();
    let mut drained = Vec::with_capacity(pending.len());
    while let Some(group) = take_group(&mut pending, usize::from(throughput), true) {
        assert!(group.len() <= usize::from(throughput).max(1));
        drained.extend(group);
    }
    assert_eq!(drained, failures);
});
