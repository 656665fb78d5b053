//! Reconnection policy: per-close-code retry budgets and endpoint rotation.
//!
//! Two independent decisions are made when a connection closes:
//!
//! - [`RetryPolicy::can_retry`] - may we reconnect, and after how long?
//! - [`EndpointRotation::should_rotate`] - should the next attempt use the
//!   next endpoint in the list?
//!
//! A close code may trigger either, both, or neither.
//!
//! # Budget accounting
//!
//! The initial connection counts as attempt 1. With `max = 3` and delays
//! `[100, 200]`, the first retry waits 100ms, the second 200ms, and a third
//! is refused. Once the index runs past the table, its last entry repeats.

use std::collections::HashMap;
use std::time::Duration;

use crate::constants::NEVER_RETRY_CODES;
use crate::session::{RetryRule, SocketSettings};

/// Errors from the reconnection policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError {
    /// Rotation was requested past the end of the endpoint list.
    #[error("endpoint list exhausted at index {index} of {len}")]
    RotationExhausted {
        /// Index the rotation stayed at.
        index: usize,
        /// Number of endpoints.
        len: usize,
    },
}

/// Retry state for a single close code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryState {
    attempt_count: u32,
    max_attempts: u32,
    delays_ms: Vec<u64>,
}

impl RetryState {
    fn new(rule: &RetryRule) -> Self {
        Self {
            attempt_count: 1,
            max_attempts: rule.max,
            delays_ms: rule.times.clone(),
        }
    }

    /// Attempts made so far, the initial connection included.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// True once no further retry is allowed.
    pub fn is_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

/// Retry budgets keyed by close code.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    rules: HashMap<u16, RetryRule>,
    states: HashMap<u16, RetryState>,
}

impl RetryPolicy {
    /// Build a policy from explicit rules.
    pub fn new<I>(rules: I) -> Self
    where
        I: IntoIterator<Item = (u16, RetryRule)>,
    {
        let mut policy = Self {
            rules: rules.into_iter().collect(),
            states: HashMap::new(),
        };
        policy.reset();
        policy
    }

    /// Build a policy from server socket settings.
    ///
    /// When `close_and_retry_codes` is non-empty only those codes keep their rule.
    pub fn from_settings(settings: &SocketSettings) -> Self {
        let allowed = &settings.close_and_retry_codes;
        Self::new(
            settings
                .retries
                .iter()
                .filter(|(code, _)| allowed.is_empty() || allowed.contains(code))
                .map(|(code, rule)| (*code, rule.clone())),
        )
    }

    /// Re-seed every counter from the configured rules.
    pub fn reset(&mut self) {
        self.states = self
            .rules
            .iter()
            .map(|(code, rule)| (*code, RetryState::new(rule)))
            .collect();
    }

    /// Decide whether `code` may be retried, consuming one attempt if so.
    ///
    /// Returns the delay before reconnecting, or `None` when the code has no
    /// rule, is a protocol-level code, or its budget is spent. A refused call
    /// leaves the state untouched.
    pub fn can_retry(&mut self, code: u16) -> Option<Duration> {
        if NEVER_RETRY_CODES.contains(&code) {
            return None;
        }
        let state = self.states.get_mut(&code)?;
        if state.is_exhausted() {
            return None;
        }

        let index = (state.attempt_count as usize).saturating_sub(1);
        let delay_ms = state
            .delays_ms
            .get(index)
            .or_else(|| state.delays_ms.last())
            .copied()
            .unwrap_or(0);
        state.attempt_count += 1;
        Some(Duration::from_millis(delay_ms))
    }

    /// Current state for `code`, if it has a rule.
    pub fn state(&self, code: u16) -> Option<&RetryState> {
        self.states.get(&code)
    }
}

/// Bounded walk over the ordered endpoint list.
#[derive(Debug, Clone)]
pub struct EndpointRotation {
    endpoints: Vec<String>,
    index: usize,
    rotate_codes: Vec<u16>,
}

impl EndpointRotation {
    /// Start at the first endpoint.
    pub fn new(endpoints: Vec<String>, rotate_codes: Vec<u16>) -> Self {
        Self {
            endpoints,
            index: 0,
            rotate_codes,
        }
    }

    /// Whether `code` is configured to trigger rotation.
    pub fn should_rotate(&self, code: u16) -> bool {
        self.rotate_codes.contains(&code)
    }

    /// Advance to the next endpoint. Never wraps around.
    pub fn rotate(&mut self) -> Result<&str, RetryError> {
        if self.index + 1 >= self.endpoints.len() {
            return Err(RetryError::RotationExhausted {
                index: self.index,
                len: self.endpoints.len(),
            });
        }
        self.index += 1;
        Ok(&self.endpoints[self.index])
    }

    /// Endpoint the next dial should use.
    pub fn current(&self) -> Option<&str> {
        self.endpoints.get(self.index).map(String::as_str)
    }

    /// Index of the current endpoint.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Return to the first endpoint.
    pub fn reset(&mut self) {
        self.index = 0;
    }
}
