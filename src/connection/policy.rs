//! Pure retry policy and connect-error classification
//!
//! Nothing in here touches the network or a clock; the manager feeds attempt
//! counts and error messages in and acts on the decisions that come out.

use crate::config::TokenRefreshSection;
use rand::Rng;
use std::time::Duration;

/// Backoff policy for the token-refresh retry flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectionPolicy {
    /// Refresh attempts allowed before giving up
    pub max_attempts: u32,
    /// Delay before the first attempt, doubled per attempt
    pub base_delay_ms: u64,
    /// Upper bound of the random jitter added to each delay
    pub max_jitter_ms: u64,
    /// Hard cap on any single delay, jitter included
    pub max_delay_ms: u64,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_jitter_ms: 200,
            max_delay_ms: 5000,
        }
    }
}

/// Decision for the next refresh attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Proceed { attempt: u32, delay: Duration },
    Exhausted,
}

impl ReconnectionPolicy {
    pub fn from_config(section: &TokenRefreshSection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            base_delay_ms: section.base_delay_ms,
            max_jitter_ms: section.max_jitter_ms,
            max_delay_ms: section.max_delay_ms,
        }
    }

    /// `min(base * 2^(attempt-1) + jitter, max)`; attempt 0 is treated as 1
    pub fn delay_with_jitter(&self, attempt: u32, jitter_ms: u64) -> Duration {
        let exponent = attempt.max(1) - 1;
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let raw = self
            .base_delay_ms
            .saturating_mul(factor)
            .saturating_add(jitter_ms);
        Duration::from_millis(raw.min(self.max_delay_ms))
    }

    /// Delay for the given attempt with a random jitter in `[0, max_jitter_ms]`
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let jitter = if self.max_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.max_jitter_ms)
        };
        self.delay_with_jitter(attempt, jitter)
    }

    /// Decide whether another attempt may run after `attempts_so_far`
    pub fn decide(&self, attempts_so_far: u32) -> RetryDecision {
        if attempts_so_far >= self.max_attempts {
            return RetryDecision::Exhausted;
        }
        let attempt = attempts_so_far + 1;
        RetryDecision::Proceed {
            attempt,
            delay: self.next_delay(attempt),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".to_string());
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err("base_delay_ms must not exceed max_delay_ms".to_string());
        }
        Ok(())
    }
}

/// How a transport connect error should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    /// Recoverable through the refresh flow
    TokenExpired,
    /// Credentials rejected; retrying cannot succeed
    Unauthorized,
    /// Left to the transport's own reconnection
    Network,
}

const EXPIRED_MARKERS: &[&str] = &["jwt expired", "token expired"];
const UNAUTHORIZED_MARKERS: &[&str] = &[
    "unauthorized",
    "invalid token",
    "invalid signature",
    "401",
    "authentication",
];

impl ConnectErrorKind {
    pub fn classify(message: &str) -> Self {
        let lowered = message.to_lowercase();
        if EXPIRED_MARKERS.iter().any(|m| lowered.contains(m)) {
            ConnectErrorKind::TokenExpired
        } else if UNAUTHORIZED_MARKERS.iter().any(|m| lowered.contains(m)) {
            ConnectErrorKind::Unauthorized
        } else {
            ConnectErrorKind::Network
        }
    }
}
