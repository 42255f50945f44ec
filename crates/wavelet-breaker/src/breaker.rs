use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::time::Duration;

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl From<u8> for CircuitState {
    fn from(v: u8) -> Self {
        match v {
            OPEN => CircuitState::Open,
            HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// A closed/open/half-open circuit breaker whose hot path (`should_allow`,
/// `record_success`, `record_failure`) never takes a lock: state lives in a
/// handful of atomics, and the open-to-half-open transition is a single CAS.
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: AtomicU8,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    opened_at_millis: AtomicI64,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(CLOSED),
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            opened_at_millis: AtomicI64::new(0),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.load(Ordering::Acquire).into()
    }

    /// Answers yes/no without blocking. In `Open`, atomically flips to
    /// `HalfOpen` the first time a caller observes the reset timeout has
    /// elapsed, so exactly one concurrent caller drives the transition but
    /// every caller still gets an immediate answer.
    pub fn should_allow(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            CLOSED => true,
            HALF_OPEN => true,
            _ => {
                let opened_at = self.opened_at_millis.load(Ordering::Acquire);
                let deadline = opened_at + self.config.reset_timeout.as_millis() as i64;
                if now_millis() < deadline {
                    return false;
                }
                // Whoever wins this CAS is the one to start the half-open probe;
                // losers still get `true` back since the deadline has passed.
                if self
                    .state
                    .compare_exchange(OPEN, HALF_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.success_count.store(0, Ordering::Relaxed);
                }
                true
            }
        }
    }

    pub fn record_success(&self) {
        match self.state.load(Ordering::Acquire) {
            HALF_OPEN => {
                let successes = self.success_count.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold {
                    self.state.store(CLOSED, Ordering::Release);
                    self.failure_count.store(0, Ordering::Relaxed);
                    self.success_count.store(0, Ordering::Relaxed);
                }
            }
            _ => self.failure_count.store(0, Ordering::Relaxed),
        }
    }

    pub fn record_failure(&self) {
        match self.state.load(Ordering::Acquire) {
            HALF_OPEN => {
                // Any failure while probing reopens immediately.
                self.opened_at_millis.store(now_millis(), Ordering::Release);
                self.state.store(OPEN, Ordering::Release);
                self.success_count.store(0, Ordering::Relaxed);
            }
            _ => {
                let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.opened_at_millis.store(now_millis(), Ordering::Release);
                    self.state.store(OPEN, Ordering::Release);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, success_threshold: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold,
            success_threshold,
            reset_timeout: Duration::from_millis(reset_ms),
        })
    }

    #[test]
    fn opens_after_failure_threshold() {
        let b = breaker(3, 1, 10_000);
        assert!(b.should_allow());
        b.record_failure();
        b.record_failure();
        assert!(b.should_allow());
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.should_allow());
    }

    #[test]
    fn half_open_success_closes_and_failure_reopens() {
        let b = breaker(1, 1, 0); // resets immediately for the test
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(b.should_allow()); // reset elapsed instantly -> half-open
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);

        b.record_failure();
        assert!(b.should_allow());
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.record_failure();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn success_in_closed_state_resets_failure_count() {
        let b = breaker(3, 1, 10_000);
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        // Would be open at 3 consecutive failures; the reset means we're still at 2.
        assert_eq!(b.state(), CircuitState::Closed);
    }
}
