//! A non-blocking circuit breaker plus a jittered-backoff retry loop.
//!
//! Every adapter and the outbox dispatcher wraps its calls in one of these;
//! see `wavelet_storage_core::guarded` for the combinator that ties the two
//! together around a single call.

mod breaker;
mod retry;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use retry::{retry, RetryConfig};
