use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use wavelet_breaker::{BreakerConfig, CircuitBreaker, CircuitState};

/// Process-wide breaker instances keyed by adapter/service name, so
/// `/readyz` and metrics can report per-adapter state without every call
/// site constructing and owning its own breaker.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(config)))
            .clone()
    }

    /// Snapshot of every registered breaker's state, for `/readyz` and
    /// diagnostics. Order is unspecified.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        self.breakers
            .lock()
            .unwrap()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.state()))
            .collect()
    }

    pub fn any_open(&self) -> bool {
        self.breakers
            .lock()
            .unwrap()
            .values()
            .any(|b| b.state() == CircuitState::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_the_same_breaker_for_a_repeated_name() {
        let registry = CircuitBreakerRegistry::new();
        let a = registry.get_or_create("record:tenant-a", BreakerConfig::default());
        let b = registry.get_or_create("record:tenant-a", BreakerConfig::default());
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn distinct_names_get_distinct_breakers() {
        let registry = CircuitBreakerRegistry::new();
        let a = registry.get_or_create("record:tenant-a", BreakerConfig::default());
        let b = registry.get_or_create("stream:messages", BreakerConfig::default());
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(registry.snapshot().len(), 2);
    }
}
