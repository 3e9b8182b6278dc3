//! Per-dependency circuit breakers.
//!
//! # Responsibilities
//! - Hand out one named breaker per dependency, created on first use
//! - Report stats for every breaker (for dashboards / CLI output)

use std::sync::Arc;

use dashmap::DashMap;

use crate::config::CircuitBreakerConfig;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitStats};

/// Registry of breakers keyed by dependency name.
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    /// Breaker for `name`, created with the default config if missing.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.value().clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(breaker = %name, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(name, self.default_config.clone()))
            })
            .value()
            .clone()
    }

    /// Register a breaker with its own config, replacing any existing one.
    pub fn register(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(name, config));
        self.breakers.insert(name.to_string(), breaker.clone());
        breaker
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|r| r.value().clone())
    }

    /// Stats for every breaker, sorted by name.
    pub fn all_stats(&self) -> Vec<CircuitStats> {
        let mut stats: Vec<_> = self.breakers.iter().map(|r| r.value().get_stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Reset every breaker to closed.
    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.value().reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::CircuitState;

    #[test]
    fn test_same_name_same_breaker() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.get_or_create("orders");
        let b = registry.get_or_create("orders");
        let c = registry.get_or_create("users");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(registry.get("missing").is_none());

        let names: Vec<_> = registry.all_stats().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["orders".to_string(), "users".to_string()]);
    }

    #[test]
    fn test_register_overrides_config() {
        let registry = CircuitBreakerRegistry::default();
        let custom = CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        };
        let breaker = registry.register("flaky", custom);
        assert_eq!(breaker.config().failure_threshold, 1);
        assert_eq!(registry.get_or_create("flaky").config().failure_threshold, 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
