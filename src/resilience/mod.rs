//! Circuit breakers prevent cascading failures by failing fast when a
//! target is known to be unhealthy, giving it time to recover.
//!
//! States:
//! - CLOSED: normal operation, requests pass through
//! - OPEN: failures exceeded the threshold, requests rejected immediately
//! - HALF_OPEN: testing recovery, a bounded number of probes admitted
//!
//! The OPEN -> HALF_OPEN transition is observed lazily through the `state`
//! accessor based on wall-clock elapsed time; there is no background timer.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures before opening
    pub failure_threshold: u32,
    /// Time before trying half-open
    pub recovery_timeout: Duration,
    /// Probes allowed in half-open state
    pub half_open_max_calls: u32,
    /// Successes needed to close from half-open
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
            success_threshold: 1,
        }
    }
}

/// Point-in-time statistics for a circuit breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Unix timestamps in seconds
    pub last_failure_time: Option<f64>,
    pub last_success_time: Option<f64>,
    pub total_failures: u64,
    pub total_successes: u64,
    pub times_opened: u64,
}

struct BreakerInner {
    /// Stored state; `effective_state` may report HALF_OPEN while this is
    /// still OPEN, until a recorded outcome materializes the transition
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
    last_failure_time: Option<f64>,
    last_success_time: Option<f64>,
    total_failures: u64,
    total_successes: u64,
    times_opened: u64,
    half_open_calls: u32,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            last_failure_time: None,
            last_success_time: None,
            total_failures: 0,
            total_successes: 0,
            times_opened: 0,
            half_open_calls: 0,
        }
    }
}

/// Circuit breaker for a single target.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn effective_state(&self, inner: &BreakerInner) -> CircuitState {
        if inner.state == CircuitState::Open {
            if let Some(at) = inner.last_failure_at {
                if at.elapsed() >= self.config.recovery_timeout {
                    return CircuitState::HalfOpen;
                }
            }
        }
        inner.state
    }

    /// Current state, accounting for the time-based OPEN -> HALF_OPEN
    /// transition.
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        self.effective_state(&inner)
    }

    /// Check whether a request is admitted.
    ///
    /// Returns [`Error::CircuitOpen`] when the circuit is open, carrying the
    /// seconds remaining until recovery, or when the half-open probe budget
    /// is exhausted.
    pub fn check(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        match self.effective_state(&inner) {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let retry_after = inner.last_failure_at.map(|at| {
                    (self.config.recovery_timeout.as_secs_f64() - at.elapsed().as_secs_f64())
                        .max(0.0)
                });
                Err(Error::CircuitOpen {
                    name: self.name.clone(),
                    state: CircuitState::Open,
                    retry_after,
                })
            },
            CircuitState::HalfOpen => {
                if inner.half_open_calls >= self.config.half_open_max_calls {
                    return Err(Error::CircuitOpen {
                        name: self.name.clone(),
                        state: CircuitState::HalfOpen,
                        retry_after: None,
                    });
                }
                inner.half_open_calls += 1;
                Ok(())
            },
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        let state = self.effective_state(&inner);

        inner.success_count += 1;
        inner.total_successes += 1;
        inner.last_success_time = Some(now_secs());

        if state == CircuitState::HalfOpen && inner.success_count >= self.config.success_threshold
        {
            self.transition_to(&mut inner, CircuitState::Closed);
            info!("Circuit '{}' closed after recovery", self.name);
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let state = self.effective_state(&inner);

        inner.failure_count += 1;
        inner.total_failures += 1;
        inner.last_failure_at = Some(Instant::now());
        inner.last_failure_time = Some(now_secs());

        match state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    let failures = inner.failure_count;
                    self.transition_to(&mut inner, CircuitState::Open);
                    warn!("Circuit '{}' opened after {} failures", self.name, failures);
                }
            },
            CircuitState::HalfOpen => {
                // Any failure in half-open goes back to open
                self.transition_to(&mut inner, CircuitState::Open);
                warn!("Circuit '{}' reopened after failure in half-open", self.name);
            },
            CircuitState::Open => {},
        }
    }

    fn transition_to(&self, inner: &mut BreakerInner, new_state: CircuitState) {
        let old_state = inner.state;
        inner.state = new_state;

        match new_state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = 0;
                inner.half_open_calls = 0;
            },
            CircuitState::Open => {
                inner.times_opened += 1;
                inner.half_open_calls = 0;
            },
            CircuitState::HalfOpen => {
                inner.success_count = 0;
                inner.half_open_calls = 0;
            },
        }

        debug!(
            "Circuit '{}' transitioned: {} -> {}",
            self.name, old_state, new_state
        );
    }

    /// Reset to the closed state with zeroed counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        *inner = BreakerInner::new();
        info!("Circuit '{}' reset", self.name);
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            state: self.effective_state(&inner),
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_time: inner.last_failure_time,
            last_success_time: inner.last_success_time,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            times_opened: inner.times_opened,
        }
    }
}

fn now_secs() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Registry keeping one circuit breaker per target name.
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

    /// Get or lazily create the breaker for a target.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("Created circuit breaker for '{}'", name);
                Arc::new(CircuitBreaker::new(name, self.default_config.clone()))
            })
            .clone()
    }

    /// Statistics for every known breaker.
    pub fn all_stats(&self) -> HashMap<String, CircuitBreakerStats> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    /// Reset a specific breaker; false if it was never created.
    pub fn reset(&self, name: &str) -> bool {
        match self.breakers.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            },
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_millis(100),
            half_open_max_calls: 1,
            success_threshold: 1,
        }
    }

    #[test]
    fn opens_at_exactly_the_failure_threshold() {
        let breaker = CircuitBreaker::new("test", fast_config());

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.check().is_ok());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = breaker.check().unwrap_err();
        match err {
            Error::CircuitOpen {
                state, retry_after, ..
            } => {
                assert_eq!(state, CircuitState::Open);
                assert!(retry_after.unwrap() > 0.0);
            },
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn full_recovery_cycle() {
        let breaker = CircuitBreaker::new("test", fast_config());

        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        sleep(Duration::from_millis(150)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // Exactly one probe is admitted
        assert!(breaker.check().is_ok());
        assert!(matches!(
            breaker.check(),
            Err(Error::CircuitOpen {
                state: CircuitState::HalfOpen,
                ..
            })
        ));

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);

        let stats = breaker.stats();
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 0);
        assert!(breaker.check().is_ok());
    }

    #[tokio::test]
    async fn failure_in_half_open_reopens() {
        let breaker = CircuitBreaker::new("test", fast_config());

        for _ in 0..3 {
            breaker.record_failure();
        }
        sleep(Duration::from_millis(150)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(breaker.check().is_ok());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.check().is_err());
    }

    #[test]
    fn totals_survive_transitions() {
        let breaker = CircuitBreaker::new("test", fast_config());

        for _ in 0..5 {
            breaker.record_failure();
        }
        let stats = breaker.stats();
        assert_eq!(stats.total_failures, 5);
        assert!(stats.total_failures >= stats.failure_count as u64);
        assert_eq!(stats.times_opened, 1);
    }

    #[test]
    fn reset_returns_to_closed() {
        let breaker = CircuitBreaker::new("test", fast_config());

        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(breaker.check().is_err());

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.check().is_ok());

        let stats = breaker.stats();
        assert_eq!(stats.total_failures, 0);
        assert_eq!(stats.times_opened, 0);
    }

    #[test]
    fn registry_isolates_targets() {
        let registry = CircuitBreakerRegistry::default();

        for _ in 0..3 {
            registry.get("backend1").record_failure();
        }

        assert!(registry.get("backend1").check().is_err());
        assert!(registry.get("backend2").check().is_ok());

        assert!(registry.reset("backend1"));
        assert!(registry.get("backend1").check().is_ok());
        assert!(!registry.reset("unknown"));

        let stats = registry.all_stats();
        assert_eq!(stats.len(), 2);
    }
}
