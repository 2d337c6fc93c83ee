//! Two named consecutive-failure circuit breakers: `agent` and `forge`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use branchline_common::PipelineError;

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// A single consecutive-failure breaker. `Open { opened_at }` is tracked
/// internally via `opened_at`; the public state collapses it into `Open` vs
/// `HalfOpen` once `reset_timeout_ms` has elapsed.
pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    reset_timeout: Duration,
    consecutive_failures: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
    probing: Mutex<bool>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: &CircuitBreakerConfig) -> Self {
        Self {
            name,
            failure_threshold: config.failure_threshold.max(1),
            reset_timeout: Duration::from_millis(config.reset_timeout_ms),
            consecutive_failures: AtomicU32::new(0),
            opened_at: Mutex::new(None),
            probing: Mutex::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> BreakerState {
        let opened_at = *self.opened_at.lock().unwrap();
        match opened_at {
            None => BreakerState::Closed,
            Some(at) if at.elapsed() >= self.reset_timeout => BreakerState::HalfOpen,
            Some(_) => BreakerState::Open,
        }
    }

    /// Run `f` through the breaker. Fails fast with `CircuitOpen` without
    /// invoking `f` while the breaker is open (not yet half-open).
    pub async fn call<T, Fut>(&self, f: Fut) -> Result<T, PipelineError>
    where
        Fut: std::future::Future<Output = Result<T, PipelineError>>,
    {
        match self.state() {
            BreakerState::Open => {
                return Err(PipelineError::CircuitOpen { breaker: self.name });
            }
            BreakerState::HalfOpen => {
                let mut probing = self.probing.lock().unwrap();
                if *probing {
                    return Err(PipelineError::CircuitOpen { breaker: self.name });
                }
                *probing = true;
            }
            BreakerState::Closed => {}
        }

        let result = f.await;
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => self.record_failure(),
        }
        *self.probing.lock().unwrap() = false;
        result
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        let mut opened_at = self.opened_at.lock().unwrap();
        if opened_at.is_some() {
            tracing::info!(breaker = self.name, "circuit breaker closed after successful probe");
        }
        *opened_at = None;
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let mut opened_at = self.opened_at.lock().unwrap();
        if opened_at.is_some() {
            tracing::warn!(breaker = self.name, "circuit breaker re-opened after failed probe");
            *opened_at = Some(Instant::now());
        } else if failures >= self.failure_threshold {
            tracing::warn!(
                breaker = self.name,
                failures,
                threshold = self.failure_threshold,
                "circuit breaker opened"
            );
            *opened_at = Some(Instant::now());
        }
    }
}

/// The registry of named breakers used across the Integrator and PipelineRunner.
pub struct CircuitBreakers {
    pub agent: CircuitBreaker,
    pub forge: CircuitBreaker,
}

impl CircuitBreakers {
    pub fn new(agent: &CircuitBreakerConfig, forge: &CircuitBreakerConfig) -> Self {
        Self {
            agent: CircuitBreaker::new("agent", agent),
            forge: CircuitBreaker::new("forge", forge),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, reset_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig { failure_threshold: threshold, reset_timeout_ms: reset_ms }
    }

    async fn ok() -> Result<(), PipelineError> {
        Ok(())
    }

    async fn fail() -> Result<(), PipelineError> {
        Err(PipelineError::Transient("boom".into()))
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new("agent", &config(2, 60_000));
        assert_eq!(breaker.state(), BreakerState::Closed);
        let _ = breaker.call(fail()).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
        let _ = breaker.call(fail()).await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn fails_fast_without_invoking_while_open() {
        let breaker = CircuitBreaker::new("agent", &config(1, 60_000));
        let _ = breaker.call(fail()).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        let result = breaker.call(ok()).await;
        assert!(matches!(result, Err(PipelineError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn half_open_probe_success_closes_breaker() {
        let breaker = CircuitBreaker::new("agent", &config(1, 0));
        let _ = breaker.call(fail()).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let result = breaker.call(ok()).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_probe_failure_reopens() {
        let breaker = CircuitBreaker::new("agent", &config(1, 0));
        let _ = breaker.call(fail()).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        let _ = breaker.call(fail()).await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
