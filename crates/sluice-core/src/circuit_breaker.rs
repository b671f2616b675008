//! Circuit breaker for the control-plane transport.
//!
//! After repeated transport failures the breaker opens and requests fail
//! fast with [`TransportError::CircuitOpen`] until the reset timeout lets a
//! probe request through.

use crate::config::CircuitBreakerSettings;
use crate::error::{Error, TransportError};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    /// Requests proceed normally
    Closed,
    /// Requests are rejected without being sent
    Open,
    /// Probe requests are allowed through
    HalfOpen,
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening the circuit
    pub failure_threshold: u32,

    /// Duration to wait before attempting to close (half-open)
    pub reset_timeout: Duration,

    /// Number of successes required to close from half-open
    pub success_threshold: u32,

    /// Name for logging
    pub name: String,
}

impl CircuitBreakerConfig {
    /// Create a configuration from file settings.
    pub fn from_settings(name: impl Into<String>, settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            reset_timeout: Duration::from_secs(settings.reset_timeout_seconds),
            success_threshold: settings.success_threshold.max(1),
            name: name.into(),
        }
    }

    /// Set failure threshold.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set reset timeout.
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set success threshold.
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }
}

struct CircuitBreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
}

/// Circuit breaker guarding control-plane calls.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<CircuitBreakerState>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        debug!(name = %config.name, "Circuit breaker created");
        Self {
            config,
            state: Mutex::new(CircuitBreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
            }),
        }
    }

    /// Check if the circuit allows requests.
    pub fn is_allowed(&self) -> bool {
        let mut state = self.state.lock();

        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let expired = state
                    .last_failure_time
                    .is_some_and(|t| t.elapsed() >= self.config.reset_timeout);
                if expired {
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                    info!(name = %self.config.name, "Circuit breaker transitioning to half-open");
                }
                expired
            }
        }
    }

    /// Record a successful operation.
    pub fn record_success(&self) {
        let mut state = self.state.lock();

        match state.state {
            CircuitState::Closed | CircuitState::Open => {
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    info!(name = %self.config.name, "Circuit breaker closed (recovered)");
                }
            }
        }
    }

    /// Record a failed operation.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.failure_count += 1;
        state.last_failure_time = Some(Instant::now());

        match state.state {
            CircuitState::Closed if state.failure_count >= self.config.failure_threshold => {
                state.state = CircuitState::Open;
                warn!(
                    name = %self.config.name,
                    failures = state.failure_count,
                    "Circuit breaker opened due to failures"
                );
            }
            CircuitState::Closed | CircuitState::Open => {
                debug!(
                    name = %self.config.name,
                    failures = state.failure_count,
                    "Circuit breaker recorded failure"
                );
            }
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
                state.success_count = 0;
                warn!(name = %self.config.name, "Circuit breaker reopened from half-open state");
            }
        }
    }

    /// Get the current state.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Get the failure count.
    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// Execute a control-plane call with circuit breaker protection.
    ///
    /// Only failures of the service itself count against the breaker:
    /// request errors and 5xx responses. Client errors (4xx) and decode
    /// failures are passed through without tripping it.
    pub async fn execute<F, Fut, T>(&self, f: F) -> crate::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = crate::Result<T>>,
    {
        if !self.is_allowed() {
            return Err(Error::Transport(TransportError::CircuitOpen));
        }

        let result = f().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(Error::Transport(TransportError::Request { .. })) => self.record_failure(),
            Err(Error::Transport(TransportError::Http { status, .. })) if *status >= 500 => {
                self.record_failure()
            }
            Err(_) => self.record_success(),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::from_settings("test", &CircuitBreakerSettings::default())
    }

    fn request_error() -> Error {
        Error::Transport(TransportError::Request {
            endpoint: "/v1/streaming/channels/open/".into(),
            message: "connection refused".into(),
        })
    }

    #[test]
    fn test_from_settings() {
        let config = config();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.reset_timeout, Duration::from_secs(30));
        assert_eq!(config.success_threshold, 2);
    }

    #[test]
    fn test_circuit_breaker_opens_after_failures() {
        let cb = CircuitBreaker::new(config().with_failure_threshold(3));

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.is_allowed());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.is_allowed());
    }

    #[test]
    fn test_circuit_breaker_success_resets_failures() {
        let cb = CircuitBreaker::new(config().with_failure_threshold(3));

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.failure_count(), 2);

        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_circuit_breaker_recovers_through_half_open() {
        let cb = CircuitBreaker::new(
            config()
                .with_failure_threshold(2)
                .with_reset_timeout(Duration::from_millis(10))
                .with_success_threshold(2),
        );

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.is_allowed());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_circuit_breaker_reopens_from_half_open_on_failure() {
        let cb = CircuitBreaker::new(
            config()
                .with_failure_threshold(2)
                .with_reset_timeout(Duration::from_millis(10)),
        );

        cb.record_failure();
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(15));
        cb.is_allowed();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_execute_counts_only_service_failures() {
        let cb = CircuitBreaker::new(config().with_failure_threshold(2));

        let result: crate::Result<()> = cb
            .execute(|| async {
                Err(Error::Transport(TransportError::Http {
                    endpoint: "/x".into(),
                    status: 400,
                    body: "bad request".into(),
                }))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(cb.failure_count(), 0);

        let _ = cb.execute(|| async { Err::<(), _>(request_error()) }).await;
        let _ = cb.execute(|| async { Err::<(), _>(request_error()) }).await;
        assert_eq!(cb.state(), CircuitState::Open);

        let err = cb.execute(|| async { Ok(42) }).await.unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::CircuitOpen)));
    }
}
