//! Circuit Breaker
//!
//! Per-dependency failure isolator. State is intentionally process-local:
//! each instance protects only its own outbound calls, so instances may
//! disagree about a dependency's health during partial outages.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::BreakerSettings;
use crate::infrastructure::metrics;
use crate::shared::error::GatewayError;

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The circuit is open; the wrapped call was not invoked.
    #[error("circuit '{dependency}' open, retry in {retry_in:?}")]
    Open {
        dependency: String,
        retry_in: Duration,
    },

    /// The wrapped call ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl From<BreakerError<GatewayError>> for GatewayError {
    fn from(err: BreakerError<GatewayError>) -> Self {
        match err {
            BreakerError::Open {
                dependency,
                retry_in,
            } => GatewayError::CircuitOpen {
                dependency,
                retry_in,
            },
            BreakerError::Inner(inner) => inner,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Failure timestamps inside the rolling monitoring window
    failures: Vec<Instant>,
    next_attempt_at: Option<Instant>,
    half_open_successes: u32,
    /// Exactly one probe may be in flight while half-open
    probe_in_flight: bool,
}

/// Three-state circuit breaker guarding one external dependency.
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
}

enum Admission {
    Regular,
    Probe,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        let name = name.into();
        metrics::set_circuit_state(&name, CircuitState::Closed);
        Self {
            name,
            settings,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: Vec::new(),
                next_attempt_at: None,
                half_open_successes: 0,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Run `op` under the breaker.
    ///
    /// Fast-fails with [`BreakerError::Open`] without invoking `op` while
    /// the circuit is open (or while another half-open probe is in
    /// flight). Otherwise runs `op` and records the outcome.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit()?;
        let is_probe = matches!(admission, Admission::Probe);

        match op().await {
            Ok(value) => {
                self.on_success(is_probe);
                Ok(value)
            }
            Err(err) => {
                self.on_failure(is_probe);
                Err(BreakerError::Inner(err))
            }
        }
    }

    fn admit<E>(&self) -> Result<Admission, BreakerError<E>> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        match inner.state {
            CircuitState::Closed => Ok(Admission::Regular),
            CircuitState::Open => {
                let next_attempt = inner.next_attempt_at.unwrap_or(now);
                if now >= next_attempt {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.probe_in_flight = true;
                    metrics::set_circuit_state(&self.name, CircuitState::HalfOpen);
                    debug!(dependency = %self.name, "Circuit half-open, probing");
                    Ok(Admission::Probe)
                } else {
                    Err(BreakerError::Open {
                        dependency: self.name.clone(),
                        retry_in: next_attempt.saturating_duration_since(now),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(BreakerError::Open {
                        dependency: self.name.clone(),
                        retry_in: Duration::from_millis(100),
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
        }
    }

    fn on_success(&self, is_probe: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                self.prune_failures(&mut inner);
            }
            CircuitState::HalfOpen => {
                if is_probe {
                    inner.probe_in_flight = false;
                }
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.settings.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failures.clear();
                    inner.next_attempt_at = None;
                    inner.half_open_successes = 0;
                    metrics::set_circuit_state(&self.name, CircuitState::Closed);
                    debug!(dependency = %self.name, "Circuit closed after probe successes");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, is_probe: bool) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        match inner.state {
            CircuitState::Closed => {
                inner.failures.push(now);
                self.prune_failures(&mut inner);
                if inner.failures.len() >= self.settings.failure_threshold {
                    self.open(&mut inner, now);
                }
            }
            CircuitState::HalfOpen => {
                // One failed probe reopens immediately, bypassing the
                // failure-threshold check
                if is_probe {
                    inner.probe_in_flight = false;
                }
                inner.failures.push(now);
                self.open(&mut inner, now);
            }
            CircuitState::Open => {}
        }
    }

    fn open(&self, inner: &mut BreakerInner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.next_attempt_at =
            Some(now + Duration::from_secs(self.settings.open_timeout_secs));
        inner.half_open_successes = 0;
        inner.probe_in_flight = false;
        metrics::set_circuit_state(&self.name, CircuitState::Open);
        warn!(
            dependency = %self.name,
            failures = inner.failures.len(),
            open_timeout_secs = self.settings.open_timeout_secs,
            "Circuit opened"
        );
    }

    /// Only failures inside the rolling monitoring window count toward the
    /// open-threshold; isolated historical failures age out.
    fn prune_failures(&self, inner: &mut BreakerInner) {
        let window = Duration::from_secs(self.settings.monitoring_window_secs);
        let now = Instant::now();
        inner
            .failures
            .retain(|at| now.saturating_duration_since(*at) < window);
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
