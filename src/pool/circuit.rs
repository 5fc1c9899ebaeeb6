//! Circuit breaker implementation for fault tolerance
//!
//! This module implements a circuit breaker pattern with three states:
//! - Closed: Normal operation, acquisition attempts are allowed
//! - Open: The factory has failed repeatedly, attempts are rejected
//! - HalfOpen: Testing recovery, a probe attempt is allowed through
//!
//! The breaker never performs the guarded operation itself; it only gates
//! whether the pool may call the factory. The wait before a recovery probe
//! grows exponentially with the consecutive failure count, up to a
//! configured cap on the exponent. The Open-to-HalfOpen transition is
//! driven by a scheduled timer whose handle is owned here and aborted on
//! every reset and on pool shutdown, so no pending transition outlives the
//! state that scheduled it.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::events::{EventBus, PoolEvent};

/// Circuit breaker error types
#[derive(Debug, thiserror::Error)]
pub enum CircuitError {
    #[error("circuit breaker is open; retry in {retry_after:?}")]
    Open { retry_after: Duration },
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - attempts are allowed
    Closed,

    /// The factory has failed - attempts are rejected
    Open {
        /// When the circuit should transition to HalfOpen
        retry_at: Instant,

        /// Consecutive failures at the time the circuit opened
        failure_count: u32,
    },

    /// Testing recovery - a probe attempt is allowed
    HalfOpen,
}

impl CircuitState {
    /// Get a human-readable state name
    pub fn name(&self) -> &str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open { .. } => "Open",
            CircuitState::HalfOpen => "HalfOpen",
        }
    }
}

/// Circuit breaker statistics snapshot
#[derive(Debug, Clone)]
pub struct CircuitStats {
    /// Current state
    pub state: CircuitState,

    /// Consecutive failures since the last success or reset
    pub failure_count: u32,

    /// Total recorded successes
    pub total_successes: u64,

    /// Total recorded failures
    pub total_failures: u64,

    /// Number of times the circuit has opened
    pub open_count: u64,

    /// Time since last state transition
    pub time_in_state: Duration,
}

struct CircuitInner {
    state: CircuitState,

    /// Consecutive failures; keeps accumulating across Open periods so
    /// successive backoffs are non-decreasing until a success resets it
    failure_count: u32,

    last_failure: Option<Instant>,

    /// The current HalfOpen/Closed state was reached from Open, so the
    /// next success is a recovery
    recovering: bool,

    total_successes: u64,
    total_failures: u64,
    open_count: u64,
    last_transition: Instant,
}

/// Failure-counting state machine gating pool acquisition attempts
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<CircuitInner>>,
    events: EventBus,

    /// Pending Open-to-HalfOpen transition, if any
    half_open_timer: Mutex<Option<JoinHandle<()>>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in the Closed state
    pub fn new(config: CircuitBreakerConfig, events: EventBus) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                recovering: false,
                total_successes: 0,
                total_failures: 0,
                open_count: 0,
                last_transition: Instant::now(),
            })),
            events,
            half_open_timer: Mutex::new(None),
        }
    }

    /// The backoff delay applied after the given consecutive failure count
    pub fn backoff_delay(&self, failure_count: u32) -> Duration {
        let exponent = failure_count.min(self.config.max_backoff_exponent);
        self.config.base_delay() * 2u32.pow(exponent)
    }

    /// Check whether an acquisition attempt is currently permitted.
    ///
    /// While Open, an attempt after the backoff deadline lazily moves the
    /// circuit to HalfOpen and is allowed through as the recovery probe.
    pub async fn check(&self) -> Result<(), CircuitError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open { retry_at, .. } => {
                let now = Instant::now();
                if now >= retry_at {
                    inner.state = CircuitState::HalfOpen;
                    inner.recovering = true;
                    inner.last_transition = now;
                    info!("circuit breaker half-open; allowing a recovery probe");
                    self.events.publish(PoolEvent::BreakerHalfOpen);
                    Ok(())
                } else {
                    Err(CircuitError::Open {
                        retry_after: retry_at.saturating_duration_since(now),
                    })
                }
            }
        }
    }

    /// Convenience wrapper around [`check`](Self::check)
    pub async fn can_attempt(&self) -> bool {
        self.check().await.is_ok()
    }

    /// Record a failed factory attempt
    pub async fn on_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.total_failures += 1;
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());

        let timer = match inner.state {
            CircuitState::Closed => {
                debug!(
                    failure_count = inner.failure_count,
                    threshold = self.config.failure_threshold,
                    "factory failure recorded while closed"
                );
                if inner.failure_count >= self.config.failure_threshold {
                    Some(self.enter_open(&mut inner, true))
                } else {
                    None
                }
            }

            CircuitState::HalfOpen => {
                warn!(
                    failure_count = inner.failure_count,
                    "recovery probe failed; reopening circuit"
                );
                Some(self.enter_open(&mut inner, true))
            }

            // A racing attempt failed while already open: refresh the
            // deadline with the new count, but don't re-announce the trip.
            CircuitState::Open { .. } => Some(self.enter_open(&mut inner, false)),
        };

        if let Some(handle) = timer {
            // Lock order is always inner -> half_open_timer
            let mut slot = self.half_open_timer.lock().await;
            if let Some(old) = slot.replace(handle) {
                old.abort();
            }
        }
    }

    /// Record a successful factory attempt; closes the circuit
    pub async fn on_success(&self) {
        let recovered;
        {
            let mut inner = self.inner.lock().await;
            inner.total_successes += 1;
            let pristine =
                matches!(inner.state, CircuitState::Closed) && inner.failure_count == 0;
            if pristine {
                return;
            }
            recovered = inner.recovering || matches!(inner.state, CircuitState::Open { .. });
            Self::to_closed(&mut inner);
        }
        self.cancel_timer().await;
        self.events.publish(PoolEvent::BreakerReset);
        if recovered {
            info!("circuit breaker recovered");
            self.events.publish(PoolEvent::BreakerRecovered);
        }
    }

    /// Manually force the circuit back to Closed
    pub async fn reset(&self) {
        let recovered;
        {
            let mut inner = self.inner.lock().await;
            recovered = inner.recovering || matches!(inner.state, CircuitState::Open { .. });
            Self::to_closed(&mut inner);
        }
        self.cancel_timer().await;
        info!("circuit breaker manually reset to closed");
        self.events.publish(PoolEvent::BreakerReset);
        if recovered {
            self.events.publish(PoolEvent::BreakerRecovered);
        }
    }

    /// Get the current state
    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Get a statistics snapshot
    pub async fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock().await;
        CircuitStats {
            state: inner.state,
            failure_count: inner.failure_count,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            open_count: inner.open_count,
            time_in_state: inner.last_transition.elapsed(),
        }
    }

    /// Abort any pending scheduled transition; called on pool shutdown
    pub(crate) async fn shutdown(&self) {
        self.cancel_timer().await;
    }

    /// Move to Open and schedule the deferred HalfOpen transition.
    ///
    /// `freshly_tripped` is false when the circuit was already open and we
    /// are only refreshing the deadline; no event is emitted in that case.
    fn enter_open(&self, inner: &mut CircuitInner, freshly_tripped: bool) -> JoinHandle<()> {
        let delay = self.backoff_delay(inner.failure_count);
        let retry_at = Instant::now() + delay;
        inner.state = CircuitState::Open {
            retry_at,
            failure_count: inner.failure_count,
        };
        inner.last_transition = Instant::now();
        if freshly_tripped {
            inner.open_count += 1;
            warn!(
                failure_count = inner.failure_count,
                retry_in_ms = delay.as_millis() as u64,
                "circuit breaker opened"
            );
            self.events.publish(PoolEvent::BreakerOpened {
                failure_count: inner.failure_count,
                retry_after: delay,
            });
        }

        // The generation guard makes a stale timer a no-op after a reset
        // re-closed the circuit or a newer trip rescheduled it.
        let generation = inner.open_count;
        let shared = Arc::clone(&self.inner);
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut inner = shared.lock().await;
            if inner.open_count == generation
                && matches!(inner.state, CircuitState::Open { .. })
            {
                inner.state = CircuitState::HalfOpen;
                inner.recovering = true;
                inner.last_transition = Instant::now();
                info!("circuit breaker half-open; allowing a recovery probe");
                events.publish(PoolEvent::BreakerHalfOpen);
            }
        })
    }

    fn to_closed(inner: &mut CircuitInner) {
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.recovering = false;
        inner.last_transition = Instant::now();
    }

    async fn cancel_timer(&self) {
        if let Some(handle) = self.half_open_timer.lock().await.take() {
            handle.abort();
        }
    }
}
