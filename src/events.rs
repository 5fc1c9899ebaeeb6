//! Typed observability events
//!
//! Every state change an operator might care about is published as a
//! [`PoolEvent`] over a broadcast channel. Payload shapes are checked at
//! compile time; there is no string-keyed event bus.

use std::time::Duration;
use tokio::sync::broadcast;

use crate::health::PoolHealthStatus;

/// Events emitted by the pool, circuit breaker, and health monitor
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// The circuit breaker tripped open (emitted once per open transition)
    BreakerOpened {
        failure_count: u32,
        retry_after: Duration,
    },

    /// The breaker is allowing a recovery probe through
    BreakerHalfOpen,

    /// The breaker returned to closed and its failure count was zeroed
    BreakerReset,

    /// The breaker closed after having been open
    BreakerRecovered,

    /// The pool has shut down; all resources were destroyed
    PoolShutdown,

    /// A factory `create` call failed during acquisition
    ConnectionFailure { error: String },

    /// A health check cycle finished
    HealthCheckCompleted(PoolHealthStatus),

    /// A connection crossed the consecutive-failure threshold
    ConnectionUnhealthy { id: u64, error: String },

    /// An unhealthy connection was destroyed and a fresh one created
    ConnectionReplaced { old_id: u64, new_id: u64 },

    /// The health monitor's recurring cycle was started
    HealthMonitoringStarted,

    /// The health monitor's recurring cycle was stopped
    HealthMonitoringStopped,

    /// A health cycle hit an internal error (e.g. replacement create failed)
    HealthMonitoringError { error: String },
}

/// Broadcast publisher shared by the pool and its collaborators.
///
/// Publishing with no subscribers is not an error; events are simply
/// dropped, the same way a tracing subscriber may be absent.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn publish(&self, event: PoolEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::default();
        bus.publish(PoolEvent::BreakerReset);
    }

    #[tokio::test]
    async fn test_subscriber_sees_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(PoolEvent::BreakerHalfOpen);
        bus.publish(PoolEvent::BreakerReset);

        assert!(matches!(rx.recv().await.unwrap(), PoolEvent::BreakerHalfOpen));
        assert!(matches!(rx.recv().await.unwrap(), PoolEvent::BreakerReset));
    }
}
