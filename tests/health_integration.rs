//! Integration tests for the health monitor
//!
//! These tests drive the monitor through its real recurring schedule and
//! verify that unhealthy connections are detected, replaced, and reported
//! through events, while pool callers never see validation failures.

use async_trait::async_trait;
use conpool::{
    ConnectionPool, HealthConfig, HealthMonitor, PoolConfig, PoolEvent, ResourceFactory,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug)]
struct FakeConn {
    #[allow(dead_code)]
    serial: u64,
}

struct FlakyBackend {
    serial: AtomicU64,
    fail_validation: Arc<AtomicBool>,
    destroyed: Arc<AtomicU64>,
}

impl FlakyBackend {
    fn new() -> (Self, Arc<AtomicBool>, Arc<AtomicU64>) {
        let fail = Arc::new(AtomicBool::new(false));
        let destroyed = Arc::new(AtomicU64::new(0));
        let backend = Self {
            serial: AtomicU64::new(0),
            fail_validation: Arc::clone(&fail),
            destroyed: Arc::clone(&destroyed),
        };
        (backend, fail, destroyed)
    }
}

#[async_trait]
impl ResourceFactory for FlakyBackend {
    type Resource = FakeConn;
    type Error = std::io::Error;

    async fn create(&self) -> Result<FakeConn, std::io::Error> {
        Ok(FakeConn {
            serial: self.serial.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn destroy(&self, _conn: &FakeConn) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    async fn validate(&self, _conn: &FakeConn) -> bool {
        !self.fail_validation.load(Ordering::SeqCst)
    }
}

fn pool_config() -> PoolConfig {
    PoolConfig {
        max_connections: 4,
        min_connections: 2,
        ..Default::default()
    }
}

fn health_config() -> HealthConfig {
    HealthConfig {
        interval_ms: 20,
        max_concurrent_validations: 5,
        validation_timeout_ms: 500,
        unhealthy_threshold: 2,
        detailed_logging: false,
    }
}

#[tokio::test]
async fn test_monitor_detects_and_replaces_unhealthy_connections() {
    let (backend, fail, destroyed) = FlakyBackend::new();
    let pool = ConnectionPool::new(pool_config(), backend).await;
    let monitor = Arc::new(HealthMonitor::new(Arc::clone(&pool), health_config()));
    let mut events = pool.subscribe();

    Arc::clone(&monitor).start().await;
    fail.store(true, Ordering::SeqCst);

    // Threshold is 2, so the second failing cycle replaces both idle
    // connections; wait for the replacement events.
    let mut replaced = 0;
    let deadline = timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(PoolEvent::ConnectionReplaced { .. }) => {
                    replaced += 1;
                    if replaced == 2 {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await;
    assert!(deadline.is_ok(), "replacements never happened");
    assert!(destroyed.load(Ordering::SeqCst) >= 2);

    // The floor is restored with fresh connections
    fail.store(false, Ordering::SeqCst);
    let stats = pool.stats().await;
    assert!(stats.idle + stats.active >= 2);

    monitor.stop().await;
    pool.shutdown().await;
}

#[tokio::test]
async fn test_callers_never_see_validation_failures() {
    let (backend, fail, _) = FlakyBackend::new();
    let pool = ConnectionPool::new(pool_config(), backend).await;
    let monitor = Arc::new(HealthMonitor::new(Arc::clone(&pool), health_config()));

    Arc::clone(&monitor).start().await;
    fail.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Validation is failing constantly, but acquire still works: the
    // factory creates fine and the breaker only counts create outcomes.
    let conn = pool.acquire().await.unwrap();
    pool.release(conn).await;

    monitor.stop().await;
    pool.shutdown().await;
}

#[tokio::test]
async fn test_status_snapshot_is_queryable_between_cycles() {
    let (backend, _, _) = FlakyBackend::new();
    let pool = ConnectionPool::new(pool_config(), backend).await;
    let monitor = Arc::new(HealthMonitor::new(Arc::clone(&pool), health_config()));
    let mut events = pool.subscribe();

    Arc::clone(&monitor).start().await;

    let completed = timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(PoolEvent::HealthCheckCompleted(status)) = events.recv().await {
                break status;
            }
        }
    })
    .await
    .expect("no cycle completed");

    assert_eq!(completed.total, 2);
    assert_eq!(completed.healthy, 2);

    let last = monitor.last_status().await.expect("no retained status");
    assert_eq!(last.total, 2);

    monitor.stop().await;
    pool.shutdown().await;
}

#[tokio::test]
async fn test_monitoring_start_stop_events() {
    let (backend, _, _) = FlakyBackend::new();
    let pool = ConnectionPool::new(pool_config(), backend).await;
    let monitor = Arc::new(HealthMonitor::new(Arc::clone(&pool), health_config()));
    let mut events = pool.subscribe();

    Arc::clone(&monitor).start().await;
    monitor.stop().await;
    monitor.stop().await;

    let mut started = 0;
    let mut stopped = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            PoolEvent::HealthMonitoringStarted => started += 1,
            PoolEvent::HealthMonitoringStopped => stopped += 1,
            _ => {}
        }
    }
    assert_eq!(started, 1);
    assert_eq!(stopped, 1);

    pool.shutdown().await;
}
