//! Integration tests for the connection pool and circuit breaker
//!
//! These tests verify that the pool and breaker work correctly together
//! in realistic scenarios: capacity pressure, factory outages, and
//! recovery once the backend comes back.

use async_trait::async_trait;
use conpool::{
    CircuitBreakerConfig, CircuitState, ConnectionPool, PoolConfig, PoolError, PoolEvent,
    ResourceFactory,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct FakeConn {
    #[allow(dead_code)]
    serial: u64,
}

struct FakeBackend {
    serial: AtomicU64,
    down: Arc<AtomicBool>,
    destroyed: Arc<AtomicU64>,
}

impl FakeBackend {
    fn new() -> (Self, Arc<AtomicBool>, Arc<AtomicU64>) {
        let down = Arc::new(AtomicBool::new(false));
        let destroyed = Arc::new(AtomicU64::new(0));
        let backend = Self {
            serial: AtomicU64::new(0),
            down: Arc::clone(&down),
            destroyed: Arc::clone(&destroyed),
        };
        (backend, down, destroyed)
    }
}

#[async_trait]
impl ResourceFactory for FakeBackend {
    type Resource = FakeConn;
    type Error = std::io::Error;

    async fn create(&self) -> Result<FakeConn, std::io::Error> {
        if self.down.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "backend is down",
            ));
        }
        Ok(FakeConn {
            serial: self.serial.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn destroy(&self, _conn: &FakeConn) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

fn config(max: usize, min: usize) -> PoolConfig {
    PoolConfig {
        max_connections: max,
        min_connections: min,
        acquire_timeout_ms: 1000,
        breaker: CircuitBreakerConfig {
            failure_threshold: 3,
            base_delay_ms: 20,
            max_backoff_exponent: 4,
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_acquire_release_lifecycle() {
    let (backend, _, _) = FakeBackend::new();
    let pool = ConnectionPool::new(config(10, 2), backend).await;

    let stats = pool.stats().await;
    assert_eq!(stats.idle, 2);

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let stats = pool.stats().await;
    assert_eq!(stats.active, 2);
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.total_created, 2);

    pool.release(a).await;
    pool.release(b).await;
    let stats = pool.stats().await;
    assert_eq!(stats.active, 0);
    assert_eq!(stats.idle, 2);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_capacity_pressure_and_fifo_handoff() {
    let (backend, _, _) = FakeBackend::new();
    let pool = ConnectionPool::new(config(2, 0), backend).await;

    let a = pool.acquire().await.unwrap();
    let _b = pool.acquire().await.unwrap();

    // Pool is full; a third acquire with a short deadline times out
    let result = pool.acquire_timeout(Duration::from_millis(50)).await;
    assert!(matches!(result, Err(PoolError::AcquireTimeout(_))));

    // Two queued waiters are served in arrival order
    let first = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire().await.map(|c| c.id()) })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    let second = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.acquire().await.map(|c| c.id()) })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let released_id = a.id();
    pool.release(a).await;
    assert_eq!(first.await.unwrap().unwrap(), released_id);
    assert!(!second.is_finished());

    pool.shutdown().await;
    let result = second.await.unwrap();
    assert!(matches!(result, Err(PoolError::Shutdown)));
}

#[tokio::test]
async fn test_outage_trips_breaker_and_recovery_closes_it() {
    let (backend, down, _) = FakeBackend::new();
    let pool = ConnectionPool::new(config(10, 0), backend).await;
    let mut events = pool.subscribe();

    down.store(true, Ordering::SeqCst);
    for _ in 0..3 {
        let result = pool.acquire().await;
        assert!(matches!(result, Err(PoolError::Create(_))));
    }
    assert!(matches!(
        pool.breaker().state().await,
        CircuitState::Open { .. }
    ));

    // Denied without touching the factory while open
    let result = pool.acquire().await;
    assert!(matches!(result, Err(PoolError::CircuitOpen { .. })));

    // Backend recovers; after the backoff a probe goes through and the
    // breaker closes again. backoff = 20ms * 2^3 = 160ms.
    down.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(pool.breaker().state().await, CircuitState::HalfOpen);

    let conn = pool.acquire().await.unwrap();
    assert_eq!(pool.breaker().state().await, CircuitState::Closed);

    let mut saw_opened = 0;
    let mut saw_recovered = false;
    while let Ok(event) = events.try_recv() {
        match event {
            PoolEvent::BreakerOpened { .. } => saw_opened += 1,
            PoolEvent::BreakerRecovered => saw_recovered = true,
            _ => {}
        }
    }
    assert_eq!(saw_opened, 1);
    assert!(saw_recovered);

    pool.release(conn).await;
    pool.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_destroys_everything_and_emits_event() {
    let (backend, _, destroyed) = FakeBackend::new();
    let pool = ConnectionPool::new(config(5, 3), backend).await;
    let mut events = pool.subscribe();

    let held = pool.acquire().await.unwrap();
    pool.shutdown().await;
    pool.shutdown().await;

    assert_eq!(destroyed.load(Ordering::SeqCst), 3);
    assert!(matches!(pool.acquire().await, Err(PoolError::Shutdown)));

    let mut saw_shutdown = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, PoolEvent::PoolShutdown) {
            saw_shutdown += 1;
        }
    }
    assert_eq!(saw_shutdown, 1);

    pool.release(held).await;
    assert_eq!(destroyed.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_breaker_denial_does_not_consume_the_wait() {
    let (backend, down, _) = FakeBackend::new();
    let pool = ConnectionPool::new(config(10, 0), backend).await;

    down.store(true, Ordering::SeqCst);
    for _ in 0..3 {
        let _ = pool.acquire().await;
    }

    let started = std::time::Instant::now();
    let result = pool.acquire_timeout(Duration::from_secs(5)).await;
    assert!(matches!(result, Err(PoolError::CircuitOpen { .. })));
    assert!(started.elapsed() < Duration::from_millis(100));

    pool.shutdown().await;
}
