//! Periodic health monitoring and replacement of pooled connections
//!
//! The monitor runs a recurring, non-overlapping check cycle: it snapshots
//! the pool's resources, validates a bounded number of them concurrently,
//! tracks consecutive failures per connection, and replaces a connection
//! once it crosses the unhealthy threshold. Validation outcomes never
//! reach pool callers; they surface only through events and status
//! snapshots.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{watch, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;
use crate::events::PoolEvent;
use crate::factory::ResourceFactory;
use crate::pool::connection::{ConnectionPool, PoolStats, RetireOutcome};

/// Validation history for one pooled connection
#[derive(Debug, Clone)]
pub struct HealthRecord {
    /// Validation failures since the last success
    pub consecutive_failures: u32,

    /// When this connection was last validated
    pub last_checked: Instant,

    /// Message from the most recent failed validation
    pub last_error: Option<String>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            last_checked: Instant::now(),
            last_error: None,
        }
    }
}

/// Summary of one completed health check cycle
#[derive(Debug, Clone)]
pub struct PoolHealthStatus {
    /// Wall-clock time the cycle finished
    pub checked_at: SystemTime,

    /// Connections validated this cycle
    pub total: usize,

    /// Connections that passed validation
    pub healthy: usize,

    /// Connections that failed validation this cycle
    pub unhealthy: usize,

    /// Replacement connections created this cycle
    pub replaced: usize,

    /// Validation error messages collected this cycle
    pub errors: Vec<String>,

    /// Pool statistics at the end of the cycle
    pub pool: PoolStats,

    /// How long the cycle took
    pub cycle_duration: Duration,
}

/// Recurring validator and replacer of pooled connections
pub struct HealthMonitor<F: ResourceFactory> {
    pool: Arc<ConnectionPool<F>>,
    config: HealthConfig,
    records: Mutex<HashMap<u64, HealthRecord>>,
    last_status: RwLock<Option<PoolHealthStatus>>,
    task: Mutex<Option<JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
}

impl<F: ResourceFactory> HealthMonitor<F> {
    pub fn new(pool: Arc<ConnectionPool<F>>, config: HealthConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            pool,
            config,
            records: Mutex::new(HashMap::new()),
            last_status: RwLock::new(None),
            task: Mutex::new(None),
            stop_tx,
        }
    }

    /// Begin the recurring check cycle.
    ///
    /// Ticks that elapse while a cycle is still running are skipped, not
    /// queued, so cycles never overlap. Starting while already running
    /// replaces the previous schedule.
    pub async fn start(self: Arc<Self>) {
        if self.pool.is_shut_down() {
            warn!("not starting health monitoring on a shut-down pool");
            return;
        }

        let _ = self.stop_tx.send(false);
        let monitor = Arc::clone(&self);
        let mut stop = self.stop_tx.subscribe();
        let mut pool_shutdown = self.pool.shutdown_watch();
        let interval = self.config.interval();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first interval tick fires immediately; consume it so the
            // first cycle runs one full interval after start.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => monitor.run_cycle().await,
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                    _ = pool_shutdown.changed() => {
                        if *pool_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("health monitoring loop exited");
        });

        let mut task = self.task.lock().await;
        if let Some(old) = task.replace(handle) {
            old.abort();
        }
        info!(
            interval_ms = interval.as_millis() as u64,
            "health monitoring started"
        );
        self.pool.events().publish(PoolEvent::HealthMonitoringStarted);
    }

    /// Stop the recurring cycle. An in-flight cycle finishes; no new one
    /// starts. Idempotent: stopping twice, or before ever starting, is
    /// not an error.
    pub async fn stop(&self) {
        let was_running = self.task.lock().await.take().is_some();
        if !was_running {
            debug!("health monitoring already stopped");
            return;
        }
        let _ = self.stop_tx.send(true);
        info!("health monitoring stopped");
        self.pool.events().publish(PoolEvent::HealthMonitoringStopped);
    }

    /// The last completed cycle's status, if any cycle has run
    pub async fn last_status(&self) -> Option<PoolHealthStatus> {
        self.last_status.read().await.clone()
    }

    /// Validation history for one connection
    pub async fn record(&self, id: u64) -> Option<HealthRecord> {
        self.records.lock().await.get(&id).cloned()
    }

    /// Run a single check cycle on demand
    pub async fn check_now(&self) {
        self.run_cycle().await;
    }

    async fn run_cycle(&self) {
        let started = Instant::now();
        let snapshot = self.pool.snapshot().await;
        let total = snapshot.len();

        // Bounded fan-out: at most max_concurrent_validations pings hit
        // the underlying resource at once.
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_validations.max(1)));
        let validation_timeout = self.config.validation_timeout();
        let mut handles = Vec::with_capacity(total);
        for snap in snapshot {
            let pool = Arc::clone(&self.pool);
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let verdict = match tokio::time::timeout(
                    validation_timeout,
                    pool.factory().validate(&snap.resource),
                )
                .await
                {
                    Ok(true) => Ok(()),
                    Ok(false) => Err("validation reported unhealthy".to_string()),
                    Err(_) => Err(format!(
                        "validation timed out after {}ms",
                        validation_timeout.as_millis()
                    )),
                };
                (snap.id, verdict)
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!(error = %e, "validation task failed to complete");
                    self.pool
                        .events()
                        .publish(PoolEvent::HealthMonitoringError {
                            error: e.to_string(),
                        });
                }
            }
        }

        let mut errors = Vec::new();
        let mut healthy = 0usize;
        let mut failed = 0usize;
        let mut to_replace: Vec<(u64, String)> = Vec::new();
        {
            let mut records = self.records.lock().await;
            // Drop history for connections that already left the pool
            let live: HashSet<u64> = results.iter().map(|(id, _)| *id).collect();
            records.retain(|id, _| live.contains(id));

            for (id, verdict) in &results {
                let record = records.entry(*id).or_default();
                record.last_checked = Instant::now();
                match verdict {
                    Ok(()) => {
                        record.consecutive_failures = 0;
                        record.last_error = None;
                        healthy += 1;
                        if self.config.detailed_logging {
                            debug!(id, "connection validated");
                        }
                    }
                    Err(error) => {
                        failed += 1;
                        record.consecutive_failures += 1;
                        record.last_error = Some(error.clone());
                        errors.push(format!("connection {id}: {error}"));
                        if self.config.detailed_logging {
                            debug!(
                                id,
                                failures = record.consecutive_failures,
                                error = %error,
                                "connection validation failed"
                            );
                        }
                        if record.consecutive_failures >= self.config.unhealthy_threshold {
                            to_replace.push((*id, error.clone()));
                        }
                    }
                }
            }
        }

        let mut replaced = 0usize;
        if !to_replace.is_empty() {
            for (id, error) in &to_replace {
                warn!(id, error = %error, "connection crossed unhealthy threshold");
                self.pool.events().publish(PoolEvent::ConnectionUnhealthy {
                    id: *id,
                    error: error.clone(),
                });
                match self.pool.retire(*id).await {
                    RetireOutcome::Destroyed => {
                        self.records.lock().await.remove(id);
                    }
                    RetireOutcome::FlaggedActive => {
                        debug!(id, "connection is checked out; destroy deferred to release");
                    }
                    RetireOutcome::NotFound => {}
                }
            }

            let (created, error) = self.pool.replenish().await;
            replaced = created.len();
            for ((old_id, _), new_id) in to_replace.iter().zip(created.iter()) {
                info!(old_id, new_id, "replaced unhealthy connection");
                self.pool.events().publish(PoolEvent::ConnectionReplaced {
                    old_id: *old_id,
                    new_id: *new_id,
                });
            }
            if let Some(error) = error {
                warn!(error = %error, "failed to fully restore the connection floor");
                self.pool
                    .events()
                    .publish(PoolEvent::HealthMonitoringError {
                        error: error.to_string(),
                    });
            }
        }

        let status = PoolHealthStatus {
            checked_at: SystemTime::now(),
            total,
            healthy,
            unhealthy: failed,
            replaced,
            errors,
            pool: self.pool.stats().await,
            cycle_duration: started.elapsed(),
        };
        debug!(
            total,
            healthy,
            unhealthy = failed,
            replaced,
            duration_ms = status.cycle_duration.as_millis() as u64,
            "health check cycle completed"
        );
        *self.last_status.write().await = Some(status.clone());
        self.pool
            .events()
            .publish(PoolEvent::HealthCheckCompleted(status));
    }
}
