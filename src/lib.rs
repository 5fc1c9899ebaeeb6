//! conpool - resilient connection pooling with circuit breaking and health monitoring

pub mod config;
pub mod events;
pub mod factory;
pub mod health;
pub mod pool;

pub use config::{CircuitBreakerConfig, HealthConfig, PoolConfig};
pub use events::{EventBus, PoolEvent};
pub use factory::ResourceFactory;
pub use health::{HealthMonitor, HealthRecord, PoolHealthStatus};
pub use pool::{
    CircuitBreaker, CircuitError, CircuitState, CircuitStats, ConnectionPool, PoolError,
    PoolStats, PooledConnection,
};
