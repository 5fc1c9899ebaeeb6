//! Connection pooling and circuit breaker module
//!
//! This module provides:
//! - A bounded, factory-driven connection pool with FIFO waiter hand-off
//! - Circuit breaker pattern for fault tolerance with exponential backoff
//! - Automatic idle cleanup and shutdown of all pooled resources

pub mod circuit;
pub mod connection;

pub use circuit::{CircuitBreaker, CircuitError, CircuitState, CircuitStats};
pub use connection::{ConnectionPool, PoolError, PoolStats, PooledConnection};
