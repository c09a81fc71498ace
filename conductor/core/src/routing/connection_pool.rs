//! Connection Pool Management
//!
//! Bounds how many backend clients may be open at once across every
//! conversation in the process.
//!
//! # Design
//!
//! One FIFO-fair semaphore with N permits guards all endpoints. A caller
//! names an endpoint prefix, waits for a permit (optionally bounded), gets a
//! freshly created client, and runs its work with it. The permit is an RAII
//! guard living inside [`ConnectionPool::with_connection`]'s future, so it is
//! returned on success, on error, and when the future is dropped mid-stream.
//!
//! Permits are not reentrant. Work that calls back into the pool while
//! holding a permit deadlocks when N = 1.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Semaphore;

use crate::backend::{BackendFactory, ChatBackend};
use crate::config::{EndpointConfig, PoolConfig};

// ============================================================================
// Pool Types
// ============================================================================

/// Statistics for the connection pool
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total backend clients created
    pub clients_created: u64,
    /// Work items currently holding a permit
    pub active: usize,
    /// Callers waiting for a permit
    pub waiting: usize,
    /// Waits that ended in a timeout
    pub timeouts: u64,
    /// Total time spent waiting for permits (ms)
    pub total_wait_time_ms: u64,
    /// Client construction failures
    pub client_errors: u64,
}

/// Atomic statistics for lock-free updates
#[derive(Default)]
struct PoolStatsAtomic {
    clients_created: AtomicU64,
    active: AtomicUsize,
    waiting: AtomicUsize,
    timeouts: AtomicU64,
    total_wait_time_ms: AtomicU64,
    client_errors: AtomicU64,
}

impl PoolStatsAtomic {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            clients_created: self.clients_created.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            waiting: self.waiting.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
            client_errors: self.client_errors.load(Ordering::Relaxed),
        }
    }
}

/// Decrements a gauge when dropped
struct GaugeGuard<'a>(&'a AtomicUsize);

impl<'a> GaugeGuard<'a> {
    fn enter(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self(gauge)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Pool errors
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// No permit became free in time
    #[error("Timed out waiting for a turn to process the prompt after {waited:?}")]
    Timeout {
        /// How long the caller waited
        waited: Duration,
    },

    /// Pool is closed
    #[error("Connection pool is closed")]
    Closed,

    /// The endpoint prefix is not configured
    #[error("No endpoint configured for prefix {0:?}")]
    UnknownEndpoint(String),

    /// Failed to create a backend client
    #[error("Failed to create backend client: {0}")]
    ConnectionFailed(String),
}

// ============================================================================
// Connection Pool
// ============================================================================

/// Process-wide bounded pool of backend clients
pub struct ConnectionPool {
    /// Endpoint/model pairs by prefix
    endpoints: HashMap<String, EndpointConfig>,
    /// Creates a client per unit of work
    factory: Arc<dyn BackendFactory>,
    /// Limits concurrently open clients
    semaphore: Semaphore,
    /// Permit count
    max_concurrent: usize,
    /// Wait used when the caller passes no timeout
    default_timeout: Duration,
    /// Statistics
    stats: PoolStatsAtomic,
}

impl ConnectionPool {
    /// Create a pool over `endpoints`
    ///
    /// A `max_concurrent` of 0 is raised to 1.
    pub fn new(
        endpoints: HashMap<String, EndpointConfig>,
        factory: Arc<dyn BackendFactory>,
        config: &PoolConfig,
    ) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            endpoints,
            factory,
            semaphore: Semaphore::new(max_concurrent),
            max_concurrent,
            default_timeout: config.wait_timeout,
            stats: PoolStatsAtomic::default(),
        }
    }

    /// Number of permits
    #[must_use]
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Permits not currently held
    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Get current pool statistics
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    /// Stop handing out permits; current and future waiters get [`PoolError::Closed`]
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Run `work` with a fresh client for `prefix`
    ///
    /// Waits up to `timeout` for a permit (`None` uses the pool default,
    /// `Some(Duration::ZERO)` waits forever). The permit is held until
    /// `work`'s future completes or is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::UnknownEndpoint`], [`PoolError::Timeout`],
    /// [`PoolError::Closed`] or [`PoolError::ConnectionFailed`] (converted
    /// into `E`), or whatever `work` returns.
    pub async fn with_connection<T, E, F, Fut>(
        &self,
        prefix: &str,
        timeout: Option<Duration>,
        work: F,
    ) -> Result<T, E>
    where
        E: From<PoolError>,
        F: FnOnce(Box<dyn ChatBackend>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let endpoint = self
            .endpoints
            .get(prefix)
            .ok_or_else(|| PoolError::UnknownEndpoint(prefix.to_string()))?;

        let timeout = timeout.unwrap_or(self.default_timeout);
        let wait_start = Instant::now();

        let permit = {
            let _waiting = GaugeGuard::enter(&self.stats.waiting);
            let acquired = if timeout.is_zero() {
                self.semaphore.acquire().await
            } else {
                match tokio::time::timeout(timeout, self.semaphore.acquire()).await {
                    Ok(acquired) => acquired,
                    Err(_) => {
                        self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(prefix, ?timeout, "Timed out waiting for a pool permit");
                        return Err(PoolError::Timeout { waited: timeout }.into());
                    }
                }
            };
            acquired.map_err(|_| PoolError::Closed)?
        };

        let waited = wait_start.elapsed();
        self.stats
            .total_wait_time_ms
            .fetch_add(waited.as_millis() as u64, Ordering::Relaxed);

        let client = match self.factory.create(&endpoint.base_url, &endpoint.model) {
            Ok(client) => client,
            Err(e) => {
                self.stats.client_errors.fetch_add(1, Ordering::Relaxed);
                return Err(PoolError::ConnectionFailed(format!("{e:#}")).into());
            }
        };
        self.stats.clients_created.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            prefix,
            model = %endpoint.model,
            waited_ms = waited.as_millis() as u64,
            "Acquired pool permit"
        );

        let _active = GaugeGuard::enter(&self.stats.active);
        let result = work(client).await;
        drop(permit);
        result
    }
}
