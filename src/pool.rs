//! Generic bounded connection pool.
//!
//! The pool owns no knowledge of what a connection is. A
//! [`ConnectionFactory`] supplies `connect`, `health_check`, and `destroy`;
//! the pool only enforces bounds and the lease protocol:
//!
//! - at most `max_size` leases are outstanding at once (a fair semaphore, so
//!   waiters are served FIFO)
//! - connections are created lazily when a lease is requested and no idle
//!   connection is available
//! - a waiter gives up with [`XrError::AcquireTimeout`] after
//!   `acquire_timeout`
//! - a [`PooledConnection`] returns itself to the pool on drop, so every
//!   exit path releases the lease
//! - destroy failures are logged and never reach the caller

use crate::error::{Result, XrError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Creates, checks, and tears down pooled connections.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a new connection.
    async fn connect(&self) -> Result<Self::Connection>;

    /// Whether an idle connection is still usable.
    async fn health_check(&self, conn: &mut Self::Connection) -> bool;

    /// Close a connection for good.
    async fn destroy(&self, conn: Self::Connection) -> Result<()>;
}

/// Pool bounds and timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    /// Idle connections kept even when they outlive `idle_timeout`.
    pub min_size: usize,
    pub max_size: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 5,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Live connections, idle plus leased.
    pub size: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max_size: usize,
    pub closed: bool,
}

struct IdleConnection<C> {
    conn: C,
    since: Instant,
}

struct PoolInner<F: ConnectionFactory> {
    factory: F,
    options: PoolOptions,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<IdleConnection<F::Connection>>>,
    size: AtomicUsize,
    closed: AtomicBool,
}

impl<F: ConnectionFactory> PoolInner<F> {
    async fn destroy(&self, conn: F::Connection) {
        self.size.fetch_sub(1, Ordering::SeqCst);
        if let Err(e) = self.factory.destroy(conn).await {
            warn!(error = %e, "failed to destroy pooled connection");
        }
    }

    /// Pull idle connections past `idle_timeout`, keeping `min_size` idle.
    fn take_expired(&self, now: Instant) -> Vec<F::Connection> {
        let mut idle = self.idle.lock();
        let mut expired = Vec::new();
        let mut i = 0;
        while i < idle.len() && idle.len() > self.options.min_size {
            if now.saturating_duration_since(idle[i].since) >= self.options.idle_timeout {
                expired.push(idle.swap_remove(i).conn);
            } else {
                i += 1;
            }
        }
        expired
    }
}

/// Bounded pool of connections produced by `F`.
pub struct Pool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> Pool<F> {
    #[must_use]
    pub fn new(factory: F, options: PoolOptions) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                permits: Arc::new(Semaphore::new(options.max_size)),
                options,
                idle: Mutex::new(Vec::new()),
                size: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The factory backing this pool.
    #[must_use]
    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    #[must_use]
    pub fn options(&self) -> PoolOptions {
        self.inner.options
    }

    /// Lease a connection, waiting up to `acquire_timeout` for a free slot.
    ///
    /// # Errors
    ///
    /// Returns `AcquireTimeout` when no slot frees up in time, `PoolClosed`
    /// after [`Pool::close`], or the factory's error if a new connection
    /// cannot be opened.
    pub async fn acquire(&self) -> Result<PooledConnection<F>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(XrError::PoolClosed);
        }

        let timeout = self.inner.options.acquire_timeout;
        let permit = match tokio::time::timeout(
            timeout,
            Arc::clone(&self.inner.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(XrError::PoolClosed),
            Err(_) => {
                debug!(timeout_ms = timeout.as_millis(), "pool acquire timed out");
                return Err(XrError::AcquireTimeout { timeout });
            }
        };

        for conn in self.inner.take_expired(Instant::now()) {
            debug!("reaping idle connection");
            self.inner.destroy(conn).await;
        }

        loop {
            let candidate = self.inner.idle.lock().pop();
            let Some(idle) = candidate else { break };
            let mut conn = idle.conn;
            if self.inner.factory.health_check(&mut conn).await {
                return Ok(self.lease(conn, permit));
            }
            warn!("idle connection failed health check; replacing");
            self.inner.destroy(conn).await;
        }

        // Permit is released by drop if connect fails.
        let conn = self.inner.factory.connect().await?;
        self.inner.size.fetch_add(1, Ordering::SeqCst);
        debug!(size = self.inner.size.load(Ordering::SeqCst), "opened connection");
        Ok(self.lease(conn, permit))
    }

    fn lease(&self, conn: F::Connection, permit: OwnedSemaphorePermit) -> PooledConnection<F> {
        PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            broken: false,
            _permit: permit,
        }
    }

    /// Stop handing out leases and destroy idle connections.
    ///
    /// Outstanding leases are destroyed when they are dropped.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.permits.close();
        let idle: Vec<_> = self.inner.idle.lock().drain(..).collect();
        for entry in idle {
            self.inner.destroy(entry.conn).await;
        }
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let max_size = self.inner.options.max_size;
        let closed = self.inner.closed.load(Ordering::SeqCst);
        let in_use = if closed {
            0
        } else {
            max_size.saturating_sub(self.inner.permits.available_permits())
        };
        PoolStatus {
            size: self.inner.size.load(Ordering::SeqCst),
            idle: self.inner.idle.lock().len(),
            in_use,
            max_size,
            closed,
        }
    }
}

/// A leased connection. Dropping it returns the connection to the pool.
pub struct PooledConnection<F: ConnectionFactory> {
    conn: Option<F::Connection>,
    pool: Arc<PoolInner<F>>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    /// Destroy this connection on release instead of reusing it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };

        if !self.broken && !self.pool.closed.load(Ordering::SeqCst) {
            self.pool.idle.lock().push(IdleConnection {
                conn,
                since: Instant::now(),
            });
            return;
        }

        let pool = Arc::clone(&self.pool);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { pool.destroy(conn).await });
            }
            Err(_) => {
                pool.size.fetch_sub(1, Ordering::SeqCst);
                warn!("no runtime available; dropping connection without destroy");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counters {
        created: AtomicUsize,
        destroyed: AtomicUsize,
        unhealthy: AtomicBool,
        fail_destroy: AtomicBool,
    }

    struct FakeFactory {
        counters: Arc<Counters>,
    }

    #[async_trait]
    impl ConnectionFactory for FakeFactory {
        type Connection = usize;

        async fn connect(&self) -> Result<usize> {
            Ok(self.counters.created.fetch_add(1, Ordering::SeqCst) + 1)
        }

        async fn health_check(&self, _conn: &mut usize) -> bool {
            !self.counters.unhealthy.load(Ordering::SeqCst)
        }

        async fn destroy(&self, _conn: usize) -> Result<()> {
            self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
            if self.counters.fail_destroy.load(Ordering::SeqCst) {
                return Err(XrError::query_execution("close failed"));
            }
            Ok(())
        }
    }

    fn create_test_pool(max_size: usize, acquire_timeout: Duration) -> (Pool<FakeFactory>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let pool = Pool::new(
            FakeFactory {
                counters: Arc::clone(&counters),
            },
            PoolOptions {
                min_size: 0,
                max_size,
                acquire_timeout,
                idle_timeout: Duration::from_secs(300),
            },
        );
        (pool, counters)
    }

    #[tokio::test]
    async fn test_creation_is_lazy_and_reused() {
        let (pool, counters) = create_test_pool(2, Duration::from_secs(1));
        assert_eq!(counters.created.load(Ordering::SeqCst), 0);

        let first = pool.acquire().await.unwrap();
        assert_eq!(*first, 1);
        drop(first);

        let second = pool.acquire().await.unwrap();
        assert_eq!(*second, 1);
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_third_acquire_waits_for_release() {
        let (pool, _counters) = create_test_pool(2, Duration::from_secs(5));
        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        assert_eq!(pool.status().in_use, 2);

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|c| *c) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(a);
        let got = waiter.await.unwrap().unwrap();
        // The released connection is reused.
        assert_eq!(got, 1);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let (pool, _counters) = create_test_pool(2, Duration::from_millis(50));
        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();

        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, XrError::AcquireTimeout { .. }));
        assert!(pool.status().in_use <= 2);
    }

    #[tokio::test]
    async fn test_unhealthy_idle_connection_is_replaced() {
        let (pool, counters) = create_test_pool(1, Duration::from_secs(1));
        drop(pool.acquire().await.unwrap());

        counters.unhealthy.store(true, Ordering::SeqCst);
        let conn = pool.acquire().await.unwrap();
        assert_eq!(*conn, 2);
        assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.status().size, 1);
    }

    #[tokio::test]
    async fn test_broken_connection_destroyed_on_release() {
        let (pool, counters) = create_test_pool(1, Duration::from_secs(1));
        counters.fail_destroy.store(true, Ordering::SeqCst);

        let mut conn = pool.acquire().await.unwrap();
        conn.mark_broken();
        drop(conn);
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Destroy error is swallowed; the slot is usable again.
        assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);
        let fresh = pool.acquire().await.unwrap();
        assert_eq!(*fresh, 2);
    }

    #[tokio::test]
    async fn test_close_rejects_new_leases() {
        let (pool, counters) = create_test_pool(2, Duration::from_secs(1));
        drop(pool.acquire().await.unwrap());
        pool.close().await;

        assert!(matches!(pool.acquire().await, Err(XrError::PoolClosed)));
        assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);
        let status = pool.status();
        assert!(status.closed);
        assert_eq!(status.size, 0);
    }

    #[tokio::test]
    async fn test_idle_timeout_reaps_connections() {
        let counters = Arc::new(Counters::default());
        let pool = Pool::new(
            FakeFactory {
                counters: Arc::clone(&counters),
            },
            PoolOptions {
                min_size: 0,
                max_size: 2,
                acquire_timeout: Duration::from_secs(1),
                idle_timeout: Duration::from_millis(10),
            },
        );
        drop(pool.acquire().await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;

        let conn = pool.acquire().await.unwrap();
        assert_eq!(*conn, 2);
        assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);
    }
}
