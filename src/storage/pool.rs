//! Connection pool for the libSQL store
//!
//! A `deadpool` managed pool over connections of one opened
//! [`libsql::Database`]. Every connection gets `PRAGMA foreign_keys = ON` when
//! it is created; connections older than the configured lifetime are dropped
//! on recycle instead of being handed out again. An in-memory database lives
//! only as long as its one connection, so that connection is pinned: it never
//! ages out and is never pruned.

use crate::config::PoolSettings;
use crate::error::{Result, StoreError};
use deadpool::managed::{self, Metrics, Object, RecycleError, RecycleResult};
use deadpool::Runtime;
use libsql::{params, Connection, Database};
use std::time::Duration;
use tracing::debug;

/// Creates and recycles libSQL connections
pub struct ConnectionManager {
    db: Database,
    max_lifetime: Duration,
    local: bool,
    pinned: bool,
}

impl ConnectionManager {
    pub fn new(db: Database, max_lifetime: Duration, local: bool, pinned: bool) -> Self {
        Self {
            db,
            max_lifetime,
            local,
            pinned,
        }
    }
}

impl managed::Manager for ConnectionManager {
    type Type = Connection;
    type Error = libsql::Error;

    async fn create(&self) -> std::result::Result<Connection, libsql::Error> {
        let conn = self.db.connect()?;
        conn.execute("PRAGMA foreign_keys = ON", params![]).await?;
        if self.local {
            // Returns a row, so it cannot go through execute
            let _ = conn.query("PRAGMA busy_timeout = 5000", params![]).await?;
        }
        debug!("Opened pooled libSQL connection");
        Ok(conn)
    }

    async fn recycle(&self, conn: &mut Connection, metrics: &Metrics) -> RecycleResult<libsql::Error> {
        if !self.pinned && metrics.age() > self.max_lifetime {
            return Err(RecycleError::Message(
                format!("connection exceeded max lifetime of {:?}", self.max_lifetime).into(),
            ));
        }
        conn.query("SELECT 1", params![])
            .await
            .map_err(RecycleError::Backend)?;
        Ok(())
    }
}

/// Pooled connection handle; derefs to [`libsql::Connection`]
pub type PooledConnection = Object<ConnectionManager>;

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_size: usize,
    pub size: usize,
    pub available: usize,
}

/// Bounded pool of libSQL connections
pub struct SqlPool {
    inner: managed::Pool<ConnectionManager>,
    max_idle: usize,
}

impl SqlPool {
    /// Build a pool over an opened database
    ///
    /// In-memory databases do not share state between connections, so their
    /// pool is capped at a single pinned connection.
    pub fn new(db: Database, settings: &PoolSettings, in_memory: bool, local: bool) -> Result<Self> {
        let max_size = if in_memory { 1 } else { settings.max_open.max(1) };
        let manager = ConnectionManager::new(db, settings.max_lifetime(), local, in_memory);

        let inner = managed::Pool::builder(manager)
            .max_size(max_size)
            .wait_timeout(Some(settings.wait_timeout()))
            .create_timeout(Some(settings.connect_timeout()))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| StoreError::Configuration(format!("Failed to build connection pool: {}", e)))?;

        let max_idle = if in_memory { 1 } else { settings.max_idle.min(max_size) };
        Ok(Self { inner, max_idle })
    }

    /// Check out a connection, waiting up to the configured timeout
    pub async fn get(&self, operation: &str) -> Result<PooledConnection> {
        if self.inner.is_closed() {
            return Err(StoreError::unavailable(operation, "connection pool is closed"));
        }
        self.inner
            .get()
            .await
            .map_err(|e| StoreError::unavailable(operation, format!("Failed to get connection: {}", e)))
    }

    /// Drop idle connections beyond the idle limit
    pub fn prune_idle(&self) -> usize {
        let before = self.status().available;
        let mut kept = 0;
        let max_idle = self.max_idle;
        let _ = self.inner.retain(|_, _| {
            if kept < max_idle {
                kept += 1;
                true
            } else {
                false
            }
        });
        let pruned = before.saturating_sub(self.status().available);
        if pruned > 0 {
            debug!("Pruned {} idle connections", pruned);
        }
        pruned
    }

    pub fn status(&self) -> PoolStatus {
        let status = self.inner.status();
        PoolStatus {
            max_size: status.max_size,
            size: status.size,
            available: status.available as usize,
        }
    }

    pub fn close(&self) {
        self.inner.close();
    }
}
