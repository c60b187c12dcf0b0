//! `DuckDB` connection pool management.
//!
//! Every pooled connection is a clone of one root connection, so all of them
//! share a single database instance and see each other's commits through
//! DuckDB's MVCC snapshots.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use ::duckdb::Connection;

use crate::WarehouseError;

/// Selects the idle pool a connection is drawn from and returned to.
///
/// Every connection is cloned from one read-write database handle, since a
/// process cannot hold the same file open both read-only and read-write.
/// `ReadOnly` therefore does not stop writes; it marks connections whose
/// callers only run fixed mart queries or SQL screened by
/// `Warehouse::execute_query`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Hands out scoped connections; the connection returns to its pool on drop.
pub trait ConnectionProvider: Send + Sync {
    fn acquire_connection(&self, mode: AccessMode) -> Result<PooledConnection, WarehouseError>;
}

#[derive(Default)]
struct PoolState {
    read_only: Vec<Connection>,
    read_write: Vec<Connection>,
}

struct PoolInner {
    db_path: PathBuf,
    max_pool_size: usize,
    root: Mutex<Option<Connection>>,
    state: Mutex<PoolState>,
}

/// A connection pool manager for `DuckDB` connections.
#[derive(Clone)]
pub struct DuckDbConnectionManager {
    inner: Arc<PoolInner>,
}

impl DuckDbConnectionManager {
    /// `max_pool_size` bounds idle connections kept per access mode, not connections in use.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, max_pool_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                db_path: path.into(),
                max_pool_size: max_pool_size.max(1),
                root: Mutex::new(None),
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Takes an idle connection for `mode` or clones a fresh one from the root.
    ///
    /// # Errors
    /// Returns an error if the database file cannot be opened or configured.
    pub fn acquire(&self, mode: AccessMode) -> Result<PooledConnection, ::duckdb::Error> {
        let idle = {
            let mut state = lock(&self.inner.state);
            match mode {
                AccessMode::ReadOnly => state.read_only.pop(),
                AccessMode::ReadWrite => state.read_write.pop(),
            }
        };

        let connection = match idle {
            Some(connection) => connection,
            None => self.open_connection()?,
        };

        Ok(PooledConnection {
            mode,
            pool: Arc::clone(&self.inner),
            connection: Some(connection),
        })
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        self.inner.db_path.as_path()
    }

    fn open_connection(&self) -> Result<Connection, ::duckdb::Error> {
        let mut root = lock(&self.inner.root);
        if root.is_none() {
            let connection = Connection::open(self.inner.db_path.as_path())?;
            connection.execute_batch("PRAGMA disable_progress_bar;")?;
            *root = Some(connection);
        }
        match root.as_ref() {
            Some(connection) => connection.try_clone(),
            None => Connection::open(self.inner.db_path.as_path()),
        }
    }
}

impl ConnectionProvider for DuckDbConnectionManager {
    fn acquire_connection(&self, mode: AccessMode) -> Result<PooledConnection, WarehouseError> {
        Ok(self.acquire(mode)?)
    }
}

/// A pooled connection that returns to the pool when dropped.
pub struct PooledConnection {
    mode: AccessMode,
    pool: Arc<PoolInner>,
    connection: Option<Connection>,
}

impl PooledConnection {
    pub fn mode(&self) -> AccessMode {
        self.mode
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.connection
            .as_ref()
            .expect("pooled connection unexpectedly missing")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection
            .as_mut()
            .expect("pooled connection unexpectedly missing")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        let mut state = lock(&self.pool.state);
        let idle = match self.mode {
            AccessMode::ReadOnly => &mut state.read_only,
            AccessMode::ReadWrite => &mut state.read_write,
        };
        if idle.len() < self.pool.max_pool_size {
            idle.push(connection);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn pooled_connections_share_one_database() {
        let temp = tempdir().expect("tempdir");
        let manager = DuckDbConnectionManager::new(temp.path().join("pool.duckdb"), 2);

        let writer = manager.acquire(AccessMode::ReadWrite).expect("writer");
        writer
            .execute_batch("CREATE TABLE t (id INTEGER); INSERT INTO t VALUES (1), (2);")
            .expect("seed");

        let reader = manager.acquire(AccessMode::ReadOnly).expect("reader");
        let count: i64 = reader
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 2);
    }

    #[test]
    fn read_only_mode_is_a_pool_partition_over_the_same_handle() {
        let temp = tempdir().expect("tempdir");
        let manager = DuckDbConnectionManager::new(temp.path().join("pool.duckdb"), 2);

        let reader = manager.acquire(AccessMode::ReadOnly).expect("reader");
        reader
            .execute_batch("CREATE TABLE t (id INTEGER); INSERT INTO t VALUES (1);")
            .expect("the handle itself accepts writes");
        drop(reader);

        let writer = manager.acquire(AccessMode::ReadWrite).expect("writer");
        let count: i64 = writer
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 1);
        assert_eq!(lock(&manager.inner.state).read_only.len(), 1);
    }

    #[test]
    fn idle_connections_are_bounded_per_mode() {
        let temp = tempdir().expect("tempdir");
        let manager = DuckDbConnectionManager::new(temp.path().join("pool.duckdb"), 1);

        let first = manager.acquire(AccessMode::ReadWrite).expect("first");
        let second = manager.acquire(AccessMode::ReadWrite).expect("second");
        assert_eq!(second.mode(), AccessMode::ReadWrite);
        drop(first);
        drop(second);

        assert_eq!(lock(&manager.inner.state).read_write.len(), 1);
        assert!(lock(&manager.inner.state).read_only.is_empty());
    }
}
