//! Durable item store.
//!
//! SQLite behind an r2d2 pool. Every multi-row change (fan-out commit, claim,
//! completion, release) runs in a single IMMEDIATE transaction so concurrent
//! workers in other processes serialize on the write lock instead of racing.
//!
//! Store methods take at most one pooled connection at a time. The in-memory
//! pool has a single connection, so nesting would deadlock.

pub mod claims;
pub mod events;
pub mod migrations;
pub mod plans;
pub mod sources;
pub mod status;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::ErrorCode;
use thiserror::Error;

use crate::domain::decode_timestamp;

pub use claims::{Claim, ClaimOptions, CompleteOutcome};
pub use migrations::MigrationError;
pub use status::StageCounts;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// How long a connection waits on another writer before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// A schema constraint or guard trigger rejected the write; the
    /// surrounding transaction was rolled back.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid stored value: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, msg)
                if e.code == ErrorCode::ConstraintViolation =>
            {
                StoreError::ConstraintViolation(msg.clone().unwrap_or_else(|| e.to_string()))
            }
            _ => StoreError::Database(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Handle to the pipeline database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: DbPool,
}

impl Store {
    /// Open (creating if needed) a file-backed store and run migrations
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Corrupt(format!(
                        "cannot create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.pragma_update(None, "foreign_keys", true)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            Ok(())
        });

        let pool = Pool::builder().max_size(4).build(manager)?;
        Self::from_pool(pool)
    }

    /// In-memory store for tests. Single connection, lost on drop.
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.pragma_update(None, "foreign_keys", true));

        let pool = Pool::builder().max_size(1).build(manager)?;
        Self::from_pool(pool)
    }

    fn from_pool(pool: DbPool) -> Result<Self> {
        let conn = pool.get()?;
        migrations::run_migrations(&conn)?;
        drop(conn);
        Ok(Self { pool })
    }

    /// Borrow a pooled connection
    pub fn conn(&self) -> Result<PooledConnection> {
        Ok(self.pool.get()?)
    }
}

/// Read a stored timestamp column
pub(crate) fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    decode_timestamp(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("invalid timestamp: {raw}").into(),
        )
    })
}
