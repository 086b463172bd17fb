//! Embedded schema migrations.
//!
//! Migrations are compiled into the binary and applied in order, recorded in
//! `schema_migrations`. The version check and every pending migration share
//! one IMMEDIATE transaction, so processes opening a fresh database together
//! apply each migration exactly once.

use rusqlite::{Connection, Transaction, TransactionBehavior};
use thiserror::Error;

/// Migration error types
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Migration {0} failed: {1}")]
    Failed(usize, String),
}

struct Migration {
    version: usize,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial",
        sql: include_str!("001_initial.sql"),
    },
    Migration {
        version: 2,
        name: "stage_guards",
        sql: include_str!("002_stage_guards.sql"),
    },
];

fn init_migrations_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY NOT NULL,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;
    Ok(())
}

fn get_current_version(conn: &Connection) -> rusqlite::Result<usize> {
    conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
        row.get::<_, Option<usize>>(0)
    })
    .map(|v| v.unwrap_or(0))
}

fn apply_migration(conn: &Connection, migration: &Migration) -> Result<(), MigrationError> {
    conn.execute_batch(migration.sql)
        .map_err(|e| MigrationError::Failed(migration.version, e.to_string()))?;

    conn.execute(
        "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![migration.version, migration.name],
    )
    .map_err(|e| MigrationError::Failed(migration.version, e.to_string()))?;

    Ok(())
}

/// Run all pending migrations, returning how many were applied
pub fn run_migrations(conn: &Connection) -> Result<usize, MigrationError> {
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    init_migrations_table(&tx)?;
    let current = get_current_version(&tx)?;

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    for migration in &pending {
        apply_migration(&tx, migration)?;
    }
    tx.commit().map_err(|e| {
        MigrationError::Failed(pending.last().map(|m| m.version).unwrap_or(current), e.to_string())
    })?;

    for migration in &pending {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applied migration"
        );
    }

    Ok(pending.len())
}

/// Current schema version without applying anything
pub fn current_version(conn: &Connection) -> Result<usize, MigrationError> {
    init_migrations_table(conn)?;
    Ok(get_current_version(conn)?)
}

pub fn latest_version() -> usize {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_migrations() {
        let conn = Connection::open_in_memory().unwrap();

        let applied = run_migrations(&conn).unwrap();
        assert_eq!(applied, MIGRATIONS.len());
        assert_eq!(current_version(&conn).unwrap(), latest_version());

        // Second run is a no-op
        assert_eq!(run_migrations(&conn).unwrap(), 0);
    }

    #[test]
    fn test_schema_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        for table in [
            "sources",
            "work_items",
            "segments",
            "segment_tasks",
            "stage_claims",
            "stage_events",
            "schema_migrations",
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "Table {} should exist", table);
        }
    }

    #[test]
    fn test_sentinel_columns_default_to_unset_marker() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        conn.execute_batch(
            "INSERT INTO sources (source_group, text, text_hash, ingested_at)
                 VALUES ('g', 'some text', 'h', '2024-01-01 00:00:00.000000');
             INSERT INTO work_items (source_id, directive, segment_count, created_at)
                 VALUES (1, 'd', 1, '2024-01-01 00:00:00.000000');",
        )
        .unwrap();

        let raw: String = conn
            .query_row("SELECT publish_done_at FROM work_items WHERE id = 1", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(raw, crate::domain::UNSET_MARKER);
    }
}
