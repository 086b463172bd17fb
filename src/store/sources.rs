//! Source records and deduplication.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use sha2::{Digest, Sha256};

use super::{parse_ts, Result, Store, StoreError};
use crate::domain::{encode_timestamp, NewSource, Source};

/// Dedup key for a normalized text
pub fn text_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn row_to_source(row: &Row<'_>) -> rusqlite::Result<Source> {
    Ok(Source {
        id: row.get(0)?,
        group: row.get(1)?,
        text: row.get(2)?,
        ingested_at: parse_ts(&row.get::<_, String>(3)?)?,
    })
}

impl Store {
    /// Insert a source unless identical text is already stored.
    ///
    /// Returns the new id, or `None` when the text was a duplicate.
    pub fn insert_source(&self, source: &NewSource) -> Result<Option<i64>> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO sources (source_group, text, text_hash, published_at, ingested_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                source.group,
                source.text,
                text_hash(&source.text),
                source.published_at.map(encode_timestamp),
                encode_timestamp(Utc::now()),
            ],
        )?;

        Ok((inserted == 1).then(|| conn.last_insert_rowid()))
    }

    pub fn get_source(&self, id: i64) -> Result<Source> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, source_group, text, ingested_at FROM sources WHERE id = ?1",
            [id],
            row_to_source,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("source {id}")))
    }

    /// Oldest source with no work item and an id greater than `after`.
    ///
    /// The planner walks forward with `after` so a source abandoned earlier in
    /// the same run is not retried until the next run.
    pub fn next_unplanned_after(&self, after: i64) -> Result<Option<Source>> {
        let conn = self.conn()?;
        let source = conn
            .query_row(
                "SELECT s.id, s.source_group, s.text, s.ingested_at
                 FROM sources s
                 LEFT JOIN work_items w ON w.source_id = s.id
                 WHERE w.id IS NULL AND s.id > ?1
                 ORDER BY s.id
                 LIMIT 1",
                [after],
                row_to_source,
            )
            .optional()?;
        Ok(source)
    }

    pub fn count_sources(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sources", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    pub fn count_unplanned(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sources s
             LEFT JOIN work_items w ON w.source_id = s.id
             WHERE w.id IS NULL",
            [],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }
}
