//! Derived stage status.
//!
//! Sentinels, live claims and the last logged event combine into a
//! [`StageStatus`]. Nothing here is stored.

use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::events::last_event_type;
use super::{Result, Store, StoreError};
use crate::domain::{Sentinel, Stage, StageStatus, UnitRef, UNSET_MARKER};

/// Per-stage unit counts for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageCounts {
    pub stage: Stage,
    pub pending: u64,
    pub claimed: u64,
    pub done: u64,
    pub failed: u64,
}

impl StageCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.claimed + self.done + self.failed
    }
}

impl Store {
    /// Stored sentinel of one unit for one stage
    pub fn sentinel(&self, unit: UnitRef, stage: Stage) -> Result<Sentinel> {
        if unit.scope != stage.scope() {
            return Err(StoreError::NotFound(format!("{stage} does not run on {unit}")));
        }

        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM {} WHERE id = ?1",
                stage.sentinel_column(),
                unit.scope.table()
            ),
            [unit.id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(unit.to_string()))
    }

    /// Derived status of one unit for one stage
    pub fn unit_status(&self, unit: UnitRef, stage: Stage) -> Result<StageStatus> {
        let sentinel = self.sentinel(unit, stage)?;

        let conn = self.conn()?;
        let claimed: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM stage_claims
                            WHERE unit_kind = ?1 AND unit_id = ?2 AND stage = ?3)",
            params![unit.scope.as_str(), unit.id, stage.as_str()],
            |row| row.get(0),
        )?;
        let last = last_event_type(&conn, unit, stage)?;

        Ok(StageStatus::derive(sentinel.is_set(), claimed, last))
    }

    /// Counts of pending, claimed, done and failed units for every stage
    pub fn stage_report(&self) -> Result<Vec<StageCounts>> {
        let conn = self.conn()?;
        let mut report = Vec::with_capacity(Stage::ALL.len());

        for stage in Stage::ALL {
            let scope = stage.scope();
            let column = stage.sentinel_column();
            let sql = format!(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(u.{column} != ?3), 0),
                    COALESCE(SUM(u.{column} = ?3 AND c.unit_id IS NOT NULL), 0),
                    COALESCE(SUM(u.{column} = ?3 AND c.unit_id IS NULL AND (
                        SELECT e.event_type FROM stage_events e
                        WHERE e.subject_kind = ?1 AND e.subject_id = u.id AND e.stage = ?2
                        ORDER BY e.seq DESC LIMIT 1) = 'failed'), 0)
                 FROM {table} u
                 LEFT JOIN stage_claims c
                    ON c.unit_kind = ?1 AND c.unit_id = u.id AND c.stage = ?2",
                table = scope.table(),
            );

            let (total, done, claimed, failed): (i64, i64, i64, i64) = conn.query_row(
                &sql,
                params![scope.as_str(), stage.as_str(), UNSET_MARKER],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;

            report.push(StageCounts {
                stage,
                pending: (total - done - claimed - failed).max(0) as u64,
                claimed: claimed as u64,
                done: done as u64,
                failed: failed as u64,
            });
        }

        Ok(report)
    }
}
