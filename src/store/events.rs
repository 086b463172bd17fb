//! Append-only stage event log.

use std::path::PathBuf;

use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use super::{parse_ts, Result, Store, StoreError};
use crate::domain::{encode_timestamp, EventType, Stage, StageEvent, Subject, UnitRef};

const EVENT_COLUMNS: &str =
    "id, ts, subject_kind, subject_id, stage, event_type, worker, summary, duration_ms, error, artifact";

/// Append an event on an existing connection or transaction
pub(crate) fn insert_event(conn: &Connection, event: &StageEvent) -> Result<()> {
    let (kind, id) = event.subject.key();
    conn.execute(
        "INSERT INTO stage_events
            (id, ts, subject_kind, subject_id, stage, event_type, worker, summary,
             duration_ms, error, artifact)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            event.id.to_string(),
            encode_timestamp(event.timestamp),
            kind,
            id,
            event.stage.map(|s| s.as_str()),
            event.event_type.as_str(),
            event.worker,
            event.payload_summary,
            event.duration_ms.map(|d| d as i64),
            event.error,
            event.artifact.as_ref().map(|p| p.to_string_lossy().into_owned()),
        ],
    )?;
    Ok(())
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<StageEvent> {
    let conversion = |idx: usize, msg: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
    };

    let id: String = row.get(0)?;
    let ts: String = row.get(1)?;
    let kind: String = row.get(2)?;
    let subject_id: i64 = row.get(3)?;
    let stage: Option<String> = row.get(4)?;
    let event_type: String = row.get(5)?;

    Ok(StageEvent {
        id: Uuid::parse_str(&id).map_err(|e| conversion(0, e.to_string()))?,
        timestamp: parse_ts(&ts)?,
        subject: Subject::from_key(&kind, subject_id)
            .ok_or_else(|| conversion(2, format!("unknown subject kind: {kind}")))?,
        stage: stage
            .map(|s| s.parse::<Stage>().map_err(|e| conversion(4, e.to_string())))
            .transpose()?,
        event_type: EventType::parse(&event_type)
            .ok_or_else(|| conversion(5, format!("unknown event type: {event_type}")))?,
        worker: row.get(6)?,
        payload_summary: row.get(7)?,
        duration_ms: row.get::<_, Option<i64>>(8)?.map(|d| d.max(0) as u64),
        error: row.get(9)?,
        artifact: row.get::<_, Option<String>>(10)?.map(PathBuf::from),
    })
}

/// Most recent event type for a unit and stage
pub(crate) fn last_event_type(
    conn: &Connection,
    unit: UnitRef,
    stage: Stage,
) -> Result<Option<EventType>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT event_type FROM stage_events
             WHERE subject_kind = ?1 AND subject_id = ?2 AND stage = ?3
             ORDER BY seq DESC LIMIT 1",
            params![unit.scope.as_str(), unit.id, stage.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    raw.map(|s| {
        EventType::parse(&s).ok_or_else(|| StoreError::Corrupt(format!("event type {s}")))
    })
    .transpose()
}

/// Failures recorded since the last operator retry
pub(crate) fn failures_since_retry(conn: &Connection, unit: UnitRef, stage: Stage) -> Result<u32> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM stage_events e
         WHERE e.subject_kind = ?1 AND e.subject_id = ?2 AND e.stage = ?3
           AND e.event_type = 'failed'
           AND e.seq > COALESCE((
               SELECT MAX(r.seq) FROM stage_events r
               WHERE r.subject_kind = ?1 AND r.subject_id = ?2 AND r.stage = ?3
                 AND r.event_type = 'retry_requested'), 0)",
        params![unit.scope.as_str(), unit.id, stage.as_str()],
        |row| row.get(0),
    )?;
    Ok(count as u32)
}

impl Store {
    pub fn append_event(&self, event: &StageEvent) -> Result<()> {
        let conn = self.conn()?;
        insert_event(&conn, event)
    }

    /// Events for a subject in append order, optionally limited to one stage
    pub fn events_for(&self, subject: Subject, stage: Option<Stage>) -> Result<Vec<StageEvent>> {
        let conn = self.conn()?;
        let (kind, id) = subject.key();
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM stage_events
             WHERE subject_kind = ?1 AND subject_id = ?2 AND (?3 IS NULL OR stage = ?3)
             ORDER BY seq"
        );
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map(params![kind, id, stage.map(|s| s.as_str())], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// The last `limit` events across all subjects, newest first
    pub fn recent_events(&self, limit: usize) -> Result<Vec<StageEvent>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {EVENT_COLUMNS} FROM stage_events ORDER BY seq DESC LIMIT ?1");
        let mut stmt = conn.prepare(&sql)?;
        let events = stmt
            .query_map([limit as i64], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    pub fn failure_count(&self, unit: UnitRef, stage: Stage) -> Result<u32> {
        let conn = self.conn()?;
        failures_since_retry(&conn, unit, stage)
    }
}
