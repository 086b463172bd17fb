//! Stage eligibility and the claim protocol.
//!
//! A claim is a row in `stage_claims`. [`Store::claim_next`] selects and
//! reserves the next eligible unit with a single `INSERT .. SELECT .. RETURNING`
//! inside an IMMEDIATE transaction, so two workers can never hold the same
//! unit for the same stage. Eligibility is recomputed from sentinels on every
//! call; nothing caches readiness.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use super::events::insert_event;
use super::{parse_ts, Result, Store, StoreError};
use crate::domain::{
    encode_timestamp, EventType, Scope, Stage, StageEvent, Subject, UnitRef, UNSET_MARKER,
};

/// A live reservation of one unit for one stage
#[derive(Debug, Clone)]
pub struct Claim {
    /// Identifies this reservation; completion and release must present it
    pub token: Uuid,
    pub unit: UnitRef,
    pub stage: Stage,
    pub worker: String,
    pub claimed_at: DateTime<Utc>,
}

/// Knobs for claiming
#[derive(Debug, Clone)]
pub struct ClaimOptions {
    /// Claims older than this are considered abandoned and are reclaimed
    pub lease: Duration,

    /// Units with this many failures since the last retry are skipped
    pub max_failures: Option<u32>,
}

impl Default for ClaimOptions {
    fn default() -> Self {
        Self {
            lease: Duration::seconds(1800),
            max_failures: None,
        }
    }
}

/// Result of completing a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    /// Sentinel set by this call
    Completed,

    /// Sentinel was already set; nothing changed
    AlreadyDone,

    /// The claim expired and was taken over; the sentinel was not touched
    ClaimLost,
}

/// Eligibility predicate for a stage, as a WHERE clause over alias `u`.
///
/// Parameters: ?1 unit kind, ?2 stage name, ?6 max failures (nullable),
/// ?7 lowest unit id to consider (exclusive).
fn eligibility_clause(stage: Stage) -> String {
    let column = stage.sentinel_column();
    let mut clause = format!("u.id > ?7 AND u.{column} = '{UNSET_MARKER}'");

    if let Some(prereq) = stage.prerequisite() {
        clause.push_str(&format!(
            " AND u.{} != '{UNSET_MARKER}'",
            prereq.sentinel_column()
        ));
    }

    if let Some(required) = stage.fan_in_requirement() {
        clause.push_str(&format!(
            " AND (SELECT COUNT(*) FROM segment_tasks t
                   WHERE t.work_item_id = u.id AND t.{} != '{UNSET_MARKER}') = u.segment_count",
            required.sentinel_column()
        ));
    }

    clause.push_str(
        " AND NOT EXISTS (SELECT 1 FROM stage_claims c
                          WHERE c.unit_kind = ?1 AND c.unit_id = u.id AND c.stage = ?2)
          AND (?6 IS NULL OR (
              SELECT COUNT(*) FROM stage_events e
              WHERE e.subject_kind = ?1 AND e.subject_id = u.id AND e.stage = ?2
                AND e.event_type = 'failed'
                AND e.seq > COALESCE((
                    SELECT MAX(r.seq) FROM stage_events r
                    WHERE r.subject_kind = ?1 AND r.subject_id = u.id AND r.stage = ?2
                      AND r.event_type = 'retry_requested'), 0)
          ) < ?6)",
    );

    clause
}

/// Drop claims whose lease has run out, logging each takeover
fn reclaim_stale(conn: &Connection, stage: Stage, lease: Duration) -> Result<usize> {
    let kind = stage.scope().as_str();
    let cutoff = encode_timestamp(Utc::now() - lease);

    let stale: Vec<(i64, String)> = {
        let mut stmt = conn.prepare(
            "SELECT unit_id, worker FROM stage_claims
             WHERE unit_kind = ?1 AND stage = ?2 AND claimed_at < ?3",
        )?;
        let rows = stmt
            .query_map(params![kind, stage.as_str(), cutoff], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    for (unit_id, worker) in &stale {
        conn.execute(
            "DELETE FROM stage_claims WHERE unit_kind = ?1 AND unit_id = ?2 AND stage = ?3",
            params![kind, unit_id, stage.as_str()],
        )?;
        let unit = UnitRef {
            scope: stage.scope(),
            id: *unit_id,
        };
        insert_event(
            conn,
            &StageEvent::new(
                Subject::Unit(unit),
                Some(stage),
                EventType::Reclaimed,
                format!("lease held by {worker} expired"),
            ),
        )?;
        tracing::warn!(unit = %unit, stage = %stage, previous_worker = %worker, "Reclaimed stale claim");
    }

    Ok(stale.len())
}

fn fan_in_ready_on(conn: &Connection, work_item_id: i64, stage: Stage) -> Result<bool> {
    let Some(required) = stage.fan_in_requirement() else {
        return Ok(true);
    };

    let ready: Option<bool> = conn
        .query_row(
            &format!(
                "SELECT (SELECT COUNT(*) FROM segment_tasks t
                         WHERE t.work_item_id = w.id AND t.{} != ?2) = w.segment_count
                 FROM work_items w WHERE w.id = ?1",
                required.sentinel_column()
            ),
            params![work_item_id, UNSET_MARKER],
            |row| row.get(0),
        )
        .optional()?;

    ready.ok_or_else(|| StoreError::NotFound(format!("work item {work_item_id}")))
}

impl Store {
    /// Atomically select and reserve the next eligible unit for `stage`.
    ///
    /// A unit is eligible when its sentinel for `stage` is unset, its
    /// prerequisite sentinel is set, the fan-in gate passes (item stages),
    /// no live claim exists, and it is not dead-lettered. Returns `None` when
    /// nothing is eligible.
    pub fn claim_next(
        &self,
        stage: Stage,
        worker: &str,
        options: &ClaimOptions,
    ) -> Result<Option<Claim>> {
        self.claim_next_after(stage, worker, options, 0)
    }

    /// Like [`Store::claim_next`], but only considers units with an id
    /// greater than `after`. A draining worker passes the last unit it
    /// attempted so a unit it just failed is not handed straight back.
    pub fn claim_next_after(
        &self,
        stage: Stage,
        worker: &str,
        options: &ClaimOptions,
        after: i64,
    ) -> Result<Option<Claim>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        reclaim_stale(&tx, stage, options.lease)?;

        let scope = stage.scope();
        let token = Uuid::new_v4();
        let now = Utc::now();
        let sql = format!(
            "INSERT INTO stage_claims (unit_kind, unit_id, stage, token, worker, claimed_at)
             SELECT ?1, u.id, ?2, ?3, ?4, ?5
             FROM {table} u
             WHERE {predicate}
             ORDER BY u.id
             LIMIT 1
             RETURNING unit_id",
            table = scope.table(),
            predicate = eligibility_clause(stage),
        );

        let claimed: Option<i64> = tx
            .query_row(
                &sql,
                params![
                    scope.as_str(),
                    stage.as_str(),
                    token.to_string(),
                    worker,
                    encode_timestamp(now),
                    options.max_failures.map(i64::from),
                    after,
                ],
                |row| row.get(0),
            )
            .optional()?;

        let claim = claimed.map(|id| Claim {
            token,
            unit: UnitRef { scope, id },
            stage,
            worker: worker.to_string(),
            claimed_at: now,
        });

        if let Some(claim) = &claim {
            insert_event(
                &tx,
                &StageEvent::new(
                    Subject::Unit(claim.unit),
                    Some(stage),
                    EventType::Claimed,
                    format!("claimed by {worker}"),
                )
                .with_worker(worker),
            )?;
        }

        tx.commit()?;
        Ok(claim)
    }

    /// Set the claimed stage's sentinel and drop the claim.
    ///
    /// The sentinel update and claim removal commit together. Guard triggers
    /// reject a completion that would break stage order or the fan-in gate.
    /// `detail` is appended to the completion event's summary.
    pub fn complete(
        &self,
        claim: &Claim,
        artifact: Option<&Path>,
        detail: Option<&str>,
        duration_ms: u64,
    ) -> Result<CompleteOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let held = tx.execute(
            "DELETE FROM stage_claims WHERE token = ?1",
            [claim.token.to_string()],
        )?;
        if held == 0 {
            tx.commit()?;
            return Ok(CompleteOutcome::ClaimLost);
        }

        let updated = tx.execute(
            &format!(
                "UPDATE {table} SET {column} = ?1 WHERE id = ?2 AND {column} = ?3",
                table = claim.unit.scope.table(),
                column = claim.stage.sentinel_column(),
            ),
            params![encode_timestamp(Utc::now()), claim.unit.id, UNSET_MARKER],
        )?;

        let outcome = if updated == 1 {
            let summary = match detail {
                Some(detail) => format!("{} done: {detail}", claim.stage),
                None => format!("{} done", claim.stage),
            };
            let mut event = StageEvent::new(
                Subject::Unit(claim.unit),
                Some(claim.stage),
                EventType::Completed,
                summary,
            )
            .with_worker(&claim.worker)
            .with_duration(duration_ms);
            if let Some(path) = artifact {
                event = event.with_artifact(path.to_path_buf());
            }
            insert_event(&tx, &event)?;
            CompleteOutcome::Completed
        } else {
            CompleteOutcome::AlreadyDone
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Drop a claim without setting the sentinel.
    ///
    /// With `error` the release is recorded as a failure; without, as a plain
    /// release. Returns false if the claim was no longer held.
    pub fn release(
        &self,
        claim: &Claim,
        error: Option<&str>,
        duration_ms: Option<u64>,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let held = tx.execute(
            "DELETE FROM stage_claims WHERE token = ?1",
            [claim.token.to_string()],
        )?;

        let mut event = match error {
            Some(message) => StageEvent::new(
                Subject::Unit(claim.unit),
                Some(claim.stage),
                EventType::Failed,
                format!("{} failed", claim.stage),
            )
            .with_error(message),
            None => StageEvent::new(
                Subject::Unit(claim.unit),
                Some(claim.stage),
                EventType::Released,
                format!("{} released", claim.stage),
            ),
        }
        .with_worker(&claim.worker);
        if let Some(ms) = duration_ms {
            event = event.with_duration(ms);
        }
        insert_event(&tx, &event)?;

        tx.commit()?;
        Ok(held == 1)
    }

    /// Whether every segment of a work item has the segment-level sentinel
    /// that `stage` fans in on. Always true for segment stages.
    pub fn fan_in_ready(&self, work_item_id: i64, stage: Stage) -> Result<bool> {
        let conn = self.conn()?;
        fan_in_ready_on(&conn, work_item_id, stage)
    }

    /// Clear the failure history of a unit so it is eligible again
    pub fn request_retry(&self, unit: UnitRef, stage: Stage) -> Result<()> {
        if unit.scope != stage.scope() {
            return Err(StoreError::NotFound(format!("{stage} does not run on {unit}")));
        }

        let conn = self.conn()?;
        let exists: Option<i64> = conn
            .query_row(
                &format!("SELECT id FROM {} WHERE id = ?1", unit.scope.table()),
                [unit.id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound(unit.to_string()));
        }

        insert_event(
            &conn,
            &StageEvent::new(
                Subject::Unit(unit),
                Some(stage),
                EventType::RetryRequested,
                "failure history cleared by operator",
            ),
        )
    }

    /// Live claims, oldest first
    pub fn live_claims(&self) -> Result<Vec<Claim>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT token, unit_kind, unit_id, stage, worker, claimed_at
             FROM stage_claims ORDER BY claimed_at",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(token, kind, id, stage, worker, claimed_at)| {
                let scope = match kind.as_str() {
                    "segment" => Scope::Segment,
                    "item" => Scope::Item,
                    other => return Err(StoreError::Corrupt(format!("unit kind {other}"))),
                };
                Ok(Claim {
                    token: Uuid::parse_str(&token)
                        .map_err(|e| StoreError::Corrupt(e.to_string()))?,
                    unit: UnitRef { scope, id },
                    stage: stage
                        .parse()
                        .map_err(|e: anyhow::Error| StoreError::Corrupt(e.to_string()))?,
                    worker,
                    claimed_at: parse_ts(&claimed_at)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewSource, PlannedSegment, SegmentPlan};

    fn planned_store(segments: u32) -> (Store, i64) {
        let store = Store::open_in_memory().unwrap();
        let source = store
            .insert_source(&NewSource {
                group: "facts".to_string(),
                text: "Bananas are berries but strawberries are not.".to_string(),
                published_at: None,
            })
            .unwrap()
            .unwrap();
        let raw = (1..=segments)
            .map(|i| PlannedSegment {
                sequence: i,
                visual_directive: format!("fruit {i}"),
                narration_text: format!("line {i}"),
            })
            .collect();
        let plan = SegmentPlan::validate(raw, segments as usize).unwrap();
        let item = store.commit_plan(source, "directive", &plan).unwrap();
        (store, item)
    }

    fn complete_stage(store: &Store, stage: Stage) {
        let options = ClaimOptions::default();
        while let Some(claim) = store.claim_next(stage, "test", &options).unwrap() {
            assert_eq!(
                store.complete(&claim, None, None, 1).unwrap(),
                CompleteOutcome::Completed
            );
        }
    }

    #[test]
    fn test_claim_is_exclusive_until_released() {
        let (store, _) = planned_store(1);
        let options = ClaimOptions::default();

        let claim = store.claim_next(Stage::Media, "a", &options).unwrap().unwrap();
        assert!(store.claim_next(Stage::Media, "b", &options).unwrap().is_none());

        assert!(store.release(&claim, Some("boom"), None).unwrap());
        let again = store.claim_next(Stage::Media, "b", &options).unwrap().unwrap();
        assert_eq!(again.unit, claim.unit);
        assert_ne!(again.token, claim.token);
    }

    #[test]
    fn test_completed_unit_is_not_claimed_again() {
        let (store, _) = planned_store(1);
        let options = ClaimOptions::default();

        let claim = store.claim_next(Stage::Media, "a", &options).unwrap().unwrap();
        store.complete(&claim, None, None, 5).unwrap();

        assert!(store.claim_next(Stage::Media, "a", &options).unwrap().is_none());
        let task = store.get_segment_task(claim.unit.id).unwrap();
        assert!(task.media_done_at.is_set());
    }

    #[test]
    fn test_prerequisite_gates_next_stage() {
        let (store, _) = planned_store(2);
        let options = ClaimOptions::default();
        assert!(store.claim_next(Stage::Narration, "n", &options).unwrap().is_none());

        let media = store.claim_next(Stage::Media, "m", &options).unwrap().unwrap();
        store.complete(&media, None, None, 1).unwrap();

        let narration = store.claim_next(Stage::Narration, "n", &options).unwrap().unwrap();
        assert_eq!(narration.unit, media.unit);
    }

    #[test]
    fn test_item_stage_waits_for_every_segment() {
        let (store, item) = planned_store(3);
        complete_stage(&store, Stage::Media);
        complete_stage(&store, Stage::Narration);
        complete_stage(&store, Stage::Clip);

        let options = ClaimOptions::default();
        let first = store.claim_next(Stage::Caption, "c", &options).unwrap().unwrap();
        store.complete(&first, None, None, 1).unwrap();
        assert!(!store.fan_in_ready(item, Stage::Transition).unwrap());
        assert!(store.claim_next(Stage::Transition, "t", &options).unwrap().is_none());

        complete_stage(&store, Stage::Caption);
        assert!(store.fan_in_ready(item, Stage::Transition).unwrap());
        let transition = store.claim_next(Stage::Transition, "t", &options).unwrap().unwrap();
        assert_eq!(transition.unit, UnitRef::work_item(item));
    }

    #[test]
    fn test_expired_lease_is_reclaimed() {
        let (store, _) = planned_store(1);
        let stale = store
            .claim_next(Stage::Media, "crashed", &ClaimOptions::default())
            .unwrap()
            .unwrap();

        let short = ClaimOptions {
            lease: Duration::zero() - Duration::seconds(1),
            max_failures: None,
        };
        let fresh = store.claim_next(Stage::Media, "b", &short).unwrap().unwrap();
        assert_eq!(fresh.unit, stale.unit);

        // The crashed worker's late completion must not touch the sentinel
        assert_eq!(
            store.complete(&stale, None, None, 1).unwrap(),
            CompleteOutcome::ClaimLost
        );
        assert_eq!(store.complete(&fresh, None, None, 1).unwrap(), CompleteOutcome::Completed);

        let events = store
            .events_for(Subject::Unit(stale.unit), Some(Stage::Media))
            .unwrap();
        assert!(events.iter().any(|e| e.event_type == EventType::Reclaimed));
    }

    #[test]
    fn test_dead_lettered_unit_is_skipped_until_retry() {
        let (store, _) = planned_store(1);
        let options = ClaimOptions {
            max_failures: Some(2),
            ..ClaimOptions::default()
        };

        for _ in 0..2 {
            let claim = store.claim_next(Stage::Media, "m", &options).unwrap().unwrap();
            store.release(&claim, Some("image service down"), Some(10)).unwrap();
        }
        assert!(store.claim_next(Stage::Media, "m", &options).unwrap().is_none());

        store.request_retry(UnitRef::segment_task(1), Stage::Media).unwrap();
        assert!(store.claim_next(Stage::Media, "m", &options).unwrap().is_some());
    }

    #[test]
    fn test_sentinel_cannot_be_rewritten() {
        let (store, _) = planned_store(1);
        complete_stage(&store, Stage::Media);

        let conn = store.conn().unwrap();
        let err: StoreError = conn
            .execute(
                "UPDATE segment_tasks SET media_done_at = ?1 WHERE id = 1",
                [UNSET_MARKER],
            )
            .unwrap_err()
            .into();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
    }

    #[test]
    fn test_item_sentinel_rejected_before_fan_in() {
        let (store, item) = planned_store(2);
        let conn = store.conn().unwrap();
        let err: StoreError = conn
            .execute(
                "UPDATE work_items SET transition_done_at = '2025-01-01 00:00:00.000000'
                 WHERE id = ?1",
                [item],
            )
            .unwrap_err()
            .into();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
    }

    #[test]
    fn test_cursor_skips_lower_ids() {
        let (store, _) = planned_store(3);
        let options = ClaimOptions::default();

        let first = store.claim_next(Stage::Media, "m", &options).unwrap().unwrap();
        store.release(&first, Some("flaky"), None).unwrap();

        let next = store
            .claim_next_after(Stage::Media, "m", &options, first.unit.id)
            .unwrap()
            .unwrap();
        assert!(next.unit.id > first.unit.id);

        let last = store.claim_next_after(Stage::Media, "m", &options, 3).unwrap();
        assert!(last.is_none());
    }

    #[test]
    fn test_completion_detail_lands_in_event() {
        let (store, _) = planned_store(1);
        let claim = store
            .claim_next(Stage::Media, "m", &ClaimOptions::default())
            .unwrap()
            .unwrap();
        store
            .complete(&claim, None, Some("remote id abc123"), 7)
            .unwrap();

        let events = store
            .events_for(Subject::Unit(claim.unit), Some(Stage::Media))
            .unwrap();
        let done = events
            .iter()
            .find(|e| e.event_type == EventType::Completed)
            .unwrap();
        assert!(done.payload_summary.contains("abc123"));
        assert_eq!(done.duration_ms, Some(7));
    }

    #[test]
    fn test_live_claims_are_listed() {
        let (store, _) = planned_store(2);
        let options = ClaimOptions::default();
        let claim = store.claim_next(Stage::Media, "m", &options).unwrap().unwrap();

        let live = store.live_claims().unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].token, claim.token);
        assert_eq!(live[0].stage, Stage::Media);
    }
}
