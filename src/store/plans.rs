//! Work items, segments and segment tasks.
//!
//! Fan-out happens here: [`Store::commit_plan`] writes the work item, every
//! segment and every segment task in one transaction or not at all.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};

use super::events::insert_event;
use super::{parse_ts, Result, Store, StoreError};
use crate::domain::{
    encode_timestamp, EventType, Segment, SegmentPlan, SegmentTask, Stage, StageEvent, Subject,
    TitleDescription, WorkItem, UNSET_MARKER,
};

const WORK_ITEM_COLUMNS: &str = "id, source_id, directive, title, description, audio_ref, created_at,
     transition_done_at, mix_done_at, render_done_at, publish_done_at";

const SEGMENT_COLUMNS: &str =
    "id, work_item_id, sequence, visual_directive, narration_text, created_at";

const TASK_COLUMNS: &str =
    "id, segment_id, work_item_id, media_done_at, narration_done_at, clip_done_at, caption_done_at";

fn row_to_work_item(row: &Row<'_>) -> rusqlite::Result<WorkItem> {
    Ok(WorkItem {
        id: row.get(0)?,
        source_id: row.get(1)?,
        directive: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        audio_ref: row.get(5)?,
        created_at: parse_ts(&row.get::<_, String>(6)?)?,
        transition_done_at: row.get(7)?,
        mix_done_at: row.get(8)?,
        render_done_at: row.get(9)?,
        publish_done_at: row.get(10)?,
    })
}

fn row_to_segment(row: &Row<'_>) -> rusqlite::Result<Segment> {
    Ok(Segment {
        id: row.get(0)?,
        work_item_id: row.get(1)?,
        sequence: row.get(2)?,
        visual_directive: row.get(3)?,
        narration_text: row.get(4)?,
        created_at: parse_ts(&row.get::<_, String>(5)?)?,
    })
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<SegmentTask> {
    Ok(SegmentTask {
        id: row.get(0)?,
        segment_id: row.get(1)?,
        work_item_id: row.get(2)?,
        media_done_at: row.get(3)?,
        narration_done_at: row.get(4)?,
        clip_done_at: row.get(5)?,
        caption_done_at: row.get(6)?,
    })
}

impl Store {
    /// Atomically create a work item with all of its segments and segment tasks.
    ///
    /// Any failure rolls the whole fan-out back; a partially planned source is
    /// never observable.
    pub fn commit_plan(&self, source_id: i64, directive: &str, plan: &SegmentPlan) -> Result<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = encode_timestamp(Utc::now());

        tx.execute(
            "INSERT INTO work_items (source_id, directive, segment_count, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![source_id, directive, plan.len() as i64, now],
        )?;
        let work_item_id = tx.last_insert_rowid();

        {
            let mut insert_segment = tx.prepare(
                "INSERT INTO segments
                    (work_item_id, sequence, visual_directive, narration_text, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            let mut insert_task = tx.prepare(
                "INSERT INTO segment_tasks (segment_id, work_item_id) VALUES (?1, ?2)",
            )?;

            for segment in plan.segments() {
                insert_segment.execute(params![
                    work_item_id,
                    segment.sequence,
                    segment.visual_directive,
                    segment.narration_text,
                    now,
                ])?;
                let segment_id = tx.last_insert_rowid();
                insert_task.execute(params![segment_id, work_item_id])?;
            }
        }

        insert_event(
            &tx,
            &StageEvent::new(
                Subject::Source(source_id),
                None,
                EventType::Planned,
                format!("work item {work_item_id} with {} segments", plan.len()),
            ),
        )?;

        tx.commit()?;
        Ok(work_item_id)
    }

    pub fn get_work_item(&self, id: i64) -> Result<WorkItem> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE id = ?1"),
            [id],
            row_to_work_item,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("work item {id}")))
    }

    pub fn work_item_for_source(&self, source_id: i64) -> Result<Option<WorkItem>> {
        let conn = self.conn()?;
        let item = conn
            .query_row(
                &format!("SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE source_id = ?1"),
                [source_id],
                row_to_work_item,
            )
            .optional()?;
        Ok(item)
    }

    /// Segments of a work item, ordered by sequence
    pub fn segments_for(&self, work_item_id: i64) -> Result<Vec<Segment>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SEGMENT_COLUMNS} FROM segments WHERE work_item_id = ?1 ORDER BY sequence"
        ))?;
        let segments = stmt
            .query_map([work_item_id], row_to_segment)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(segments)
    }

    pub fn get_segment(&self, id: i64) -> Result<Segment> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {SEGMENT_COLUMNS} FROM segments WHERE id = ?1"),
            [id],
            row_to_segment,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("segment {id}")))
    }

    pub fn get_segment_task(&self, id: i64) -> Result<SegmentTask> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM segment_tasks WHERE id = ?1"),
            [id],
            row_to_task,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("segment task {id}")))
    }

    /// Segment tasks of a work item, ordered by segment sequence
    pub fn segment_tasks_for(&self, work_item_id: i64) -> Result<Vec<SegmentTask>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT t.id, t.segment_id, t.work_item_id, t.media_done_at, t.narration_done_at,
                    t.clip_done_at, t.caption_done_at
             FROM segment_tasks t
             JOIN segments s ON s.id = t.segment_id
             WHERE t.work_item_id = ?1
             ORDER BY s.sequence",
        )?;
        let tasks = stmt
            .query_map([work_item_id], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    pub fn set_title_description(&self, work_item_id: i64, meta: &TitleDescription) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE work_items SET title = ?1, description = ?2 WHERE id = ?3",
            params![meta.title, meta.description, work_item_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("work item {work_item_id}")));
        }
        Ok(())
    }

    pub fn set_audio_ref(&self, work_item_id: i64, audio_ref: &str) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE work_items SET audio_ref = ?1 WHERE id = ?2",
            params![audio_ref, work_item_id],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("work item {work_item_id}")));
        }
        Ok(())
    }

    /// Unpublished work items still missing a title or an audio track
    pub fn items_missing_metadata(&self, limit: usize) -> Result<Vec<WorkItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items
             WHERE (title IS NULL OR audio_ref IS NULL) AND publish_done_at = ?1
             ORDER BY id LIMIT ?2"
        ))?;
        let items = stmt
            .query_map(params![UNSET_MARKER, limit as i64], row_to_work_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    /// Work items whose terminal sentinel is set
    pub fn terminal_items(&self) -> Result<Vec<WorkItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE {} != ?1 ORDER BY id",
            Stage::TERMINAL.sentinel_column()
        ))?;
        let items = stmt
            .query_map([UNSET_MARKER], row_to_work_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    pub fn count_work_items(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM work_items", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    pub fn count_segments(&self) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM segments", [], |r| r.get(0))?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NewSource, PlannedSegment};

    fn store_with_source() -> (Store, i64) {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .insert_source(&NewSource {
                group: "facts".to_string(),
                text: "Honey never spoils if sealed.".to_string(),
                published_at: None,
            })
            .unwrap()
            .unwrap();
        (store, id)
    }

    fn plan(n: u32) -> SegmentPlan {
        let raw = (1..=n)
            .rev()
            .map(|i| PlannedSegment {
                sequence: i,
                visual_directive: format!("jar of honey {i}"),
                narration_text: format!("line {i}"),
            })
            .collect();
        SegmentPlan::validate(raw, n as usize).unwrap()
    }

    #[test]
    fn test_commit_plan_creates_ordered_segments_and_tasks() {
        let (store, source_id) = store_with_source();
        let item_id = store.commit_plan(source_id, "directive", &plan(6)).unwrap();

        let segments = store.segments_for(item_id).unwrap();
        let numbers: Vec<u32> = segments.iter().map(|s| s.sequence).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6]);

        let tasks = store.segment_tasks_for(item_id).unwrap();
        assert_eq!(tasks.len(), 6);
        assert!(tasks.iter().all(|t| !t.media_done_at.is_set()));

        let item = store.get_work_item(item_id).unwrap();
        assert!(item.title.is_none());
        assert!(!item.is_terminal());
        assert!(store.next_unplanned_after(0).unwrap().is_none());
    }

    #[test]
    fn test_source_is_planned_at_most_once() {
        let (store, source_id) = store_with_source();
        store.commit_plan(source_id, "directive", &plan(2)).unwrap();

        let err = store.commit_plan(source_id, "directive", &plan(2)).unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
        assert_eq!(store.count_work_items().unwrap(), 1);
        assert_eq!(store.count_segments().unwrap(), 2);
    }

    #[test]
    fn test_metadata_updates() {
        let (store, source_id) = store_with_source();
        let item_id = store.commit_plan(source_id, "directive", &plan(2)).unwrap();
        assert_eq!(store.items_missing_metadata(10).unwrap().len(), 1);

        store
            .set_title_description(
                item_id,
                &TitleDescription {
                    title: "Honey".to_string(),
                    description: "Forever food".to_string(),
                },
            )
            .unwrap();
        store.set_audio_ref(item_id, "songs/calm/a.mp3").unwrap();

        assert!(store.items_missing_metadata(10).unwrap().is_empty());
        assert!(matches!(
            store.set_audio_ref(999, "x"),
            Err(StoreError::NotFound(_))
        ));
    }
}
