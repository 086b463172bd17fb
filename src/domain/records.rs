//! Persisted records: sources, work items, segments and segment tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::sentinel::Sentinel;
use super::stage::{Scope, Stage};

/// A deduplicated raw content unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,

    /// Origin tag (feed name)
    pub group: String,

    /// Normalized text; unique across the store
    pub text: String,

    pub ingested_at: DateTime<Utc>,
}

/// A source waiting to be inserted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSource {
    pub group: String,
    pub text: String,

    /// Publication time reported by the origin, if any
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

/// One planned source, carrying the item-level stage sentinels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub source_id: i64,

    /// Prompt used to generate the segment plan
    pub directive: String,

    pub title: Option<String>,
    pub description: Option<String>,

    /// Background track chosen for the mix stage
    pub audio_ref: Option<String>,

    pub created_at: DateTime<Utc>,
    pub transition_done_at: Sentinel,
    pub mix_done_at: Sentinel,
    pub render_done_at: Sentinel,
    pub publish_done_at: Sentinel,
}

impl WorkItem {
    /// Sentinel for an item-level stage
    pub fn sentinel(&self, stage: Stage) -> Option<Sentinel> {
        match stage {
            Stage::Transition => Some(self.transition_done_at),
            Stage::Mix => Some(self.mix_done_at),
            Stage::Render => Some(self.render_done_at),
            Stage::Publish => Some(self.publish_done_at),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.sentinel(Stage::TERMINAL)
            .is_some_and(|s| s.is_set())
    }
}

/// Ordered child of a work item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: i64,
    pub work_item_id: i64,

    /// 1-based position within the work item
    pub sequence: u32,

    /// Prompt for the image generator
    pub visual_directive: String,

    /// Text spoken over the segment
    pub narration_text: String,

    pub created_at: DateTime<Utc>,
}

/// Segment-level stage sentinels, 1:1 with a [`Segment`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentTask {
    pub id: i64,
    pub segment_id: i64,
    pub work_item_id: i64,
    pub media_done_at: Sentinel,
    pub narration_done_at: Sentinel,
    pub clip_done_at: Sentinel,
    pub caption_done_at: Sentinel,
}

impl SegmentTask {
    /// Sentinel for a segment-level stage
    pub fn sentinel(&self, stage: Stage) -> Option<Sentinel> {
        match stage {
            Stage::Media => Some(self.media_done_at),
            Stage::Narration => Some(self.narration_done_at),
            Stage::Clip => Some(self.clip_done_at),
            Stage::Caption => Some(self.caption_done_at),
            _ => None,
        }
    }
}

/// Identifies the unit a stage operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitRef {
    pub scope: Scope,

    /// `segment_tasks.id` or `work_items.id`
    pub id: i64,
}

impl UnitRef {
    pub fn segment_task(id: i64) -> Self {
        Self {
            scope: Scope::Segment,
            id,
        }
    }

    pub fn work_item(id: i64) -> Self {
        Self {
            scope: Scope::Item,
            id,
        }
    }
}

impl std::fmt::Display for UnitRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scope.as_str(), self.id)
    }
}
