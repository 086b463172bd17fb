//! Processing stages and their dependency order.
//!
//! Segment-level stages run per [`SegmentTask`](super::SegmentTask); item-level
//! stages run per [`WorkItem`](super::WorkItem) once the fan-in gate passes.

use serde::{Deserialize, Serialize};

/// Which kind of unit a stage operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// One row per segment (`segment_tasks`)
    Segment,

    /// One row per planned source (`work_items`)
    Item,
}

impl Scope {
    /// Table holding the sentinels for this scope
    pub fn table(&self) -> &'static str {
        match self {
            Scope::Segment => "segment_tasks",
            Scope::Item => "work_items",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Segment => "segment",
            Scope::Item => "item",
        }
    }
}

/// A single processing stage with its own completion sentinel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Still image for the segment's visual directive
    Media,

    /// Spoken narration for the segment's text
    Narration,

    /// Image + narration rendered into a video clip
    Clip,

    /// Word-level captions burned into the clip
    Caption,

    /// All captioned clips stitched with transitions
    Transition,

    /// Narration track mixed with background music
    Mix,

    /// Stitched video muxed with the mixed audio
    Render,

    /// Final video published to the remote channel
    Publish,
}

impl Stage {
    /// Every stage, in dependency order
    pub const ALL: [Stage; 8] = [
        Stage::Media,
        Stage::Narration,
        Stage::Clip,
        Stage::Caption,
        Stage::Transition,
        Stage::Mix,
        Stage::Render,
        Stage::Publish,
    ];

    /// The terminal stage; its sentinel marks a work item as finished
    pub const TERMINAL: Stage = Stage::Publish;

    pub fn scope(&self) -> Scope {
        match self {
            Stage::Media | Stage::Narration | Stage::Clip | Stage::Caption => Scope::Segment,
            Stage::Transition | Stage::Mix | Stage::Render | Stage::Publish => Scope::Item,
        }
    }

    /// Same-scope stage whose sentinel must be set before this one may start
    pub fn prerequisite(&self) -> Option<Stage> {
        match self {
            Stage::Media => None,
            Stage::Narration => Some(Stage::Media),
            Stage::Clip => Some(Stage::Narration),
            Stage::Caption => Some(Stage::Clip),
            Stage::Transition => None,
            Stage::Mix => Some(Stage::Transition),
            Stage::Render => Some(Stage::Mix),
            Stage::Publish => Some(Stage::Render),
        }
    }

    /// Segment-level stage every child segment must have completed before
    /// an item-level stage is eligible.
    ///
    /// All item stages gate on the last segment stage, re-evaluated on every
    /// claim, so a later item stage never depends on a stale readiness flag.
    pub fn fan_in_requirement(&self) -> Option<Stage> {
        match self.scope() {
            Scope::Segment => None,
            Scope::Item => Some(Stage::Caption),
        }
    }

    /// Column storing this stage's completion sentinel
    pub fn sentinel_column(&self) -> &'static str {
        match self {
            Stage::Media => "media_done_at",
            Stage::Narration => "narration_done_at",
            Stage::Clip => "clip_done_at",
            Stage::Caption => "caption_done_at",
            Stage::Transition => "transition_done_at",
            Stage::Mix => "mix_done_at",
            Stage::Render => "render_done_at",
            Stage::Publish => "publish_done_at",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Media => "media",
            Stage::Narration => "narration",
            Stage::Clip => "clip",
            Stage::Caption => "caption",
            Stage::Transition => "transition",
            Stage::Mix => "mix",
            Stage::Render => "render",
            Stage::Publish => "publish",
        }
    }

    /// All stages operating on the given scope, in order
    pub fn in_scope(scope: Scope) -> impl Iterator<Item = Stage> {
        Self::ALL.into_iter().filter(move |s| s.scope() == scope)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s.to_lowercase())
            .ok_or_else(|| anyhow::anyhow!("Unknown stage: {}", s))
    }
}

/// Derived status of one unit for one stage.
///
/// The sentinel timestamp is the audit record; this is what scheduling
/// and reporting reason about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not started, or released after an earlier attempt
    Pending,

    /// Held by a worker with a live claim
    Claimed,

    /// Completion sentinel is set
    Done,

    /// Last attempt failed; retried on a later pass unless dead-lettered
    Failed,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Pending => write!(f, "pending"),
            StageStatus::Claimed => write!(f, "claimed"),
            StageStatus::Done => write!(f, "done"),
            StageStatus::Failed => write!(f, "failed"),
        }
    }
}
