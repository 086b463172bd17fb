//! Audit events for stage progression.
//!
//! Every claim, completion, failure and release is appended to the
//! `stage_events` table. Sentinels remain the source of truth for completion;
//! the log explains how a unit got there.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::records::UnitRef;
use super::stage::{Scope, Stage, StageStatus};

/// What an event is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Subject {
    /// A source record (planning events)
    Source(i64),

    /// A work item or segment task (stage events)
    Unit(UnitRef),
}

impl Subject {
    /// Stored `(subject_kind, subject_id)` pair
    pub fn key(&self) -> (&'static str, i64) {
        match self {
            Subject::Source(id) => ("source", *id),
            Subject::Unit(unit) => (unit.scope.as_str(), unit.id),
        }
    }

    pub fn from_key(kind: &str, id: i64) -> Option<Self> {
        match kind {
            "source" => Some(Subject::Source(id)),
            "segment" => Some(Subject::Unit(UnitRef::segment_task(id))),
            "item" => Some(Subject::Unit(UnitRef {
                scope: Scope::Item,
                id,
            })),
            _ => None,
        }
    }
}

/// A single entry in the append-only audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred
    pub timestamp: DateTime<Utc>,

    pub subject: Subject,

    /// Stage this event concerns (None for planning events)
    pub stage: Option<Stage>,

    pub event_type: EventType,

    /// Worker that emitted the event
    pub worker: Option<String>,

    /// Human-readable summary (NO secrets)
    pub payload_summary: String,

    /// Time spent in the collaborator, for completions and failures
    pub duration_ms: Option<u64>,

    /// Error message if failed
    pub error: Option<String>,

    /// Artifact written by a completed stage
    pub artifact: Option<PathBuf>,
}

impl StageEvent {
    /// Create a new event with the current timestamp
    pub fn new(
        subject: Subject,
        stage: Option<Stage>,
        event_type: EventType,
        payload_summary: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            subject,
            stage,
            event_type,
            worker: None,
            payload_summary: payload_summary.into(),
            duration_ms: None,
            error: None,
            artifact: None,
        }
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_artifact(mut self, artifact: PathBuf) -> Self {
        self.artifact = Some(artifact);
        self
    }
}

/// Types of events recorded in the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Source planned into a work item and segments
    Planned,

    /// Planning gave up on a source for this run
    Abandoned,

    /// A worker claimed a unit for a stage
    Claimed,

    /// A stale claim was taken over after its lease expired
    Reclaimed,

    /// Stage finished and its sentinel was set
    Completed,

    /// Stage failed; the claim was released and the sentinel left unset
    Failed,

    /// Claim released without an attempt (e.g. shutdown)
    Released,

    /// Operator cleared the failure history for a unit
    RetryRequested,

    /// Intermediate artifacts of a finished item were removed
    Swept,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Planned => "planned",
            EventType::Abandoned => "abandoned",
            EventType::Claimed => "claimed",
            EventType::Reclaimed => "reclaimed",
            EventType::Completed => "completed",
            EventType::Failed => "failed",
            EventType::Released => "released",
            EventType::RetryRequested => "retry_requested",
            EventType::Swept => "swept",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "planned" => EventType::Planned,
            "abandoned" => EventType::Abandoned,
            "claimed" => EventType::Claimed,
            "reclaimed" => EventType::Reclaimed,
            "completed" => EventType::Completed,
            "failed" => EventType::Failed,
            "released" => EventType::Released,
            "retry_requested" => EventType::RetryRequested,
            "swept" => EventType::Swept,
            _ => return None,
        })
    }
}

impl StageStatus {
    /// Derive a unit's status for one stage.
    ///
    /// `last_event` is the most recent audit event for that unit and stage.
    pub fn derive(sentinel_set: bool, claimed: bool, last_event: Option<EventType>) -> Self {
        if sentinel_set {
            StageStatus::Done
        } else if claimed {
            StageStatus::Claimed
        } else if last_event == Some(EventType::Failed) {
            StageStatus::Failed
        } else {
            StageStatus::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let event = StageEvent::new(
            Subject::Unit(UnitRef::segment_task(4)),
            Some(Stage::Media),
            EventType::Failed,
            "Media generation failed",
        )
        .with_worker("media-1")
        .with_duration(1500)
        .with_error("Connection timeout");

        assert_eq!(event.duration_ms, Some(1500));
        assert_eq!(event.error.as_deref(), Some("Connection timeout"));
        assert_eq!(event.subject.key(), ("segment", 4));
    }

    #[test]
    fn test_event_type_names_round_trip() {
        for event_type in [
            EventType::Planned,
            EventType::Abandoned,
            EventType::Claimed,
            EventType::Reclaimed,
            EventType::Completed,
            EventType::Failed,
            EventType::Released,
            EventType::RetryRequested,
            EventType::Swept,
        ] {
            assert_eq!(EventType::parse(event_type.as_str()), Some(event_type));
        }
    }

    #[test]
    fn test_status_derivation() {
        assert_eq!(
            StageStatus::derive(true, false, Some(EventType::Failed)),
            StageStatus::Done
        );
        assert_eq!(StageStatus::derive(false, true, None), StageStatus::Claimed);
        assert_eq!(
            StageStatus::derive(false, false, Some(EventType::Failed)),
            StageStatus::Failed
        );
        assert_eq!(
            StageStatus::derive(false, false, Some(EventType::RetryRequested)),
            StageStatus::Pending
        );
    }
}
