//! Domain types for the storyreel orchestrator.
//!
//! This module contains the core data structures:
//! - Stage: Processing stages and their dependency order
//! - Sentinel: Completion markers stored per stage
//! - Records: Sources, work items, segments and segment tasks
//! - Plan: Structured generation shapes and validation
//! - Artifact: Stage outputs and their storage keys
//! - Events: Audit log entries

pub mod artifact;
pub mod events;
pub mod plan;
pub mod records;
pub mod sentinel;
pub mod stage;

// Re-export commonly used types
pub use artifact::{ArtifactKind, ArtifactLayout};
pub use events::{EventType, StageEvent, Subject};
pub use plan::{
    Genre, OutputShape, PlanValidationError, PlannedSegment, SegmentPlan, StructuredOutput,
    TitleDescription,
};
pub use records::{NewSource, Segment, SegmentTask, Source, UnitRef, WorkItem};
pub use sentinel::{decode_timestamp, encode_timestamp, Sentinel, UNSET_MARKER};
pub use stage::{Scope, Stage, StageStatus};
