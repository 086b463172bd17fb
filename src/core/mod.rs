//! Core orchestration logic.
//!
//! This module contains:
//! - Ingest: Source normalization and deduplication
//! - Feed: RSS and Atom entries as raw sources
//! - Planner: Fan-out of sources into work items and segments
//! - Executor: Stage workers that claim, run and complete units
//! - Retention: Cleanup of finished work items
//! - ResourceLock: Host-wide exclusion for heavy collaborators

pub mod assets;
pub mod captions;
pub mod error;
pub mod executor;
pub mod feed;
pub mod ingest;
pub mod planner;
pub mod prompts;
pub mod resource_lock;
pub mod retention;
pub mod retry;

// Re-export commonly used types
pub use assets::AssetLibrary;
pub use error::StageError;
pub use executor::{StageRunSummary, StageWorker, UnitFailure, WorkerOptions};
pub use feed::{FeedEntry, FeedError, FeedFetcher};
pub use ingest::{normalize_text, IngestSummary, Ingestor};
pub use planner::{EnrichSummary, PlanOutcome, PlanRunSummary, Planner, PlannerOptions};
pub use resource_lock::{Exclusive, ResourceGuard, ResourceLock};
pub use retention::{RetentionSweep, SweepSummary};
pub use retry::RetryPolicy;
