//! storyreel - Stage-tracking orchestrator for short-video generation
//!
//! Turns short text sources into narrated vertical videos through a chain
//! of independently scheduled stage workers that share one SQLite store.
//!
//! # Architecture
//!
//! Progress is tracked per unit and per stage:
//! - Every stage has a completion sentinel column on its unit's row
//! - Workers claim units atomically, so concurrent runs never collide
//! - Item-level stages wait until every segment of the item is captioned
//! - Every claim, completion and failure is appended to an audit log
//!
//! # Modules
//!
//! - `adapters`: External collaborators (Ollama, SD WebUI, edge-tts, whisper, ffmpeg, YouTube)
//! - `core`: Ingest, planning, stage workers, retention
//! - `domain`: Data structures (Stage, Sentinel, records, events)
//! - `store`: SQLite persistence and the claim protocol
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Add sources
//! cat facts.txt | storyreel ingest --group facts
//!
//! # Run one pass of everything
//! storyreel tick
//!
//! # Or run a single stage
//! storyreel work media
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod store;

// Re-export main types at crate root for convenience
pub use config::Settings;
pub use core::{Ingestor, Planner, RetentionSweep, StageWorker};
pub use domain::{Stage, StageStatus, UnitRef};
pub use store::{Store, StoreError};
