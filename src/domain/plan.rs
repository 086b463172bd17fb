//! Structured generation shapes and segment plan validation.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default number of segments per work item (the last is the call-to-action)
pub const DEFAULT_SEGMENT_COUNT: usize = 6;

/// Background music genres the generator may choose from
pub const GENRES: [&str; 8] = [
    "bright",
    "calm",
    "dark",
    "dramatic",
    "funky",
    "happy",
    "inspirational",
    "sad",
];

/// Genre used when the generator's choice is unusable
pub const FALLBACK_GENRE: &str = "calm";

/// One segment as returned by the generator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedSegment {
    /// 1-based sequence number
    #[serde(rename = "scene")]
    pub sequence: u32,

    /// Visual directive for the image generator
    #[serde(rename = "image")]
    pub visual_directive: String,

    /// Narration text
    #[serde(rename = "text")]
    pub narration_text: String,
}

/// Raw generator output for the planning request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneList {
    pub scenes: Vec<PlannedSegment>,
}

/// Title and description for the published video
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TitleDescription {
    pub title: String,
    pub description: String,
}

/// Genre label used to pick a background track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genre {
    pub genre: String,
}

impl Genre {
    /// The chosen genre if it is one of the known ones, else the fallback
    pub fn normalized(&self) -> &str {
        let g = self.genre.trim();
        GENRES
            .iter()
            .find(|known| known.eq_ignore_ascii_case(g))
            .copied()
            .unwrap_or(FALLBACK_GENRE)
    }
}

/// Which structured shape a generation request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputShape {
    SegmentList,
    TitleDescription,
    Genre,
}

impl OutputShape {
    /// JSON schema handed to the generator to constrain its output
    pub fn json_schema(&self) -> serde_json::Value {
        match self {
            OutputShape::SegmentList => serde_json::json!({
                "type": "object",
                "properties": {
                    "scenes": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "scene": { "type": "integer" },
                                "image": { "type": "string" },
                                "text": { "type": "string" }
                            },
                            "required": ["scene", "image", "text"]
                        }
                    }
                },
                "required": ["scenes"]
            }),
            OutputShape::TitleDescription => serde_json::json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string" },
                    "description": { "type": "string" }
                },
                "required": ["title", "description"]
            }),
            OutputShape::Genre => serde_json::json!({
                "type": "object",
                "properties": {
                    "genre": { "type": "string", "enum": GENRES }
                },
                "required": ["genre"]
            }),
        }
    }

    /// Parse raw generator text into the requested shape
    pub fn parse(&self, raw: &str) -> Result<StructuredOutput, PlanValidationError> {
        let malformed = |e: serde_json::Error| PlanValidationError::Malformed(e.to_string());
        match self {
            OutputShape::SegmentList => {
                let list: SceneList = serde_json::from_str(raw).map_err(malformed)?;
                Ok(StructuredOutput::Segments(list.scenes))
            }
            OutputShape::TitleDescription => serde_json::from_str(raw)
                .map(StructuredOutput::TitleDescription)
                .map_err(malformed),
            OutputShape::Genre => serde_json::from_str(raw)
                .map(StructuredOutput::Genre)
                .map_err(malformed),
        }
    }
}

/// Result of a structured generation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuredOutput {
    Segments(Vec<PlannedSegment>),
    TitleDescription(TitleDescription),
    Genre(Genre),
}

/// Generator output rejected by validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanValidationError {
    #[error("Malformed generator output: {0}")]
    Malformed(String),

    #[error("Expected {expected} segments, got {actual}")]
    WrongCount { expected: usize, actual: usize },

    #[error("Segment numbers must be exactly 1..={expected}, got {actual:?}")]
    NonContiguous { expected: usize, actual: Vec<u32> },

    #[error("Segment {0} has an empty directive or narration")]
    EmptySegment(u32),

    #[error("Expected {expected:?} output, got a different shape")]
    WrongShape { expected: OutputShape },
}

/// A segment list that passed validation, sorted by sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPlan {
    segments: Vec<PlannedSegment>,
}

impl SegmentPlan {
    /// Validate a raw segment list.
    ///
    /// Requires exactly `count` segments whose sequence numbers are the set
    /// `{1..=count}` in any order, each with non-empty text.
    pub fn validate(
        mut segments: Vec<PlannedSegment>,
        count: usize,
    ) -> Result<Self, PlanValidationError> {
        if segments.len() != count {
            return Err(PlanValidationError::WrongCount {
                expected: count,
                actual: segments.len(),
            });
        }

        let numbers: BTreeSet<u32> = segments.iter().map(|s| s.sequence).collect();
        let expected: BTreeSet<u32> = (1..=count as u32).collect();
        if numbers != expected {
            let mut actual: Vec<u32> = segments.iter().map(|s| s.sequence).collect();
            actual.sort_unstable();
            return Err(PlanValidationError::NonContiguous {
                expected: count,
                actual,
            });
        }

        if let Some(empty) = segments.iter().find(|s| {
            s.visual_directive.trim().is_empty() || s.narration_text.trim().is_empty()
        }) {
            return Err(PlanValidationError::EmptySegment(empty.sequence));
        }

        segments.sort_by_key(|s| s.sequence);
        Ok(Self { segments })
    }

    pub fn segments(&self) -> &[PlannedSegment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}
