//! Whisper transcription backend.
//!
//! Shells out to the local whisper binary with word timestamps enabled and
//! reads back its JSON output.

use std::ffi::OsStr;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

use super::process::run_tool;
use super::{CollaboratorError, Transcriber, WordTiming};

pub struct WhisperTranscriber {
    binary: String,
    model: String,
}

/// Whisper output JSON structure
#[derive(Debug, Deserialize)]
struct WhisperOutput {
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    #[serde(default)]
    words: Vec<WhisperWord>,
}

#[derive(Debug, Deserialize)]
struct WhisperWord {
    word: String,
    start: f64,
    end: f64,
}

impl WhisperTranscriber {
    pub fn new(binary: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            model: model.into(),
        }
    }
}

/// Flatten whisper's segments into trimmed, non-empty words
fn words_from_output(json: &str) -> Result<Vec<WordTiming>, CollaboratorError> {
    let whisper: WhisperOutput = serde_json::from_str(json)
        .map_err(|e| CollaboratorError::Validation(format!("whisper JSON: {e}")))?;

    Ok(whisper
        .segments
        .into_iter()
        .flat_map(|s| s.words)
        .filter_map(|w| {
            let word = w.word.trim();
            (!word.is_empty()).then(|| WordTiming {
                word: word.to_string(),
                start: w.start,
                end: w.end,
            })
        })
        .collect())
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    fn name(&self) -> &str {
        "whisper"
    }

    async fn transcribe(&self, media: &Path) -> Result<Vec<WordTiming>, CollaboratorError> {
        let temp_dir = tempfile::tempdir()
            .map_err(|e| CollaboratorError::transient(format!("failed to create temp dir: {e}")))?;

        run_tool(
            &self.binary,
            [
                media.as_os_str(),
                OsStr::new("--model"),
                OsStr::new(&self.model),
                OsStr::new("--output_dir"),
                temp_dir.path().as_os_str(),
                OsStr::new("--output_format"),
                OsStr::new("json"),
                OsStr::new("--word_timestamps"),
                OsStr::new("True"),
                OsStr::new("--language"),
                OsStr::new("en"),
            ],
        )
        .await?;

        let stem = media.file_stem().unwrap_or_default().to_string_lossy();
        let json_path = temp_dir.path().join(format!("{stem}.json"));
        let json = tokio::fs::read_to_string(&json_path).await.map_err(|e| {
            CollaboratorError::transient(format!("failed to read whisper output: {e}"))
        })?;

        words_from_output(&json)
    }
}
