//! Speech synthesis through the `edge-tts` command line tool.

use std::ffi::OsStr;

use async_trait::async_trait;

use super::process::run_tool;
use super::{CollaboratorError, SpeechSynthesizer};

pub struct EdgeTts {
    binary: String,
}

impl EdgeTts {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for EdgeTts {
    fn name(&self) -> &str {
        "edge-tts"
    }

    async fn synthesize_speech(
        &self,
        text: &str,
        voice: &str,
    ) -> Result<Vec<u8>, CollaboratorError> {
        let temp_dir = tempfile::tempdir()
            .map_err(|e| CollaboratorError::transient(format!("failed to create temp dir: {e}")))?;
        let media = temp_dir.path().join("speech.mp3");

        run_tool(
            &self.binary,
            [
                OsStr::new("--voice"),
                OsStr::new(voice),
                OsStr::new("--text"),
                OsStr::new(text),
                OsStr::new("--write-media"),
                media.as_os_str(),
            ],
        )
        .await?;

        let bytes = tokio::fs::read(&media).await.map_err(|e| {
            CollaboratorError::transient(format!("edge-tts produced no audio: {e}"))
        })?;
        if bytes.is_empty() {
            return Err(CollaboratorError::Validation("edge-tts wrote an empty file".into()));
        }

        Ok(bytes)
    }
}
