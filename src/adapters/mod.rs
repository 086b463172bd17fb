//! Collaborator interfaces for external systems.
//!
//! Stage workers only see these traits. Each implementation wraps one
//! generative service or media tool; none of them touches the store.

pub mod ffmpeg;
pub mod ollama;
mod process;
pub mod sdwebui;
pub mod tts;
pub mod whisper;
pub mod youtube;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Settings;
use crate::core::resource_lock::{Exclusive, ResourceLock};
use crate::domain::{OutputShape, PlanValidationError, StructuredOutput};

pub use ffmpeg::FfmpegTools;
pub use ollama::OllamaGenerator;
pub use sdwebui::SdWebUi;
pub use tts::EdgeTts;
pub use whisper::WhisperTranscriber;
pub use youtube::YouTubePublisher;

/// Why a collaborator call failed
#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    /// Service unavailable or overloaded; retry on a later pass
    #[error("{0}")]
    Transient(String),

    /// The request itself was rejected; retrying the same input will not help
    #[error("{0}")]
    Permanent(String),

    /// Output arrived but did not have the requested shape
    #[error("invalid output: {0}")]
    Validation(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl CollaboratorError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Whether a later pass may succeed without operator action
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

impl From<PlanValidationError> for CollaboratorError {
    fn from(err: PlanValidationError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) if status.is_client_error() => Self::Permanent(err.to_string()),
            _ => Self::Transient(err.to_string()),
        }
    }
}

/// One transcribed word with its timing in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTiming {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

/// Structured text generation (planning and metadata)
#[async_trait]
pub trait StructuredGenerator: Send + Sync {
    fn name(&self) -> &str;

    /// Generate output of the given shape for a prompt.
    ///
    /// Output that does not parse into `shape` is a `Validation` error.
    async fn generate(
        &self,
        prompt: &str,
        shape: OutputShape,
    ) -> Result<StructuredOutput, CollaboratorError>;
}

#[async_trait]
pub trait ImageSynthesizer: Send + Sync {
    fn name(&self) -> &str;

    /// PNG bytes for a visual directive
    async fn synthesize_image(&self, directive: &str) -> Result<Vec<u8>, CollaboratorError>;
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    fn name(&self) -> &str;

    /// MP3 bytes of `text` spoken with `voice`
    async fn synthesize_speech(&self, text: &str, voice: &str)
        -> Result<Vec<u8>, CollaboratorError>;
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    fn name(&self) -> &str;

    /// Word-level timings of the speech in a media file, in order
    async fn transcribe(&self, media: &Path) -> Result<Vec<WordTiming>, CollaboratorError>;
}

/// Video and audio filtering and muxing
#[async_trait]
pub trait MediaTools: Send + Sync {
    /// Loop a still image under an optional overlay, with narration on top
    async fn render_clip(
        &self,
        image: &Path,
        narration: &Path,
        overlay: Option<&Path>,
        output: &Path,
    ) -> Result<(), CollaboratorError>;

    /// Burn an ASS subtitle file into a video
    async fn burn_captions(
        &self,
        video: &Path,
        subtitles: &Path,
        output: &Path,
    ) -> Result<(), CollaboratorError>;

    /// Join clips in order; `transitions[i]` joins clip `i` to clip `i + 1`
    async fn stitch(
        &self,
        clips: &[PathBuf],
        transitions: &[&str],
        output: &Path,
    ) -> Result<(), CollaboratorError>;

    /// Mix a video's soundtrack with a looping background track.
    ///
    /// `scratch` is a directory the tool may use for intermediates.
    async fn mix_audio(
        &self,
        video: &Path,
        track: &Path,
        scratch: &Path,
        output: &Path,
    ) -> Result<(), CollaboratorError>;

    /// Replace a video's audio with `audio`
    async fn mux(&self, video: &Path, audio: &Path, output: &Path)
        -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &str;

    /// Upload the final video, returning the remote identifier
    async fn publish(
        &self,
        video: &Path,
        title: &str,
        description: &str,
    ) -> Result<String, CollaboratorError>;
}

/// Everything a stage worker or planner may call
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn StructuredGenerator>,
    pub images: Arc<dyn ImageSynthesizer>,
    pub speech: Arc<dyn SpeechSynthesizer>,
    pub transcriber: Arc<dyn Transcriber>,
    pub media: Arc<dyn MediaTools>,
    pub publisher: Arc<dyn Publisher>,
}

impl Collaborators {
    /// Production collaborators built from settings.
    ///
    /// The language and image services share one host lock so they never
    /// run at the same time.
    pub fn from_settings(settings: &Settings) -> Self {
        let services = &settings.services;
        let lock = ResourceLock::new(settings.paths.home.join("gpu.lock"));
        let lock_wait = Duration::from_secs(settings.pipeline.resource_lock_wait_seconds);

        Self {
            generator: Arc::new(Exclusive::new(
                OllamaGenerator::new(&services.ollama_url, &services.ollama_model),
                lock.clone(),
                lock_wait,
            )),
            images: Arc::new(Exclusive::new(
                SdWebUi::new(&services.image_api_url),
                lock,
                lock_wait,
            )),
            speech: Arc::new(EdgeTts::new(&services.tts_binary)),
            transcriber: Arc::new(WhisperTranscriber::new(
                &services.whisper_binary,
                &services.whisper_model,
            )),
            media: Arc::new(FfmpegTools::new(&services.ffmpeg_binary, &services.ffprobe_binary)),
            publisher: Arc::new(YouTubePublisher::new(
                &services.publish_endpoint,
                &services.publish_token_url,
                &settings.paths.credentials,
            )),
        }
    }
}
