//! Shared fixtures: a file-backed store and in-process fake collaborators.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use storyreel::adapters::{
    CollaboratorError, Collaborators, ImageSynthesizer, MediaTools, Publisher, SpeechSynthesizer,
    StructuredGenerator, Transcriber, WordTiming,
};
use storyreel::config::Settings;
use storyreel::core::{Planner, RetryPolicy, StageWorker, WorkerOptions};
use storyreel::domain::{
    Genre, NewSource, OutputShape, PlannedSegment, SegmentPlan, Stage, StructuredOutput,
    TitleDescription,
};
use storyreel::store::Store;

/// Temp home with a store, an artifact root and one installed track
pub struct Harness {
    pub dir: TempDir,
    pub settings: Settings,
    pub store: Store,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let settings = Settings::for_home(dir.path());
        let calm = settings.paths.songs.join("calm");
        std::fs::create_dir_all(&calm).unwrap();
        std::fs::write(calm.join("waves.mp3"), b"mp3").unwrap();

        let store = Store::open(&settings.paths.database).unwrap();
        Self {
            dir,
            settings,
            store,
        }
    }

    pub fn add_source(&self, text: &str) -> i64 {
        self.store
            .insert_source(&NewSource {
                group: "facts".to_string(),
                text: text.to_string(),
                published_at: None,
            })
            .unwrap()
            .unwrap()
    }

    /// Source plus a committed plan with `segments` segments
    pub fn planned_item(&self, text: &str, segments: u32) -> i64 {
        let source = self.add_source(text);
        let plan = SegmentPlan::validate(planned_segments(segments), segments as usize).unwrap();
        self.store.commit_plan(source, "directive", &plan).unwrap()
    }

    pub fn worker(&self, stage: Stage, collaborators: &Collaborators) -> StageWorker {
        self.worker_with(stage, collaborators, |_| {})
    }

    pub fn worker_with(
        &self,
        stage: Stage,
        collaborators: &Collaborators,
        tweak: impl FnOnce(&mut WorkerOptions),
    ) -> StageWorker {
        let mut options = self.settings.worker_options(stage).unwrap();
        options.timeout = Duration::from_secs(5);
        tweak(&mut options);
        StageWorker::new(
            stage,
            format!("test-{stage}"),
            self.store.clone(),
            collaborators.clone(),
            self.settings.layout(),
            self.settings.assets(),
            options,
        )
    }

    /// Planner with millisecond backoff so retry tests stay fast
    pub fn planner(&self, generator: Arc<dyn StructuredGenerator>) -> Planner {
        let mut options = self.settings.planner_options();
        options.retry = RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
        };
        options.timeout = Duration::from_secs(5);
        Planner::new(
            self.store.clone(),
            generator,
            self.settings.assets(),
            options,
        )
    }

    pub fn artifacts(&self) -> &Path {
        &self.settings.paths.artifacts
    }
}

pub fn planned_segments(count: u32) -> Vec<PlannedSegment> {
    (1..=count)
        .map(|n| PlannedSegment {
            sequence: n,
            visual_directive: format!("image {n}"),
            narration_text: format!("Narration for scene {n}."),
        })
        .collect()
}

/// Returns a plan of `segments` scenes, counting planning calls
pub struct FakeGenerator {
    pub segments: Mutex<u32>,
    pub plan_calls: AtomicUsize,
}

impl FakeGenerator {
    pub fn new(segments: u32) -> Self {
        Self {
            segments: Mutex::new(segments),
            plan_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl StructuredGenerator for FakeGenerator {
    fn name(&self) -> &str {
        "fake-generator"
    }

    async fn generate(
        &self,
        _prompt: &str,
        shape: OutputShape,
    ) -> Result<StructuredOutput, CollaboratorError> {
        match shape {
            OutputShape::SegmentList => {
                self.plan_calls.fetch_add(1, Ordering::SeqCst);
                let count = *self.segments.lock().unwrap();
                Ok(StructuredOutput::Segments(planned_segments(count)))
            }
            OutputShape::TitleDescription => {
                Ok(StructuredOutput::TitleDescription(TitleDescription {
                    title: "A fact".to_string(),
                    description: "Did you know?".to_string(),
                }))
            }
            OutputShape::Genre => Ok(StructuredOutput::Genre(Genre {
                genre: "calm".to_string(),
            })),
        }
    }
}

/// Writes a tiny PNG; stalls on directives listed in `stall_on`
pub struct FakeImages {
    pub stall_on: Mutex<Vec<String>>,
}

impl FakeImages {
    pub fn new() -> Self {
        Self {
            stall_on: Mutex::new(Vec::new()),
        }
    }

    pub fn stalling_on(directive: &str) -> Self {
        Self {
            stall_on: Mutex::new(vec![directive.to_string()]),
        }
    }

    pub fn recover(&self) {
        self.stall_on.lock().unwrap().clear();
    }
}

#[async_trait]
impl ImageSynthesizer for FakeImages {
    fn name(&self) -> &str {
        "fake-images"
    }

    async fn synthesize_image(&self, directive: &str) -> Result<Vec<u8>, CollaboratorError> {
        let stall = self
            .stall_on
            .lock()
            .unwrap()
            .iter()
            .any(|d| d == directive);
        if stall {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Ok(b"\x89PNG".to_vec())
    }
}

pub struct FakeSpeech;

#[async_trait]
impl SpeechSynthesizer for FakeSpeech {
    fn name(&self) -> &str {
        "fake-speech"
    }

    async fn synthesize_speech(
        &self,
        text: &str,
        _voice: &str,
    ) -> Result<Vec<u8>, CollaboratorError> {
        Ok(text.as_bytes().to_vec())
    }
}

pub struct FakeTranscriber;

#[async_trait]
impl Transcriber for FakeTranscriber {
    fn name(&self) -> &str {
        "fake-transcriber"
    }

    async fn transcribe(&self, _media: &Path) -> Result<Vec<WordTiming>, CollaboratorError> {
        Ok(vec![
            WordTiming {
                word: "Did".to_string(),
                start: 2.0,
                end: 2.3,
            },
            WordTiming {
                word: "you".to_string(),
                start: 2.3,
                end: 2.5,
            },
            WordTiming {
                word: "know?".to_string(),
                start: 2.5,
                end: 3.0,
            },
        ])
    }
}

/// Writes a marker file for every output; records stitch inputs
#[derive(Default)]
pub struct FakeMedia {
    pub stitched: Mutex<Vec<Vec<PathBuf>>>,
    pub transitions: Mutex<Vec<Vec<String>>>,
}

fn touch(path: &Path, content: &str) -> Result<(), CollaboratorError> {
    std::fs::write(path, content).map_err(|e| CollaboratorError::permanent(e.to_string()))
}

#[async_trait]
impl MediaTools for FakeMedia {
    async fn render_clip(
        &self,
        _image: &Path,
        _narration: &Path,
        _overlay: Option<&Path>,
        output: &Path,
    ) -> Result<(), CollaboratorError> {
        touch(output, "clip")
    }

    async fn burn_captions(
        &self,
        _video: &Path,
        subtitles: &Path,
        output: &Path,
    ) -> Result<(), CollaboratorError> {
        if !subtitles.is_file() {
            return Err(CollaboratorError::permanent("subtitles missing"));
        }
        touch(output, "captioned")
    }

    async fn stitch(
        &self,
        clips: &[PathBuf],
        transitions: &[&str],
        output: &Path,
    ) -> Result<(), CollaboratorError> {
        assert_eq!(transitions.len(), clips.len() - 1);
        self.stitched.lock().unwrap().push(clips.to_vec());
        self.transitions
            .lock()
            .unwrap()
            .push(transitions.iter().map(|t| t.to_string()).collect());
        touch(output, "stitched")
    }

    async fn mix_audio(
        &self,
        _video: &Path,
        track: &Path,
        _scratch: &Path,
        output: &Path,
    ) -> Result<(), CollaboratorError> {
        touch(output, &track.display().to_string())
    }

    async fn mux(
        &self,
        _video: &Path,
        _audio: &Path,
        output: &Path,
    ) -> Result<(), CollaboratorError> {
        touch(output, "final")
    }
}

#[derive(Default)]
pub struct FakePublisher {
    pub published: Mutex<Vec<String>>,
}

#[async_trait]
impl Publisher for FakePublisher {
    fn name(&self) -> &str {
        "fake-publisher"
    }

    async fn publish(
        &self,
        _video: &Path,
        title: &str,
        _description: &str,
    ) -> Result<String, CollaboratorError> {
        let mut published = self.published.lock().unwrap();
        published.push(title.to_string());
        Ok(format!("vid-{}", published.len()))
    }
}

/// Handles to the fakes behind a [`Collaborators`]
pub struct Fakes {
    pub generator: Arc<FakeGenerator>,
    pub images: Arc<FakeImages>,
    pub media: Arc<FakeMedia>,
    pub publisher: Arc<FakePublisher>,
}

impl Fakes {
    pub fn new(images: FakeImages) -> Self {
        Self {
            generator: Arc::new(FakeGenerator::new(6)),
            images: Arc::new(images),
            media: Arc::new(FakeMedia::default()),
            publisher: Arc::new(FakePublisher::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            generator: self.generator.clone(),
            images: self.images.clone(),
            speech: Arc::new(FakeSpeech),
            transcriber: Arc::new(FakeTranscriber),
            media: self.media.clone(),
            publisher: self.publisher.clone(),
        }
    }
}
