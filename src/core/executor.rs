//! Stage workers.
//!
//! A [`StageWorker`] claims eligible units of one stage, calls the stage's
//! collaborator under a timeout and either completes the claim (setting the
//! sentinel) or releases it with the error. Failures stay with their unit:
//! the worker logs them and moves on to the next eligible unit.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::assets::{transitions_for, AssetLibrary};
use super::captions::{group_words, render_ass, CaptionLimits};
use super::error::StageError;
use crate::adapters::youtube::publish_title;
use crate::adapters::Collaborators;
use crate::domain::{ArtifactKind, ArtifactLayout, Scope, Stage, UnitRef};
use crate::store::{Claim, ClaimOptions, CompleteOutcome, Store};

/// Default narration voice
pub const DEFAULT_VOICE: &str = "en-US-AvaNeural";

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub claim: ClaimOptions,

    /// Bound on one unit's collaborator work
    pub timeout: Duration,

    /// Keep claiming until nothing is eligible; otherwise stop after one unit
    pub drain: bool,

    /// Voice passed to the speech synthesizer
    pub voice: String,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            claim: ClaimOptions::default(),
            timeout: Duration::from_secs(600),
            drain: true,
            voice: DEFAULT_VOICE.to_string(),
        }
    }
}

/// A unit whose attempt failed during a run
#[derive(Debug, Clone, Serialize)]
pub struct UnitFailure {
    pub unit: UnitRef,
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRunSummary {
    pub stage: Stage,
    pub claimed: usize,
    pub completed: usize,
    /// Sentinel was already set when the claim completed
    pub already_done: usize,
    /// Claim expired and was taken over before completion
    pub lost: usize,
    pub failures: Vec<UnitFailure>,
}

impl StageRunSummary {
    fn new(stage: Stage) -> Self {
        Self {
            stage,
            claimed: 0,
            completed: 0,
            already_done: 0,
            lost: 0,
            failures: Vec::new(),
        }
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// What a successful attempt produced
struct StageOutput {
    artifact: PathBuf,
    detail: Option<String>,
}

impl StageOutput {
    fn artifact(artifact: PathBuf) -> Self {
        Self {
            artifact,
            detail: None,
        }
    }
}

pub struct StageWorker {
    stage: Stage,
    worker_id: String,
    store: Store,
    collaborators: Collaborators,
    layout: ArtifactLayout,
    assets: AssetLibrary,
    options: WorkerOptions,
}

/// Run a store call on the blocking pool.
///
/// Claim, completion and release take the write lock and may wait out the
/// busy timeout behind workers in other processes.
async fn on_blocking_pool<T, F>(
    store: &Store,
    call: F,
) -> Result<crate::store::Result<T>, tokio::task::JoinError>
where
    T: Send + 'static,
    F: FnOnce(&Store) -> crate::store::Result<T> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || call(&store)).await
}

async fn write_artifact(path: &Path, bytes: &[u8]) -> Result<(), StageError> {
    ensure_parent(path).await?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

async fn ensure_parent(path: &Path) -> Result<(), StageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

impl StageWorker {
    pub fn new(
        stage: Stage,
        worker_id: impl Into<String>,
        store: Store,
        collaborators: Collaborators,
        layout: ArtifactLayout,
        assets: AssetLibrary,
        options: WorkerOptions,
    ) -> Self {
        Self {
            stage,
            worker_id: worker_id.into(),
            store,
            collaborators,
            layout,
            assets,
            options,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Process eligible units of this stage.
    ///
    /// Only store failures end the run early; unit failures are recorded in
    /// the summary.
    #[instrument(skip(self), fields(stage = %self.stage, worker = %self.worker_id))]
    pub async fn run(&self) -> Result<StageRunSummary> {
        let mut summary = StageRunSummary::new(self.stage);
        let mut cursor = 0;

        while let Some(claim) = self.claim_after(cursor).await? {
            cursor = claim.unit.id;
            summary.claimed += 1;
            self.process(&claim, &mut summary).await?;

            if !self.options.drain {
                break;
            }
        }

        info!(
            claimed = summary.claimed,
            completed = summary.completed,
            failed = summary.failed(),
            lost = summary.lost,
            "Stage run finished"
        );
        Ok(summary)
    }

    async fn claim_after(&self, cursor: i64) -> Result<Option<Claim>> {
        let stage = self.stage;
        let worker_id = self.worker_id.clone();
        let options = self.options.claim.clone();
        let claim = on_blocking_pool(&self.store, move |store| {
            store.claim_next_after(stage, &worker_id, &options, cursor)
        })
        .await??;
        Ok(claim)
    }

    #[instrument(skip(self, claim, summary), fields(unit = %claim.unit))]
    async fn process(&self, claim: &Claim, summary: &mut StageRunSummary) -> Result<()> {
        let started = Instant::now();
        let attempt = match tokio::time::timeout(self.options.timeout, self.execute(claim)).await {
            Ok(result) => result,
            Err(_) => Err(StageError::Timeout(self.options.timeout)),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let output = match attempt {
            Ok(output) => output,
            Err(e) => return self.fail(claim, e, duration_ms, summary).await,
        };

        let completing = claim.clone();
        let artifact = output.artifact.clone();
        let detail = output.detail.clone();
        let completion = on_blocking_pool(&self.store, move |store| {
            store.complete(&completing, Some(&artifact), detail.as_deref(), duration_ms)
        })
        .await?;

        match completion {
            Ok(CompleteOutcome::Completed) => {
                info!(duration_ms, artifact = %output.artifact.display(), "Stage completed");
                summary.completed += 1;
            }
            Ok(CompleteOutcome::AlreadyDone) => {
                debug!("Sentinel already set");
                summary.already_done += 1;
            }
            Ok(CompleteOutcome::ClaimLost) => {
                warn!("Claim was reclaimed before completion; result discarded");
                summary.lost += 1;
            }
            // The completion rolled back, so the claim is still ours to release
            Err(e) => {
                return self
                    .fail(claim, StageError::from(e), duration_ms, summary)
                    .await
            }
        }
        Ok(())
    }

    async fn fail(
        &self,
        claim: &Claim,
        err: StageError,
        duration_ms: u64,
        summary: &mut StageRunSummary,
    ) -> Result<()> {
        let message = err.to_string();
        if err.needs_operator() {
            error!(kind = err.kind(), error = %message, "Unit needs operator attention");
        } else {
            warn!(kind = err.kind(), error = %message, "Stage attempt failed");
        }

        let releasing = claim.clone();
        let error = message.clone();
        let released = on_blocking_pool(&self.store, move |store| {
            store.release(&releasing, Some(&error), Some(duration_ms))
        })
        .await??;
        if !released {
            warn!("Claim was already gone at release");
        }
        summary.failures.push(UnitFailure {
            unit: claim.unit,
            kind: err.kind(),
            message,
        });
        Ok(())
    }

    /// Path of an artifact an earlier stage must have written
    fn require(&self, kind: ArtifactKind, id: i64) -> Result<PathBuf, StageError> {
        let path = self.layout.path_for(kind, id);
        if path.is_file() {
            Ok(path)
        } else {
            Err(StageError::fatal(format!(
                "missing {kind:?} artifact {} although its stage is done",
                path.display()
            )))
        }
    }

    async fn execute(&self, claim: &Claim) -> Result<StageOutput, StageError> {
        let c = &self.collaborators;
        // Keyed by segment id for segment stages and by work item id otherwise
        let key = match claim.unit.scope {
            Scope::Segment => self.store.get_segment_task(claim.unit.id)?.segment_id,
            Scope::Item => claim.unit.id,
        };
        let output = self
            .layout
            .path_for(ArtifactKind::produced_by(self.stage), key);

        match self.stage {
            Stage::Media => {
                let segment = self.store.get_segment(key)?;
                let image = c.images.synthesize_image(&segment.visual_directive).await?;
                write_artifact(&output, &image).await?;
            }
            Stage::Narration => {
                let segment = self.store.get_segment(key)?;
                let audio = c
                    .speech
                    .synthesize_speech(&segment.narration_text, &self.options.voice)
                    .await?;
                write_artifact(&output, &audio).await?;
            }
            Stage::Clip => {
                let segment = self.store.get_segment(key)?;
                let image = self.require(ArtifactKind::SegmentImage, segment.id)?;
                let narration = self.require(ArtifactKind::SegmentNarration, segment.id)?;
                let overlay = self.assets.overlay_for(segment.id);
                ensure_parent(&output).await?;
                c.media
                    .render_clip(&image, &narration, overlay.as_deref(), &output)
                    .await?;
            }
            Stage::Caption => {
                let segment = self.store.get_segment(key)?;
                let clip = self.require(ArtifactKind::SegmentClip, segment.id)?;
                let words = c.transcriber.transcribe(&clip).await?;
                if words.is_empty() {
                    return Err(StageError::Validation(format!(
                        "no words transcribed from {}",
                        clip.display()
                    )));
                }

                let words_path = self.layout.path_for(ArtifactKind::SegmentWords, segment.id);
                let words_json = serde_json::to_vec_pretty(&words)
                    .map_err(|e| StageError::Validation(e.to_string()))?;
                write_artifact(&words_path, &words_json).await?;

                let lines = group_words(&words, &CaptionLimits::default());
                let subtitles = self
                    .layout
                    .path_for(ArtifactKind::SegmentSubtitles, segment.id);
                write_artifact(&subtitles, render_ass(&lines).as_bytes()).await?;

                c.media.burn_captions(&clip, &subtitles, &output).await?;
            }
            Stage::Transition => {
                let segments = self.store.segments_for(claim.unit.id)?;
                let clips = segments
                    .iter()
                    .map(|s| self.require(ArtifactKind::SegmentCaptioned, s.id))
                    .collect::<Result<Vec<_>, _>>()?;
                if clips.len() < 2 {
                    return Err(StageError::fatal(format!(
                        "need at least 2 captioned clips to stitch, found {}",
                        clips.len()
                    )));
                }
                ensure_parent(&output).await?;
                let transitions = transitions_for(claim.unit.id, clips.len() - 1);
                c.media.stitch(&clips, &transitions, &output).await?;
            }
            Stage::Mix => {
                let item = self.store.get_work_item(claim.unit.id)?;
                let video = self.require(ArtifactKind::StitchedVideo, item.id)?;
                let track = item
                    .audio_ref
                    .as_deref()
                    .map(PathBuf::from)
                    .filter(|p| p.is_file())
                    .or_else(|| self.assets.fallback_track(item.id))
                    .ok_or_else(|| StageError::fatal("no background track available"))?;

                let scratch = self.layout.path_for(ArtifactKind::MixScratch, item.id);
                tokio::fs::create_dir_all(&scratch).await?;
                ensure_parent(&output).await?;
                c.media.mix_audio(&video, &track, &scratch, &output).await?;
            }
            Stage::Render => {
                let video = self.require(ArtifactKind::StitchedVideo, claim.unit.id)?;
                let audio = self.require(ArtifactKind::MixedAudio, claim.unit.id)?;
                ensure_parent(&output).await?;
                c.media.mux(&video, &audio, &output).await?;
            }
            Stage::Publish => {
                let item = self.store.get_work_item(claim.unit.id)?;
                let video = self.require(ArtifactKind::FinalVideo, item.id)?;
                let title = publish_title(item.title.as_deref());
                let description = item.description.unwrap_or_default();
                let remote_id = c.publisher.publish(&video, &title, &description).await?;
                info!(%remote_id, "Published");
                return Ok(StageOutput {
                    artifact: video,
                    detail: Some(format!("remote id {remote_id}")),
                });
            }
        }

        Ok(StageOutput::artifact(output))
    }
}
