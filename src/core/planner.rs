//! Fan-out: turn an unplanned source into a work item with ordered segments.
//!
//! The generator is asked for a segment list up to `retry.max_attempts` times.
//! Only a list that passes [`SegmentPlan::validate`] is committed, and the
//! commit writes the work item, every segment and every segment task in one
//! transaction. A source that never yields a valid plan is left unplanned and
//! picked up again on a later run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::instrument;

use super::assets::AssetLibrary;
use super::prompts::{genre_prompt, segment_prompt, title_prompt};
use super::retry::RetryPolicy;
use crate::adapters::{CollaboratorError, StructuredGenerator};
use crate::domain::plan::{DEFAULT_SEGMENT_COUNT, FALLBACK_GENRE};
use crate::domain::{
    EventType, OutputShape, PlanValidationError, PlannedSegment, SegmentPlan, Source, StageEvent,
    StructuredOutput, Subject, WorkItem,
};
use crate::store::{Store, StoreError};

#[derive(Debug, Clone)]
pub struct PlannerOptions {
    /// Segments per work item
    pub segment_count: usize,

    /// Attempt bound and backoff for the planning request
    pub retry: RetryPolicy,

    /// Bound on each generator call
    pub timeout: Duration,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self {
            segment_count: DEFAULT_SEGMENT_COUNT,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(600),
        }
    }
}

/// What happened to one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    Planned { work_item_id: i64, attempts: u32 },

    /// Nothing was committed; the source stays unplanned
    Abandoned { attempts: u32, reason: String },

    /// Another planner committed this source first
    PlannedElsewhere { work_item_id: i64 },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PlanRunSummary {
    pub planned: usize,
    pub abandoned: usize,
    /// Sources a concurrent planner got to first
    pub planned_elsewhere: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichSummary {
    /// Items that received a title and description
    pub titled: usize,

    /// Items that received a background track
    pub scored: usize,

    /// Requests that failed and will be retried on the next pass
    pub failed: usize,
}

pub struct Planner {
    store: Store,
    generator: Arc<dyn StructuredGenerator>,
    assets: AssetLibrary,
    options: PlannerOptions,
}

fn expect_segments(output: StructuredOutput) -> Result<Vec<PlannedSegment>, PlanValidationError> {
    match output {
        StructuredOutput::Segments(segments) => Ok(segments),
        _ => Err(PlanValidationError::WrongShape {
            expected: OutputShape::SegmentList,
        }),
    }
}

impl Planner {
    pub fn new(
        store: Store,
        generator: Arc<dyn StructuredGenerator>,
        assets: AssetLibrary,
        options: PlannerOptions,
    ) -> Self {
        Self {
            store,
            generator,
            assets,
            options,
        }
    }

    async fn generate(
        &self,
        prompt: &str,
        shape: OutputShape,
    ) -> Result<StructuredOutput, CollaboratorError> {
        match tokio::time::timeout(self.options.timeout, self.generator.generate(prompt, shape)).await
        {
            Ok(result) => result,
            Err(_) => Err(CollaboratorError::Timeout(self.options.timeout)),
        }
    }

    /// Ask for a plan until one validates or the attempt bound is reached
    async fn request_plan(&self, prompt: &str) -> (Result<SegmentPlan, CollaboratorError>, u32) {
        let count = self.options.segment_count;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = self
                .generate(prompt, OutputShape::SegmentList)
                .await
                .and_then(|output| {
                    expect_segments(output)
                        .and_then(|raw| SegmentPlan::validate(raw, count))
                        .map_err(CollaboratorError::from)
                });

            match result {
                Ok(plan) => return (Ok(plan), attempt),
                Err(e) if self.options.retry.should_retry(attempt) => {
                    let delay = self.options.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.options.retry.max_attempts,
                        error = %e,
                        ?delay,
                        "Plan rejected, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }

    fn abandon(&self, source: &Source, attempts: u32, reason: String) -> Result<PlanOutcome> {
        tracing::error!(source_id = source.id, attempts, %reason, "Abandoning source for this run");
        self.store
            .append_event(
                &StageEvent::new(
                    Subject::Source(source.id),
                    None,
                    EventType::Abandoned,
                    format!("no valid plan after {attempts} attempts"),
                )
                .with_error(reason.clone()),
            )
            .context("Failed to record abandoned plan")?;
        Ok(PlanOutcome::Abandoned { attempts, reason })
    }

    /// Plan one source.
    #[instrument(skip(self, source), fields(source_id = source.id))]
    pub async fn plan_source(&self, source: &Source) -> Result<PlanOutcome> {
        let prompt = segment_prompt(&source.text, self.options.segment_count);
        let started = Instant::now();

        let (plan, attempts) = self.request_plan(&prompt).await;
        let plan = match plan {
            Ok(plan) => plan,
            Err(e) => return self.abandon(source, attempts, e.to_string()),
        };

        let work_item_id = match self.store.commit_plan(source.id, &prompt, &plan) {
            Ok(id) => id,
            Err(StoreError::ConstraintViolation(msg)) => {
                if let Some(item) = self.store.work_item_for_source(source.id)? {
                    tracing::info!(work_item_id = item.id, "Source was planned by another planner");
                    return Ok(PlanOutcome::PlannedElsewhere {
                        work_item_id: item.id,
                    });
                }
                return self.abandon(source, attempts, format!("commit rejected: {msg}"));
            }
            Err(e) => return Err(e).context("Failed to commit plan"),
        };

        tracing::info!(
            work_item_id,
            segments = plan.len(),
            attempts,
            duration_ms = started.elapsed().as_millis() as u64,
            "Planned work item"
        );

        let item = self.store.get_work_item(work_item_id)?;
        let mut summary = EnrichSummary::default();
        self.enrich_item(&item, source, &mut summary).await?;

        Ok(PlanOutcome::Planned {
            work_item_id,
            attempts,
        })
    }

    /// Plan the oldest unplanned source with an id greater than `after`
    pub async fn plan_next(&self, after: i64) -> Result<Option<(Source, PlanOutcome)>> {
        let Some(source) = self.store.next_unplanned_after(after)? else {
            return Ok(None);
        };
        let outcome = self.plan_source(&source).await?;
        Ok(Some((source, outcome)))
    }

    /// Plan up to `limit` sources (all unplanned ones with `None`).
    ///
    /// Each source is tried once per run, so an abandoned source does not
    /// starve the ones behind it.
    pub async fn run(&self, limit: Option<usize>) -> Result<PlanRunSummary> {
        let mut summary = PlanRunSummary::default();
        let mut cursor = 0;

        while limit.map_or(true, |n| {
            summary.planned + summary.abandoned + summary.planned_elsewhere < n
        }) {
            let Some((source, outcome)) = self.plan_next(cursor).await? else {
                break;
            };
            cursor = source.id;
            match outcome {
                PlanOutcome::Planned { .. } => summary.planned += 1,
                PlanOutcome::Abandoned { .. } => summary.abandoned += 1,
                PlanOutcome::PlannedElsewhere { .. } => summary.planned_elsewhere += 1,
            }
        }

        tracing::info!(
            planned = summary.planned,
            abandoned = summary.abandoned,
            planned_elsewhere = summary.planned_elsewhere,
            "Planner run finished"
        );
        Ok(summary)
    }

    /// Fill in missing titles and background tracks for planned items
    pub async fn enrich(&self, limit: usize) -> Result<EnrichSummary> {
        let mut summary = EnrichSummary::default();
        for item in self.store.items_missing_metadata(limit)? {
            let source = self.store.get_source(item.source_id)?;
            self.enrich_item(&item, &source, &mut summary).await?;
        }
        Ok(summary)
    }

    /// Best effort: a failed request leaves the field unset for a later pass
    async fn enrich_item(
        &self,
        item: &WorkItem,
        source: &Source,
        summary: &mut EnrichSummary,
    ) -> Result<()> {
        if item.title.is_none() {
            match self
                .generate(&title_prompt(&source.text), OutputShape::TitleDescription)
                .await
            {
                Ok(StructuredOutput::TitleDescription(meta)) => {
                    self.store.set_title_description(item.id, &meta)?;
                    summary.titled += 1;
                }
                Ok(_) => {
                    tracing::warn!(work_item_id = item.id, "Title request returned another shape");
                    summary.failed += 1;
                }
                Err(e) => {
                    tracing::warn!(work_item_id = item.id, error = %e, "Title request failed");
                    summary.failed += 1;
                }
            }
        }

        if item.audio_ref.is_none() {
            let genre = match self
                .generate(&genre_prompt(&source.text), OutputShape::Genre)
                .await
            {
                Ok(StructuredOutput::Genre(genre)) => genre.normalized().to_string(),
                Ok(_) | Err(_) => {
                    tracing::warn!(work_item_id = item.id, "Genre request failed, using fallback");
                    FALLBACK_GENRE.to_string()
                }
            };

            let track = self
                .assets
                .track_for(&genre, item.id)
                .or_else(|| self.assets.fallback_track(item.id));
            match track {
                Some(track) => {
                    self.store
                        .set_audio_ref(item.id, &track.to_string_lossy())?;
                    tracing::debug!(work_item_id = item.id, %genre, track = %track.display(), "Chose background track");
                    summary.scored += 1;
                }
                None => {
                    tracing::warn!(work_item_id = item.id, %genre, "No background track installed");
                    summary.failed += 1;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Genre, NewSource, TitleDescription};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Replays canned responses, then keeps returning the last one
    struct Scripted {
        plans: Mutex<Vec<Vec<u32>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(plans: Vec<Vec<u32>>) -> Self {
            Self {
                plans: Mutex::new(plans),
                calls: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl StructuredGenerator for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(
            &self,
            _prompt: &str,
            shape: OutputShape,
        ) -> Result<StructuredOutput, CollaboratorError> {
            match shape {
                OutputShape::SegmentList => {
                    *self.calls.lock().unwrap() += 1;
                    let mut plans = self.plans.lock().unwrap();
                    let numbers = if plans.len() > 1 {
                        plans.remove(0)
                    } else {
                        plans[0].clone()
                    };
                    Ok(StructuredOutput::Segments(
                        numbers
                            .into_iter()
                            .map(|n| PlannedSegment {
                                sequence: n,
                                visual_directive: format!("image {n}"),
                                narration_text: format!("text {n}"),
                            })
                            .collect(),
                    ))
                }
                OutputShape::TitleDescription => {
                    Ok(StructuredOutput::TitleDescription(TitleDescription {
                        title: "Venus days".to_string(),
                        description: "Slow spin".to_string(),
                    }))
                }
                OutputShape::Genre => Ok(StructuredOutput::Genre(Genre {
                    genre: "happy".to_string(),
                })),
            }
        }
    }

    fn setup(plans: Vec<Vec<u32>>) -> (TempDir, Store, Arc<Scripted>, Planner) {
        let dir = TempDir::new().unwrap();
        let songs = dir.path().join("songs/happy");
        std::fs::create_dir_all(&songs).unwrap();
        std::fs::write(songs.join("tune.mp3"), b"x").unwrap();

        let store = Store::open_in_memory().unwrap();
        store
            .insert_source(&NewSource {
                group: "facts".to_string(),
                text: "A day on Venus is longer than its year.".to_string(),
                published_at: None,
            })
            .unwrap();

        let generator = Arc::new(Scripted::new(plans));
        let planner = Planner::new(
            store.clone(),
            generator.clone(),
            AssetLibrary::new(dir.path().join("songs"), dir.path().join("overlays")),
            PlannerOptions {
                retry: RetryPolicy::immediate(3),
                ..PlannerOptions::default()
            },
        );
        (dir, store, generator, planner)
    }

    #[tokio::test]
    async fn test_valid_plan_is_committed_and_enriched() {
        let (_dir, store, _, planner) = setup(vec![vec![6, 5, 4, 3, 2, 1]]);

        let (_, outcome) = planner.plan_next(0).await.unwrap().unwrap();
        let PlanOutcome::Planned { work_item_id, attempts } = outcome else {
            panic!("expected a plan, got {outcome:?}");
        };
        assert_eq!(attempts, 1);

        let sequences: Vec<u32> = store
            .segments_for(work_item_id)
            .unwrap()
            .iter()
            .map(|s| s.sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5, 6]);

        let item = store.get_work_item(work_item_id).unwrap();
        assert_eq!(item.title.as_deref(), Some("Venus days"));
        assert!(item.audio_ref.unwrap().ends_with("happy/tune.mp3"));
        assert!(item.directive.contains("EXACTLY 6 scenes"));
    }

    #[tokio::test]
    async fn test_invalid_plan_is_retried_then_accepted() {
        let (_dir, store, generator, planner) =
            setup(vec![vec![1, 2, 3, 4, 5], vec![1, 2, 3, 4, 5, 6]]);

        let summary = planner.run(None).await.unwrap();
        assert_eq!(summary.planned, 1);
        assert_eq!(*generator.calls.lock().unwrap(), 2);
        assert_eq!(store.count_segments().unwrap(), 6);
    }

    #[tokio::test]
    async fn test_always_invalid_plan_is_abandoned_without_rows() {
        let (_dir, store, generator, planner) = setup(vec![vec![1, 2, 3, 4, 5]]);

        let summary = planner.run(None).await.unwrap();
        assert_eq!(summary.abandoned, 1);
        assert_eq!(*generator.calls.lock().unwrap(), 3);
        assert_eq!(store.count_work_items().unwrap(), 0);
        assert_eq!(store.count_segments().unwrap(), 0);
        assert_eq!(store.count_unplanned().unwrap(), 1);

        let events = store.events_for(Subject::Source(1), None).unwrap();
        assert_eq!(events.last().unwrap().event_type, EventType::Abandoned);
    }

    #[tokio::test]
    async fn test_losing_a_commit_race_is_not_abandonment() {
        let (_dir, store, _, planner) = setup(vec![vec![1, 2, 3, 4, 5, 6]]);
        let source = store.next_unplanned_after(0).unwrap().unwrap();

        // A concurrent planner commits while this one waits on the model
        let raw = (1..=6)
            .map(|n| PlannedSegment {
                sequence: n,
                visual_directive: format!("other {n}"),
                narration_text: format!("other {n}"),
            })
            .collect();
        let plan = SegmentPlan::validate(raw, 6).unwrap();
        let winner = store.commit_plan(source.id, "other", &plan).unwrap();

        let outcome = planner.plan_source(&source).await.unwrap();
        assert_eq!(outcome, PlanOutcome::PlannedElsewhere { work_item_id: winner });
        assert_eq!(store.count_work_items().unwrap(), 1);
        assert_eq!(store.count_segments().unwrap(), 6);

        let events = store.events_for(Subject::Source(source.id), None).unwrap();
        assert!(events.iter().all(|e| e.event_type != EventType::Abandoned));
    }
}
