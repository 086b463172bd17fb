//! Command-line interface for storyreel.
//!
//! Each command is a short-lived run meant to be triggered periodically
//! (cron, systemd timers). Commands can overlap freely; the store's claim
//! protocol keeps concurrent workers off each other's units.

use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::adapters::Collaborators;
use crate::config::{self, Settings};
use crate::core::{FeedFetcher, Ingestor, Planner, RetentionSweep, StageRunSummary, StageWorker};
use crate::domain::{Scope, Stage, UnitRef};
use crate::store::Store;

/// storyreel - Stage-tracking orchestrator for short-video generation
#[derive(Parser, Debug)]
#[command(name = "storyreel")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Ingest sources (JSON lines or plain text, one per line) or a feed
    Ingest {
        /// Input file (reads from stdin if not provided)
        #[arg(short, long, conflicts_with = "feed")]
        input: Option<PathBuf>,

        /// RSS or Atom feed URL to pull entries from
        #[arg(long)]
        feed: Option<String>,

        /// Group tag for plain-text lines and feed entries
        #[arg(short, long, default_value = "manual")]
        group: String,

        /// Maximum feed entries to take
        #[arg(long, default_value = "5")]
        limit: usize,

        /// Fetch each entry's linked article instead of using the feed summary
        #[arg(long)]
        follow_links: bool,
    },

    /// Plan unplanned sources into work items
    Plan {
        /// Maximum number of sources to plan
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Fill in missing titles and background tracks
    Enrich {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Run the worker for one stage
    Work {
        /// Stage name (media, narration, clip, caption, transition, mix, render, publish)
        stage: Stage,

        /// Process a single unit instead of draining the stage
        #[arg(long)]
        once: bool,

        /// Worker name recorded in claims and events
        #[arg(long)]
        worker: Option<String>,
    },

    /// Plan, run every stage in dependency order, then sweep
    Tick,

    /// Delete intermediate artifacts of published work items
    Sweep,

    /// Show per-stage progress and live claims
    Status {
        /// Also show this many recent events
        #[arg(short, long, default_value = "0")]
        events: usize,
    },

    /// Clear a unit's failure history for a stage
    Retry {
        stage: Stage,

        /// Segment task id for segment stages, work item id for item stages
        unit_id: i64,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// Settings plus the store they point at
struct App {
    settings: Settings,
    store: Store,
}

impl App {
    fn load() -> Result<Self> {
        let settings = config::settings()?.clone();
        let store = Store::open(&settings.paths.database).with_context(|| {
            format!("Failed to open store at {}", settings.paths.database.display())
        })?;
        Ok(Self { settings, store })
    }

    fn planner(&self, collaborators: &Collaborators) -> Planner {
        Planner::new(
            self.store.clone(),
            collaborators.generator.clone(),
            self.settings.assets(),
            self.settings.planner_options(),
        )
    }

    fn worker(
        &self,
        stage: Stage,
        collaborators: &Collaborators,
        name: Option<String>,
        once: bool,
    ) -> Result<StageWorker> {
        let mut options = self.settings.worker_options(stage)?;
        if once {
            options.drain = false;
        }
        Ok(StageWorker::new(
            stage,
            name.unwrap_or_else(|| format!("{stage}-{}", std::process::id())),
            self.store.clone(),
            collaborators.clone(),
            self.settings.layout(),
            self.settings.assets(),
            options,
        ))
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Ingest {
                feed: Some(url),
                group,
                limit,
                follow_links,
                ..
            } => ingest_feed(&url, &group, limit, follow_links).await,
            Commands::Ingest { input, group, .. } => ingest(input, &group),
            Commands::Plan { limit } => plan(limit).await,
            Commands::Enrich { limit } => enrich(limit).await,
            Commands::Work {
                stage,
                once,
                worker,
            } => work(stage, once, worker).await,
            Commands::Tick => tick().await,
            Commands::Sweep => sweep().await,
            Commands::Status { events } => show_status(events),
            Commands::Retry { stage, unit_id } => retry(stage, unit_id),
            Commands::Config => show_config(),
        }
    }
}

fn print_stage_summary(summary: &StageRunSummary) {
    println!(
        "{:<11} claimed {:>3}  completed {:>3}  failed {:>3}  lost {:>3}",
        summary.stage,
        summary.claimed,
        summary.completed,
        summary.failed(),
        summary.lost
    );
    for failure in &summary.failures {
        println!("  {} [{}] {}", failure.unit, failure.kind, failure.message);
    }
}

fn ingest(input_file: Option<PathBuf>, group: &str) -> Result<()> {
    let input = match input_file {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read input file: {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read from stdin")?;
            buffer
        }
    };

    let app = App::load()?;
    let summary = Ingestor::new(app.store.clone()).ingest_lines(&input, group)?;
    println!(
        "Ingested {} new, {} duplicate, {} rejected",
        summary.inserted, summary.duplicates, summary.rejected
    );
    Ok(())
}

async fn ingest_feed(url: &str, group: &str, limit: usize, follow_links: bool) -> Result<()> {
    let entries = FeedFetcher::new(follow_links).fetch(url, limit).await?;

    let app = App::load()?;
    let summary = Ingestor::new(app.store.clone()).ingest_feed(group, entries)?;
    println!(
        "Ingested {} new, {} duplicate, {} rejected from {}",
        summary.inserted, summary.duplicates, summary.rejected, url
    );
    Ok(())
}

async fn plan(limit: Option<usize>) -> Result<()> {
    let app = App::load()?;
    let collaborators = Collaborators::from_settings(&app.settings);
    let summary = app.planner(&collaborators).run(limit).await?;
    println!(
        "Planned {} sources, abandoned {}, {} planned elsewhere",
        summary.planned, summary.abandoned, summary.planned_elsewhere
    );
    Ok(())
}

async fn enrich(limit: usize) -> Result<()> {
    let app = App::load()?;
    let collaborators = Collaborators::from_settings(&app.settings);
    let summary = app.planner(&collaborators).enrich(limit).await?;
    println!(
        "Titled {}, scored {}, failed {}",
        summary.titled, summary.scored, summary.failed
    );
    Ok(())
}

async fn work(stage: Stage, once: bool, name: Option<String>) -> Result<()> {
    let app = App::load()?;
    let collaborators = Collaborators::from_settings(&app.settings);
    let summary = app.worker(stage, &collaborators, name, once)?.run().await?;
    print_stage_summary(&summary);
    Ok(())
}

async fn tick() -> Result<()> {
    let app = App::load()?;
    let collaborators = Collaborators::from_settings(&app.settings);

    let planner = app.planner(&collaborators);
    let planned = planner.run(None).await?;
    planner.enrich(planned.planned + 20).await?;
    println!(
        "Planned {} sources, abandoned {}, {} planned elsewhere",
        planned.planned, planned.abandoned, planned.planned_elsewhere
    );

    for stage in Stage::ALL {
        let summary = app.worker(stage, &collaborators, None, false)?.run().await?;
        print_stage_summary(&summary);
    }

    let swept = RetentionSweep::new(app.store.clone(), app.settings.layout())
        .run()
        .await?;
    println!("Swept {} artifacts from {} items", swept.removed, swept.items);
    Ok(())
}

async fn sweep() -> Result<()> {
    let app = App::load()?;
    let summary = RetentionSweep::new(app.store.clone(), app.settings.layout())
        .run()
        .await?;
    println!(
        "Swept {} artifacts from {} published items ({} errors)",
        summary.removed, summary.items, summary.errors
    );
    Ok(())
}

fn show_status(events: usize) -> Result<()> {
    let app = App::load()?;
    let store = &app.store;

    println!(
        "Sources: {} ({} unplanned)   Work items: {}   Segments: {}",
        store.count_sources()?,
        store.count_unplanned()?,
        store.count_work_items()?,
        store.count_segments()?
    );
    println!();
    println!(
        "{:<11} {:>8} {:>8} {:>8} {:>8}",
        "STAGE", "PENDING", "CLAIMED", "DONE", "FAILED"
    );
    println!("{}", "-".repeat(47));
    for counts in store.stage_report()? {
        println!(
            "{:<11} {:>8} {:>8} {:>8} {:>8}",
            counts.stage, counts.pending, counts.claimed, counts.done, counts.failed
        );
    }

    let claims = store.live_claims()?;
    if !claims.is_empty() {
        println!();
        println!("Live claims:");
        for claim in claims {
            println!(
                "  {:<11} {:<12} {} since {}",
                claim.stage, claim.unit, claim.worker, claim.claimed_at
            );
        }
    }

    if events > 0 {
        println!();
        println!("Recent events:");
        for event in store.recent_events(events)? {
            let (kind, id) = event.subject.key();
            println!(
                "  {} {:<15} {}:{:<6} {:<11} {}{}",
                event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                event.event_type.as_str(),
                kind,
                id,
                event.stage.map(|s| s.as_str()).unwrap_or("-"),
                event.payload_summary,
                event
                    .error
                    .as_deref()
                    .map(|e| format!(" ({e})"))
                    .unwrap_or_default()
            );
        }
    }

    Ok(())
}

fn retry(stage: Stage, unit_id: i64) -> Result<()> {
    let app = App::load()?;
    let unit = match stage.scope() {
        Scope::Segment => UnitRef::segment_task(unit_id),
        Scope::Item => UnitRef::work_item(unit_id),
    };
    app.store
        .request_retry(unit, stage)
        .with_context(|| format!("Failed to request retry of {stage} for {unit}"))?;
    println!("Cleared {stage} failures for {unit}; it is eligible again");
    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let settings = config::settings()?;

    println!(
        "Config file: {}",
        settings
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("{}", serde_yaml::to_string(settings).context("Failed to render settings")?);
    Ok(())
}
