//! Configuration for storyreel.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (STORYREEL_HOME, STORYREEL_DB)
//! 2. Config file (.storyreel/config.yaml)
//! 3. Defaults (~/.storyreel)
//!
//! Config file discovery:
//! - Searches current directory and parents for .storyreel/config.yaml
//! - `paths.home` is relative to the .storyreel directory; other paths are
//!   relative to the directory containing it

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::executor::DEFAULT_VOICE;
use crate::core::{AssetLibrary, PlannerOptions, RetryPolicy, WorkerOptions};
use crate::domain::plan::DEFAULT_SEGMENT_COUNT;
use crate::domain::{ArtifactLayout, Stage};
use crate::store::ClaimOptions;

/// Global cached configuration (stores Result to handle init errors)
static SETTINGS: OnceLock<Result<Settings, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub services: ServiceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .storyreel/)
    pub home: Option<String>,
    pub database: Option<String>,
    pub artifacts: Option<String>,
    /// Background tracks, one subdirectory per genre
    pub songs: Option<String>,
    /// Overlay clips laid over segment images
    pub overlays: Option<String>,
    /// OAuth client and refresh token for publishing
    pub credentials: Option<String>,
}

/// Resolved absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedPaths {
    pub home: PathBuf,
    pub database: PathBuf,
    pub artifacts: PathBuf,
    pub songs: PathBuf,
    pub overlays: PathBuf,
    pub credentials: PathBuf,
}

impl ResolvedPaths {
    /// Everything under one home directory
    pub fn under(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            database: home.join("storyreel.db"),
            artifacts: home.join("artifacts"),
            songs: home.join("songs"),
            overlays: home.join("overlays"),
            credentials: home.join("youtube_credentials.json"),
            home,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Segments per work item; the last is the call-to-action
    pub segment_count: usize,

    /// Attempt bound and backoff for planning requests
    pub planner_retry: RetryPolicy,

    /// Claims older than this are taken over by the next claimer
    pub claim_lease_seconds: u64,

    /// Dead-letter threshold; `None` retries forever
    pub max_failures: Option<u32>,

    /// Process every eligible unit per worker run
    pub drain: bool,

    /// How long to wait for the GPU lock before giving up on a call
    pub resource_lock_wait_seconds: u64,

    pub voice: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            segment_count: DEFAULT_SEGMENT_COUNT,
            planner_retry: RetryPolicy::default(),
            claim_lease_seconds: 1800,
            max_failures: None,
            drain: true,
            resource_lock_wait_seconds: 900,
            voice: DEFAULT_VOICE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub default_seconds: u64,

    /// Per-stage overrides
    pub stages: HashMap<Stage, u64>,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            default_seconds: 600,
            stages: HashMap::new(),
        }
    }
}

impl TimeoutSettings {
    pub fn for_stage(&self, stage: Stage) -> Duration {
        Duration::from_secs(
            self.stages
                .get(&stage)
                .copied()
                .unwrap_or(self.default_seconds),
        )
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub ollama_url: String,
    pub ollama_model: String,
    pub image_api_url: String,
    pub tts_binary: String,
    pub whisper_binary: String,
    pub whisper_model: String,
    pub ffmpeg_binary: String,
    pub ffprobe_binary: String,
    pub publish_endpoint: String,
    /// OAuth endpoint that exchanges the refresh token for access tokens
    pub publish_token_url: String,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            ollama_model: "llama3.2:latest".to_string(),
            image_api_url: "http://127.0.0.1:7860".to_string(),
            tts_binary: "edge-tts".to_string(),
            whisper_binary: "whisper".to_string(),
            whisper_model: "medium".to_string(),
            ffmpeg_binary: "ffmpeg".to_string(),
            ffprobe_binary: "ffprobe".to_string(),
            publish_endpoint: "https://www.googleapis.com".to_string(),
            publish_token_url: "https://oauth2.googleapis.com/token".to_string(),
        }
    }
}

/// Fully resolved configuration
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub paths: ResolvedPaths,
    pub pipeline: PipelineSettings,
    pub timeouts: TimeoutSettings,
    pub services: ServiceSettings,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl Settings {
    /// Defaults rooted at `home`; used when no config file applies
    pub fn for_home(home: impl Into<PathBuf>) -> Self {
        Self {
            paths: ResolvedPaths::under(home),
            pipeline: PipelineSettings::default(),
            timeouts: TimeoutSettings::default(),
            services: ServiceSettings::default(),
            config_file: None,
        }
    }

    pub fn layout(&self) -> ArtifactLayout {
        ArtifactLayout::new(&self.paths.artifacts)
    }

    pub fn assets(&self) -> AssetLibrary {
        AssetLibrary::new(&self.paths.songs, &self.paths.overlays)
    }

    pub fn claim_options(&self) -> ClaimOptions {
        ClaimOptions {
            lease: chrono::Duration::seconds(self.pipeline.claim_lease_seconds as i64),
            max_failures: self.pipeline.max_failures,
        }
    }

    /// Options for one stage's worker.
    ///
    /// A stage timeout must be shorter than the claim lease, or a unit could
    /// be reclaimed while its first worker is still writing its artifact.
    pub fn worker_options(&self, stage: Stage) -> Result<WorkerOptions> {
        let timeout = self.timeouts.for_stage(stage);
        let lease = Duration::from_secs(self.pipeline.claim_lease_seconds);
        if timeout >= lease {
            anyhow::bail!(
                "{stage} timeout of {}s must be shorter than claim_lease_seconds ({}s)",
                timeout.as_secs(),
                lease.as_secs()
            );
        }

        Ok(WorkerOptions {
            claim: self.claim_options(),
            timeout,
            drain: self.pipeline.drain,
            voice: self.pipeline.voice.clone(),
        })
    }

    /// Reject settings no worker could run with
    pub fn validate(&self) -> Result<()> {
        for stage in Stage::ALL {
            self.worker_options(stage)?;
        }
        Ok(())
    }

    pub fn planner_options(&self) -> PlannerOptions {
        PlannerOptions {
            segment_count: self.pipeline.segment_count,
            retry: self.pipeline.planner_retry.clone(),
            timeout: self.timeouts.default_timeout(),
        }
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".storyreel").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Apply a config file on top of defaults
fn resolve(config: ConfigFile, config_path: &Path, default_home: PathBuf) -> Settings {
    let dot_dir = config_path.parent().unwrap_or(Path::new("."));
    // Project root: the directory holding .storyreel/
    let base_dir = dot_dir.parent().unwrap_or(Path::new("."));

    let home = match std::env::var("STORYREEL_HOME") {
        Ok(env_home) => PathBuf::from(env_home),
        Err(_) => config
            .paths
            .home
            .as_deref()
            .map(|p| resolve_path(dot_dir, p))
            .unwrap_or(default_home),
    };

    let defaults = ResolvedPaths::under(&home);
    let pick = |configured: &Option<String>, fallback: PathBuf| {
        configured
            .as_deref()
            .map(|p| resolve_path(base_dir, p))
            .unwrap_or(fallback)
    };

    let paths = ResolvedPaths {
        database: std::env::var("STORYREEL_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| pick(&config.paths.database, defaults.database.clone())),
        artifacts: pick(&config.paths.artifacts, defaults.artifacts.clone()),
        songs: pick(&config.paths.songs, defaults.songs.clone()),
        overlays: pick(&config.paths.overlays, defaults.overlays.clone()),
        credentials: pick(&config.paths.credentials, defaults.credentials.clone()),
        home,
    };

    Settings {
        paths,
        pipeline: config.pipeline,
        timeouts: config.timeouts,
        services: config.services,
        config_file: Some(config_path.to_path_buf()),
    }
}

/// Load configuration from all sources
fn load_settings() -> Result<Settings> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".storyreel");

    if let Some(config_path) = find_config_file() {
        let config = load_config_file(&config_path)?;
        let settings = resolve(config, &config_path, default_home);
        settings
            .validate()
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;
        return Ok(settings);
    }

    // No config file - use env vars or defaults
    let home = std::env::var("STORYREEL_HOME")
        .map(PathBuf::from)
        .unwrap_or(default_home);
    let mut settings = Settings::for_home(home);
    if let Ok(db) = std::env::var("STORYREEL_DB") {
        settings.paths.database = PathBuf::from(db);
    }
    Ok(settings)
}

/// Get the global configuration (loads once, then cached)
pub fn settings() -> Result<&'static Settings> {
    let result = SETTINGS.get_or_init(|| load_settings().map_err(|e| e.to_string()));

    match result {
        Ok(settings) => Ok(settings),
        Err(e) => anyhow::bail!("{}", e),
    }
}
