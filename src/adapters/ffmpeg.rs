//! Video and audio processing through ffmpeg and ffprobe.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::process::run_tool;
use super::{CollaboratorError, MediaTools};

/// Silence before the narration starts, in seconds
const LEAD_IN_SECS: f64 = 2.0;

/// Silence after the narration ends, in seconds
const TAIL_SECS: f64 = 2.0;

/// Crossfade length between stitched clips, in seconds
const TRANSITION_SECS: f64 = 2.0;

const WIDTH: u32 = 1080;
const HEIGHT: u32 = 1920;
const FPS: u32 = 30;

/// Background track level under the narration
const BACKGROUND_VOLUME: f64 = 0.03;

pub struct FfmpegTools {
    ffmpeg: String,
    ffprobe: String,
}

impl FfmpegTools {
    pub fn new(ffmpeg: impl Into<String>, ffprobe: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// Container duration in seconds
    async fn probe_duration(&self, media: &Path) -> Result<f64, CollaboratorError> {
        let output = run_tool(
            &self.ffprobe,
            [
                OsStr::new("-v"),
                OsStr::new("error"),
                OsStr::new("-show_entries"),
                OsStr::new("format=duration"),
                OsStr::new("-of"),
                OsStr::new("default=noprint_wrappers=1:nokey=1"),
                media.as_os_str(),
            ],
        )
        .await?;

        let raw = String::from_utf8_lossy(&output.stdout);
        raw.trim().parse::<f64>().map_err(|_| {
            CollaboratorError::Validation(format!(
                "ffprobe returned no duration for {}: {:?}",
                media.display(),
                raw.trim()
            ))
        })
    }

    async fn ffmpeg(&self, args: Vec<OsString>) -> Result<(), CollaboratorError> {
        let mut full = vec![OsString::from("-y"), OsString::from("-loglevel"), OsString::from("error")];
        full.extend(args);
        run_tool(&self.ffmpeg, full).await.map(|_| ())
    }
}

/// Argument list builder; keeps call sites readable
fn args<I, S>(items: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    items.into_iter().map(|s| s.as_ref().to_os_string()).collect()
}

/// Escape a path for use inside a filtergraph option value
fn filter_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\\', "\\\\")
        .replace(':', "\\:")
        .replace('\'', "\\'")
}

/// Filtergraph chaining `durations.len()` clips, one `xfade` transition per
/// junction and an audio crossfade under each.
///
/// Output pads are `[vout]` and `[aout]`.
fn stitch_filter(durations: &[f64], transitions: &[&str], transition: f64) -> String {
    let mut parts = Vec::new();
    let mut video = "0:v".to_string();
    let mut audio = "0:a".to_string();
    let mut length = durations.first().copied().unwrap_or(0.0);

    for ((i, duration), kind) in durations.iter().enumerate().skip(1).zip(transitions) {
        let fade = transition.min(length).min(*duration);
        let offset = (length - fade).max(0.0);
        let last = i == durations.len() - 1;
        let v_out = if last { "vout".to_string() } else { format!("v{i}") };
        let a_out = if last { "aout".to_string() } else { format!("a{i}") };

        parts.push(format!(
            "[{video}][{i}:v]xfade=transition={kind}:duration={fade:.3}:offset={offset:.3}[{v_out}]"
        ));
        parts.push(format!("[{audio}][{i}:a]acrossfade=d={fade:.3}[{a_out}]"));

        length = length + duration - fade;
        video = v_out;
        audio = a_out;
    }

    parts.join(";")
}

#[async_trait]
impl MediaTools for FfmpegTools {
    async fn render_clip(
        &self,
        image: &Path,
        narration: &Path,
        overlay: Option<&Path>,
        output: &Path,
    ) -> Result<(), CollaboratorError> {
        let narration_secs = self.probe_duration(narration).await?.ceil();
        let total = narration_secs + LEAD_IN_SECS + TAIL_SECS;
        let delay_ms = (LEAD_IN_SECS * 1000.0) as u64;

        let mut cmd = args(["-loop", "1", "-i"]);
        cmd.push(image.as_os_str().to_os_string());

        let (filter, audio_input) = match overlay {
            Some(overlay) => {
                cmd.extend(args(["-stream_loop", "-1", "-i"]));
                cmd.push(overlay.as_os_str().to_os_string());
                (
                    format!(
                        "[0:v]scale={WIDTH}:{HEIGHT},setsar=1,format=yuva420p,trim=duration={total}[bg];\
                         [1:v]scale={WIDTH}:{HEIGHT},format=rgba,colorchannelmixer=aa=0.5,trim=duration={total}[fx];\
                         [bg][fx]overlay=0:0:shortest=1[vout];\
                         [2:a]adelay={delay_ms}|{delay_ms},apad[aout]"
                    ),
                    2,
                )
            }
            None => (
                format!(
                    "[0:v]scale={WIDTH}:{HEIGHT},setsar=1,trim=duration={total}[vout];\
                     [1:a]adelay={delay_ms}|{delay_ms},apad[aout]"
                ),
                1,
            ),
        };
        tracing::debug!(audio_input, total, "Rendering clip");

        cmd.push("-i".into());
        cmd.push(narration.as_os_str().to_os_string());
        cmd.extend(args([
            "-filter_complex",
            filter.as_str(),
            "-map",
            "[vout]",
            "-map",
            "[aout]",
            "-c:v",
            "libx264",
            "-preset",
            "medium",
            "-crf",
            "23",
            "-c:a",
            "aac",
            "-b:a",
            "192k",
            "-pix_fmt",
            "yuv420p",
            "-r",
            &FPS.to_string(),
            "-t",
            &total.to_string(),
        ]));
        cmd.push(output.as_os_str().to_os_string());

        self.ffmpeg(cmd).await
    }

    async fn burn_captions(
        &self,
        video: &Path,
        subtitles: &Path,
        output: &Path,
    ) -> Result<(), CollaboratorError> {
        let mut cmd = args(["-i"]);
        cmd.push(video.as_os_str().to_os_string());
        cmd.extend(args([
            "-vf",
            &format!("ass='{}'", filter_path(subtitles)),
            "-c:v",
            "libx264",
            "-preset",
            "medium",
            "-crf",
            "22",
            "-c:a",
            "aac",
            "-b:a",
            "192k",
        ]));
        cmd.push(output.as_os_str().to_os_string());

        self.ffmpeg(cmd).await
    }

    async fn stitch(
        &self,
        clips: &[PathBuf],
        transitions: &[&str],
        output: &Path,
    ) -> Result<(), CollaboratorError> {
        if clips.len() < 2 {
            return Err(CollaboratorError::permanent(format!(
                "stitching needs at least two clips, got {}",
                clips.len()
            )));
        }
        if transitions.len() != clips.len() - 1 {
            return Err(CollaboratorError::permanent(format!(
                "{} clips need {} transitions, got {}",
                clips.len(),
                clips.len() - 1,
                transitions.len()
            )));
        }

        let mut durations = Vec::with_capacity(clips.len());
        let mut cmd = Vec::new();
        for clip in clips {
            durations.push(self.probe_duration(clip).await?);
            cmd.push(OsString::from("-i"));
            cmd.push(clip.as_os_str().to_os_string());
        }

        cmd.extend(args([
            "-filter_complex",
            &stitch_filter(&durations, transitions, TRANSITION_SECS),
            "-map",
            "[vout]",
            "-map",
            "[aout]",
            "-c:v",
            "libx264",
            "-preset",
            "medium",
            "-crf",
            "23",
            "-pix_fmt",
            "yuv420p",
            "-c:a",
            "aac",
            "-b:a",
            "192k",
        ]));
        cmd.push(output.as_os_str().to_os_string());

        self.ffmpeg(cmd).await
    }

    async fn mix_audio(
        &self,
        video: &Path,
        track: &Path,
        scratch: &Path,
        output: &Path,
    ) -> Result<(), CollaboratorError> {
        let video_secs = self.probe_duration(video).await?;
        let narration = scratch.join("narration.wav");

        // Pull the soundtrack out at exactly the video's length
        let mut extract = args(["-i"]);
        extract.push(video.as_os_str().to_os_string());
        extract.extend(args([
            "-vn",
            "-af",
            &format!("aresample=async=1000,apad=whole_dur={video_secs}"),
            "-t",
            &video_secs.to_string(),
            "-c:a",
            "pcm_s16le",
        ]));
        extract.push(narration.as_os_str().to_os_string());
        self.ffmpeg(extract).await?;

        let mut mix = args(["-i"]);
        mix.push(narration.as_os_str().to_os_string());
        mix.extend(args(["-stream_loop", "-1", "-i"]));
        mix.push(track.as_os_str().to_os_string());
        mix.extend(args([
            "-filter_complex",
            &format!(
                "[0:a]aecho=0.5:0.6:30:0.05[voice];\
                 [1:a]volume={BACKGROUND_VOLUME}[bg];\
                 [voice][bg]amix=inputs=2:duration=first:normalize=0[aout]"
            ),
            "-map",
            "[aout]",
            "-c:a",
            "pcm_s16le",
        ]));
        mix.push(output.as_os_str().to_os_string());

        self.ffmpeg(mix).await
    }

    async fn mux(&self, video: &Path, audio: &Path, output: &Path) -> Result<(), CollaboratorError> {
        let mut cmd = args(["-i"]);
        cmd.push(video.as_os_str().to_os_string());
        cmd.push("-i".into());
        cmd.push(audio.as_os_str().to_os_string());
        cmd.extend(args([
            "-map", "0:v", "-map", "1:a", "-c:v", "copy", "-c:a", "aac", "-b:a", "192k",
            "-shortest",
        ]));
        cmd.push(output.as_os_str().to_os_string());

        self.ffmpeg(cmd).await
    }
}
