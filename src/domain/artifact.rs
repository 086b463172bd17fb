//! Artifacts produced by stages and the single place their storage keys are derived.
//!
//! Every stage reads its inputs and writes its output through
//! [`ArtifactLayout::path_for`]; no other module builds artifact paths.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::stage::{Scope, Stage};

/// Kinds of artifacts the pipeline produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Still image for a segment
    SegmentImage,

    /// Narration audio for a segment
    SegmentNarration,

    /// Rendered clip (image + narration + overlay)
    SegmentClip,

    /// Word-level transcription of a clip
    SegmentWords,

    /// ASS subtitle file built from the transcription
    SegmentSubtitles,

    /// Clip with burned-in captions
    SegmentCaptioned,

    /// All captioned clips joined with transitions
    StitchedVideo,

    /// Narration mixed with background music
    MixedAudio,

    /// Scratch directory used while mixing
    MixScratch,

    /// Final muxed video; survives retention
    FinalVideo,
}

impl ArtifactKind {
    /// Whether this artifact is keyed by segment id or by work item id
    pub fn scope(&self) -> Scope {
        match self {
            ArtifactKind::SegmentImage
            | ArtifactKind::SegmentNarration
            | ArtifactKind::SegmentClip
            | ArtifactKind::SegmentWords
            | ArtifactKind::SegmentSubtitles
            | ArtifactKind::SegmentCaptioned => Scope::Segment,
            ArtifactKind::StitchedVideo
            | ArtifactKind::MixedAudio
            | ArtifactKind::MixScratch
            | ArtifactKind::FinalVideo => Scope::Item,
        }
    }

    /// Intermediate artifacts are removed by the retention sweep
    pub fn is_intermediate(&self) -> bool {
        !matches!(self, ArtifactKind::FinalVideo)
    }

    /// Primary artifact written by a stage
    pub fn produced_by(stage: Stage) -> ArtifactKind {
        match stage {
            Stage::Media => ArtifactKind::SegmentImage,
            Stage::Narration => ArtifactKind::SegmentNarration,
            Stage::Clip => ArtifactKind::SegmentClip,
            Stage::Caption => ArtifactKind::SegmentCaptioned,
            Stage::Transition => ArtifactKind::StitchedVideo,
            Stage::Mix => ArtifactKind::MixedAudio,
            Stage::Render | Stage::Publish => ArtifactKind::FinalVideo,
        }
    }

    pub const ALL: [ArtifactKind; 10] = [
        ArtifactKind::SegmentImage,
        ArtifactKind::SegmentNarration,
        ArtifactKind::SegmentClip,
        ArtifactKind::SegmentWords,
        ArtifactKind::SegmentSubtitles,
        ArtifactKind::SegmentCaptioned,
        ArtifactKind::StitchedVideo,
        ArtifactKind::MixedAudio,
        ArtifactKind::MixScratch,
        ArtifactKind::FinalVideo,
    ];
}

/// Maps (kind, id) to a location under the artifacts root
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Storage location for an artifact.
    ///
    /// `id` is a segment id for segment-scoped kinds and a work item id for
    /// item-scoped kinds.
    pub fn path_for(&self, kind: ArtifactKind, id: i64) -> PathBuf {
        match kind {
            ArtifactKind::SegmentImage => self.root.join("image").join(id.to_string()).join("image.png"),
            ArtifactKind::SegmentNarration => {
                self.root.join("voice").join(id.to_string()).join("audio.mp3")
            }
            ArtifactKind::SegmentClip => self.root.join("clip").join(id.to_string()).join("video.mp4"),
            ArtifactKind::SegmentWords => {
                self.root.join("subtitle").join(id.to_string()).join("words.json")
            }
            ArtifactKind::SegmentSubtitles => {
                self.root.join("subtitle").join(id.to_string()).join("subtitles.ass")
            }
            ArtifactKind::SegmentCaptioned => {
                self.root.join("subtitle").join(id.to_string()).join("video.mp4")
            }
            ArtifactKind::StitchedVideo => self.root.join("video").join(format!("{id}.mp4")),
            ArtifactKind::MixedAudio => self.root.join("mix").join(format!("{id}.wav")),
            ArtifactKind::MixScratch => self.root.join("mix").join(id.to_string()),
            ArtifactKind::FinalVideo => self.root.join("final").join(format!("{id}.mp4")),
        }
    }

    /// Everything the retention sweep may delete for one work item.
    ///
    /// Segment-scoped artifacts are returned as their per-segment directories.
    pub fn intermediate_paths(&self, work_item_id: i64, segment_ids: &[i64]) -> Vec<PathBuf> {
        let mut paths = Vec::new();

        for kind in ArtifactKind::ALL.iter().filter(|k| k.is_intermediate()) {
            match kind.scope() {
                Scope::Item => paths.push(self.path_for(*kind, work_item_id)),
                Scope::Segment => {
                    for segment_id in segment_ids {
                        let path = self.path_for(*kind, *segment_id);
                        let dir = path.parent().map(Path::to_path_buf).unwrap_or(path);
                        if !paths.contains(&dir) {
                            paths.push(dir);
                        }
                    }
                }
            }
        }

        paths
    }
}
