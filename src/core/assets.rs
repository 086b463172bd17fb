//! Static media libraries: background tracks, overlay clips and the
//! transitions between clips.
//!
//! Choices are deterministic in the unit id, so re-running a stage on the
//! same unit picks the same asset.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::domain::plan::FALLBACK_GENRE;

/// ffmpeg `xfade` transitions used between adjacent clips
pub const TRANSITIONS: [&str; 12] = [
    "fade",
    "fadeblack",
    "fadewhite",
    "distance",
    "smoothleft",
    "smoothright",
    "smoothup",
    "smoothdown",
    "horzclose",
    "horzopen",
    "vertclose",
    "vertopen",
];

/// Transition for each of the `junctions` joins of a work item's clips
pub fn transitions_for(work_item_id: i64, junctions: usize) -> Vec<&'static str> {
    (0..junctions as u64)
        .map(|junction| {
            let mut key = work_item_id.to_le_bytes().to_vec();
            key.extend_from_slice(&junction.to_le_bytes());
            TRANSITIONS[stable_index(&key, TRANSITIONS.len())]
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct AssetLibrary {
    songs_dir: PathBuf,
    overlays_dir: PathBuf,
}

impl AssetLibrary {
    pub fn new(songs_dir: impl Into<PathBuf>, overlays_dir: impl Into<PathBuf>) -> Self {
        Self {
            songs_dir: songs_dir.into(),
            overlays_dir: overlays_dir.into(),
        }
    }

    /// Track for a genre, keyed by work item id
    pub fn track_for(&self, genre: &str, key: i64) -> Option<PathBuf> {
        let pattern = self.songs_dir.join(genre).join("*.mp3");
        pick(&list(&pattern), key)
    }

    /// Track from the fallback genre
    pub fn fallback_track(&self, key: i64) -> Option<PathBuf> {
        self.track_for(FALLBACK_GENRE, key)
    }

    /// Overlay clip for a segment, if any are installed
    pub fn overlay_for(&self, key: i64) -> Option<PathBuf> {
        pick(&list(&self.overlays_dir.join("*.mp4")), key)
    }
}

/// Sorted files matching a glob pattern; unreadable entries are skipped
fn list(pattern: &Path) -> Vec<PathBuf> {
    let Some(pattern) = pattern.to_str() else {
        return Vec::new();
    };

    let mut files: Vec<PathBuf> = match glob::glob(pattern) {
        Ok(paths) => paths.filter_map(Result::ok).filter(|p| p.is_file()).collect(),
        Err(e) => {
            tracing::warn!(pattern, error = %e, "Invalid asset pattern");
            Vec::new()
        }
    };
    files.sort();
    files
}

fn stable_index(key: &[u8], len: usize) -> usize {
    let digest = Sha256::digest(key);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_le_bytes(head) % len as u64) as usize
}

/// Stable choice of one candidate for a key
fn pick(candidates: &[PathBuf], key: i64) -> Option<PathBuf> {
    if candidates.is_empty() {
        return None;
    }
    let index = stable_index(&key.to_le_bytes(), candidates.len());
    Some(candidates[index].clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn library_with(files: &[&str]) -> (TempDir, AssetLibrary) {
        let dir = TempDir::new().unwrap();
        for f in files {
            let path = dir.path().join(f);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"x").unwrap();
        }
        let library = AssetLibrary::new(dir.path().join("songs"), dir.path().join("overlays"));
        (dir, library)
    }

    #[test]
    fn test_choice_is_stable_per_key() {
        let (_dir, library) = library_with(&[
            "songs/happy/a.mp3",
            "songs/happy/b.mp3",
            "songs/happy/c.mp3",
        ]);
        let first = library.track_for("happy", 42).unwrap();
        assert_eq!(library.track_for("happy", 42).unwrap(), first);
        assert!(first.starts_with(library.songs_dir.join("happy")));
    }

    #[test]
    fn test_missing_genre_has_no_track_but_fallback_may() {
        let (_dir, library) = library_with(&["songs/calm/quiet.mp3", "overlays/1.mp4"]);
        assert!(library.track_for("funky", 1).is_none());
        assert!(library.fallback_track(1).unwrap().ends_with("calm/quiet.mp3"));
        assert!(library.overlay_for(7).unwrap().ends_with("1.mp4"));
    }

    #[test]
    fn test_transitions_are_stable_per_item_and_junction() {
        let first = transitions_for(7, 5);
        assert_eq!(first.len(), 5);
        assert_eq!(transitions_for(7, 5), first);
        assert!(first.iter().all(|t| TRANSITIONS.contains(t)));

        // Junctions are chosen independently, so across many items the
        // choices are not all the same transition
        let distinct: std::collections::HashSet<_> =
            (1..50).flat_map(|item| transitions_for(item, 5)).collect();
        assert!(distinct.len() > 1);
        assert!(transitions_for(3, 0).is_empty());
    }

    #[test]
    fn test_non_matching_files_are_ignored() {
        let (_dir, library) = library_with(&["songs/sad/notes.txt"]);
        assert!(library.track_for("sad", 3).is_none());
        assert!(library.overlay_for(3).is_none());
    }
}
