//! Retention sweep: delete intermediate artifacts of published work items.

use std::io::ErrorKind;
use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::{ArtifactLayout, EventType, StageEvent, Subject, UnitRef};
use crate::store::Store;

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepSummary {
    /// Terminal items inspected
    pub items: usize,

    /// Files and directories removed
    pub removed: usize,

    /// Removals that failed for a reason other than the path being gone
    pub errors: usize,
}

pub struct RetentionSweep {
    store: Store,
    layout: ArtifactLayout,
}

/// Remove a file or directory tree; `Ok(false)` if it was already gone
async fn remove_path(path: &Path) -> std::io::Result<bool> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    let removed = if meta.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };

    match removed {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

impl RetentionSweep {
    pub fn new(store: Store, layout: ArtifactLayout) -> Self {
        Self { store, layout }
    }

    /// Sweep every work item whose publish sentinel is set.
    ///
    /// Only terminal items are touched, so the sweep can run alongside stage
    /// workers. The final video is kept.
    pub async fn run(&self) -> Result<SweepSummary> {
        let mut summary = SweepSummary::default();

        for item in self.store.terminal_items()? {
            summary.items += 1;
            let segment_ids: Vec<i64> = self
                .store
                .segments_for(item.id)?
                .iter()
                .map(|s| s.id)
                .collect();

            let mut removed = 0;
            for path in self.layout.intermediate_paths(item.id, &segment_ids) {
                match remove_path(&path).await {
                    Ok(true) => {
                        debug!(work_item_id = item.id, path = %path.display(), "Removed artifact");
                        removed += 1;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(work_item_id = item.id, path = %path.display(), error = %e, "Failed to remove artifact");
                        summary.errors += 1;
                    }
                }
            }

            if removed > 0 {
                self.store.append_event(&StageEvent::new(
                    Subject::Unit(UnitRef::work_item(item.id)),
                    None,
                    EventType::Swept,
                    format!("removed {removed} intermediate artifacts"),
                ))?;
                summary.removed += removed;
            }
        }

        info!(
            items = summary.items,
            removed = summary.removed,
            errors = summary.errors,
            "Retention sweep finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_paths_are_not_errors() {
        let dir = TempDir::new().unwrap();
        assert!(!remove_path(&dir.path().join("gone")).await.unwrap());

        let nested = dir.path().join("clip/4");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("video.mp4"), b"x").unwrap();
        assert!(remove_path(&nested).await.unwrap());
        assert!(!nested.exists());
    }

    #[tokio::test]
    async fn test_sweep_without_terminal_items_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let store = Store::open_in_memory().unwrap();
        let sweep = RetentionSweep::new(store, ArtifactLayout::new(dir.path()));

        let summary = sweep.run().await.unwrap();
        assert_eq!(summary.items, 0);
        assert_eq!(summary.removed, 0);
    }
}
