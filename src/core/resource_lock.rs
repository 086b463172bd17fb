//! Host-wide mutual exclusion for heavy collaborators.
//!
//! The language model and the image model cannot share the GPU. Both are
//! wrapped in [`Exclusive`], which holds an exclusive advisory lock on a
//! shared lock file for the duration of each call. The lock is taken with
//! `flock`, so it serializes calls across worker processes as well as within
//! one.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use tokio::time::Instant;

use crate::adapters::{CollaboratorError, ImageSynthesizer, StructuredGenerator};
use crate::domain::{OutputShape, StructuredOutput};

/// How often a waiting caller retries the lock
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Named lock file shared by every holder on the host
#[derive(Debug, Clone)]
pub struct ResourceLock {
    path: PathBuf,
}

/// Held lock; released on drop
#[derive(Debug)]
pub struct ResourceGuard {
    file: File,
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(error = %e, "Failed to release resource lock");
        }
    }
}

impl ResourceLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn open(&self) -> Result<File, CollaboratorError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CollaboratorError::permanent(format!("cannot create lock directory: {e}"))
            })?;
        }
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| {
                CollaboratorError::permanent(format!(
                    "cannot open lock file {}: {e}",
                    self.path.display()
                ))
            })
    }

    /// Wait up to `wait` for the lock.
    ///
    /// Giving up is transient: the holder will finish eventually.
    pub async fn acquire(&self, wait: Duration) -> Result<ResourceGuard, CollaboratorError> {
        let file = self.open()?;
        let deadline = Instant::now() + wait;

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(ResourceGuard { file }),
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {}
                Err(e) => {
                    return Err(CollaboratorError::transient(format!(
                        "failed to lock {}: {e}",
                        self.path.display()
                    )))
                }
            }

            if Instant::now() >= deadline {
                return Err(CollaboratorError::transient(format!(
                    "resource {} still busy after {wait:?}",
                    self.path.display()
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// A collaborator that may only run while holding a [`ResourceLock`]
pub struct Exclusive<T> {
    inner: T,
    lock: ResourceLock,
    wait: Duration,
}

impl<T> Exclusive<T> {
    pub fn new(inner: T, lock: ResourceLock, wait: Duration) -> Self {
        Self { inner, lock, wait }
    }
}

#[async_trait]
impl<T: StructuredGenerator> StructuredGenerator for Exclusive<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn generate(
        &self,
        prompt: &str,
        shape: OutputShape,
    ) -> Result<StructuredOutput, CollaboratorError> {
        let _guard = self.lock.acquire(self.wait).await?;
        tracing::debug!(collaborator = self.inner.name(), "Holding resource lock");
        self.inner.generate(prompt, shape).await
    }
}

#[async_trait]
impl<T: ImageSynthesizer> ImageSynthesizer for Exclusive<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn synthesize_image(&self, directive: &str) -> Result<Vec<u8>, CollaboratorError> {
        let _guard = self.lock.acquire(self.wait).await?;
        tracing::debug!(collaborator = self.inner.name(), "Holding resource lock");
        self.inner.synthesize_image(directive).await
    }
}
