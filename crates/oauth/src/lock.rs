//! Cross-process exclusive lock backed by a kernel advisory file lock.
//!
//! The lock is released by the kernel when the holding process exits, so a
//! crashed or killed invocation never strands it (unlike PID files).

use std::{
    fs::{File, OpenOptions},
    future::Future,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use {
    tokio::time::{Instant, sleep},
    tracing::{debug, warn},
};

use crate::error::{Error, Result};

/// Exponential backoff policy for lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Total time budget before giving up with [`Error::LockTimeout`].
    pub max_elapsed: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            max_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_elapsed: Duration::from_secs(120),
        }
    }
}

impl Backoff {
    fn next_interval(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier).min(self.max_interval)
    }
}

/// An exclusive lock on a well-known absolute path.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    backoff: Backoff,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(Error::RelativeLockPath(path));
        }
        Ok(Self {
            path,
            backoff: Backoff::default(),
        })
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` while holding the lock.
    ///
    /// Acquisition retries a non-blocking exclusive lock with exponential
    /// backoff until it succeeds or the backoff budget runs out. The lock is
    /// released when `f` completes, whether it succeeded or not.
    pub async fn with_lock<F, Fut, T>(&self, backoff: Option<Backoff>, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let backoff = backoff.unwrap_or(self.backoff);
        let mut handle = fd_lock::RwLock::new(self.open()?);

        let started = Instant::now();
        let mut interval = backoff.initial;
        let mut attempt: u32 = 0;
        let _guard = loop {
            attempt += 1;
            match handle.try_write() {
                Ok(guard) => break guard,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    let waited = started.elapsed();
                    if waited >= backoff.max_elapsed {
                        warn!(path = %self.path.display(), attempt, "gave up waiting for lock");
                        return Err(Error::LockTimeout {
                            path: self.path.clone(),
                            waited,
                        });
                    }
                    debug!(path = %self.path.display(), attempt, ?interval, "lock busy, backing off");
                    sleep(interval.min(backoff.max_elapsed - waited)).await;
                    interval = backoff.next_interval(interval);
                },
                Err(e) => return Err(e.into()),
            }
        };

        debug!(path = %self.path.display(), attempt, "lock acquired");
        f().await
    }

    fn open(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)?;
        Ok(file)
    }
}
