// src/lock/mod.rs

//! Host-wide advisory lock guarding packet-filter mutations.
//!
//! The lock is a single `locked`/`free` value kept outside process memory
//! (by default a file) so every agent process on the host observes it.
//! It is coarse and non-reentrant: one firewall or floating-IP mutation may
//! be in flight on the host at a time.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Persisted lock state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// A mutation is in flight
    Locked,

    /// No mutation is in flight
    Free,
}

impl LockState {
    fn as_str(self) -> &'static str {
        match self {
            LockState::Locked => "locked",
            LockState::Free => "free",
        }
    }

    /// Parses a persisted value. Empty or unknown values read as free.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "locked" | "1" | "True" => LockState::Locked,
            _ => LockState::Free,
        }
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from the lock manager
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock not released within {0:?}")]
    Timeout(Duration),

    #[error("lock state unavailable at {path}: {error}")]
    Backend { path: String, error: String },
}

/// Storage for the lock state
pub trait LockBackend: Send + Sync {
    /// Reads the current state
    fn read(&self) -> Result<LockState, LockError>;

    /// Unconditionally writes the state
    fn write(&self, state: LockState) -> Result<(), LockError>;
}

/// Lock state persisted in a file, visible to every process on the host
pub struct FileLockBackend {
    path: PathBuf,
}

impl FileLockBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backend_error(&self, error: std::io::Error) -> LockError {
        LockError::Backend {
            path: self.path.display().to_string(),
            error: error.to_string(),
        }
    }
}

impl LockBackend for FileLockBackend {
    fn read(&self) -> Result<LockState, LockError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(LockState::parse(&raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LockState::Free),
            Err(e) => Err(self.backend_error(e)),
        }
    }

    fn write(&self, state: LockState) -> Result<(), LockError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.backend_error(e))?;
        }
        // temp + rename so readers never see a partial value
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, state.as_str()).map_err(|e| self.backend_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.backend_error(e))
    }
}

/// In-process lock state for a single-instance agent
pub struct MemoryLockBackend {
    state: Mutex<LockState>,
}

impl MemoryLockBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState::Free),
        }
    }
}

impl Default for MemoryLockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LockBackend for MemoryLockBackend {
    fn read(&self) -> Result<LockState, LockError> {
        Ok(*self.state.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn write(&self, state: LockState) -> Result<(), LockError> {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
        Ok(())
    }
}

/// Bounded-wait manager over a [`LockBackend`]
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn LockBackend>,
    poll_interval: Duration,
    // makes check-then-mark atomic between tasks of this process
    local: Arc<Mutex<()>>,
}

impl LockManager {
    pub fn new(backend: Arc<dyn LockBackend>, poll_interval: Duration) -> Self {
        Self {
            backend,
            poll_interval,
            local: Arc::new(Mutex::new(())),
        }
    }

    /// Waits until the lock is free, then marks it busy.
    ///
    /// Polls every `poll_interval` while the state reads `locked`. On
    /// timeout nothing is written. The returned guard marks the lock free
    /// when released or dropped.
    pub async fn acquire(&self, timeout: Duration) -> Result<LockGuard, LockError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_mark_busy()? {
                debug!("Firewall lock acquired");
                return Ok(LockGuard {
                    backend: self.backend.clone(),
                    released: false,
                });
            }

            let now = Instant::now();
            if now >= deadline {
                metrics::increment_counter!("virtance_agent_lock_timeouts_total");
                warn!(?timeout, "Firewall lock still held, giving up");
                return Err(LockError::Timeout(timeout));
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    fn try_mark_busy(&self) -> Result<bool, LockError> {
        let _local = self.local.lock().unwrap_or_else(|e| e.into_inner());
        if self.backend.read()? == LockState::Locked {
            return Ok(false);
        }
        self.backend.write(LockState::Locked)?;
        Ok(true)
    }

    /// Unconditionally marks the lock busy
    pub fn mark_busy(&self) -> Result<(), LockError> {
        self.backend.write(LockState::Locked)
    }

    /// Unconditionally marks the lock free
    pub fn mark_free(&self) -> Result<(), LockError> {
        self.backend.write(LockState::Free)
    }

    /// Current persisted state
    pub fn state(&self) -> Result<LockState, LockError> {
        self.backend.read()
    }
}

/// Ownership of the host-wide lock for one mutation
#[must_use = "dropping the guard releases the lock immediately"]
pub struct LockGuard {
    backend: Arc<dyn LockBackend>,
    released: bool,
}

impl LockGuard {
    /// Marks the lock free, reporting a failed write
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        let result = self.backend.write(LockState::Free);
        if result.is_ok() {
            debug!("Firewall lock released");
        }
        result
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.backend.write(LockState::Free) {
                warn!("Failed to release firewall lock: {}", e);
            }
        }
    }
}
