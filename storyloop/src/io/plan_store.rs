//! Plan persistence: sidecar-locked atomic writes, bounded repair on load.
//!
//! The agent edits the plan document directly, so the store never trusts that
//! the file is well-formed. Writes go to a temp file in the same directory and are
//! renamed over the destination, which keeps readers from seeing half a document
//! and lets `load` run without taking the lock.

use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::core::repair::Repair;
use crate::error::StoreError;
use crate::plan::Plan;

/// How often lock acquisition is retried.
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

const LOCK_SUFFIX: &str = ".lock";
const TEMP_SUFFIX: &str = ".tmp";

/// Globs, relative to the same base as `plan_file`, for the lock and temp
/// files the store creates beside it. They never belong in a commit.
pub fn scratch_globs(plan_file: &str) -> Vec<String> {
    let plan = Path::new(plan_file);
    let name = plan
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = format!(".{name}.*{TEMP_SUFFIX}");
    let temp = match plan.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(dir) => dir.join(temp).to_string_lossy().into_owned(),
        None => temp,
    };
    vec![format!("{plan_file}{LOCK_SUFFIX}"), temp]
}

/// Persistence for the plan document.
#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn load(&self) -> Result<Plan, StoreError>;

    /// Persist `plan`, bumping its version on success.
    async fn save(&self, plan: &mut Plan) -> Result<(), StoreError>;

    /// Remove the document. Missing documents are not an error.
    async fn delete(&self) -> Result<(), StoreError>;
}

/// JSON plan file guarded by an advisory lock on `<plan>.lock`.
#[derive(Debug, Clone)]
pub struct FilePlanStore {
    path: PathBuf,
    lock_timeout: Duration,
    retry_interval: Duration,
}

impl FilePlanStore {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            lock_timeout,
            retry_interval: LOCK_RETRY_INTERVAL,
        }
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(LOCK_SUFFIX);
        PathBuf::from(name)
    }

    /// Blocking load; see [`PlanStore::load`].
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn load_blocking(&self) -> Result<Plan, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    path: self.path.clone(),
                });
            }
            Err(err) => {
                return Err(StoreError::Io(
                    anyhow::Error::new(err).context(format!("read plan {}", self.path.display())),
                ));
            }
        };
        let raw = String::from_utf8(bytes).map_err(|err| StoreError::Corrupt {
            path: self.path.clone(),
            reason: format!("not valid UTF-8: {err}"),
        })?;
        parse_with_repair(&raw).map_err(|reason| StoreError::Corrupt {
            path: self.path.clone(),
            reason,
        })
    }

    /// Blocking save; see [`PlanStore::save`].
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn save_blocking(&self, plan: &mut Plan) -> Result<(), StoreError> {
        let parent = parent_dir(&self.path);
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))
            .map_err(StoreError::Io)?;

        let _lock = self.acquire_lock()?;
        let mut staged = plan.clone();
        staged.version = staged.version.saturating_add(1);
        write_atomic(&self.path, &canonical_json(&staged).map_err(StoreError::Io)?)
            .map_err(StoreError::Io)?;
        plan.version = staged.version;
        debug!(version = plan.version, "plan saved");
        Ok(())
    }

    /// Blocking delete; see [`PlanStore::delete`].
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn delete_blocking(&self) -> Result<(), StoreError> {
        let lock_path = self.lock_path();
        if !self.path.exists() && !lock_path.exists() {
            return Ok(());
        }
        // Unlink the sidecar while still holding it; waiters on the old inode
        // notice the swap in `acquire_lock` and reopen.
        let _lock = self.acquire_lock()?;
        remove_if_present(&self.path).map_err(StoreError::Io)?;
        remove_if_present(&lock_path).map_err(StoreError::Io)?;
        debug!("plan deleted");
        Ok(())
    }

    /// Take the sidecar lock, polling until `lock_timeout` elapses.
    ///
    /// The lock file is reopened on every attempt: a lock taken on a file that
    /// has since been unlinked or replaced guards nothing and is dropped.
    /// The lock is released when the returned handle is dropped.
    fn acquire_lock(&self) -> Result<File, StoreError> {
        let lock_path = self.lock_path();
        let started = Instant::now();
        loop {
            let file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&lock_path)
                .with_context(|| format!("open lock file {}", lock_path.display()))
                .map_err(StoreError::Io)?;

            match file.try_lock() {
                Ok(()) if is_current_lock(&file, &lock_path) => return Ok(file),
                Ok(()) => debug!(lock = %lock_path.display(), "lock file replaced while waiting"),
                Err(TryLockError::WouldBlock) => {}
                Err(TryLockError::Error(err)) => {
                    return Err(StoreError::Io(
                        anyhow::Error::new(err)
                            .context(format!("lock {}", lock_path.display())),
                    ));
                }
            }

            let waited = started.elapsed();
            if waited >= self.lock_timeout {
                warn!(lock = %lock_path.display(), ?waited, "plan lock timed out");
                return Err(StoreError::LockTimeout {
                    path: lock_path,
                    waited,
                });
            }
            thread::sleep(self.retry_interval);
        }
    }
}

/// Whether `file` is still the inode behind `path`.
#[cfg(unix)]
fn is_current_lock(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), fs::metadata(path)) {
        (Ok(held), Ok(on_disk)) => held.dev() == on_disk.dev() && held.ino() == on_disk.ino(),
        _ => false,
    }
}

/// Open files cannot be unlinked here, so the handle is always current.
#[cfg(not(unix))]
fn is_current_lock(_file: &File, _path: &Path) -> bool {
    true
}

#[async_trait]
impl PlanStore for FilePlanStore {
    async fn load(&self) -> Result<Plan, StoreError> {
        let store = self.clone();
        blocking(move || store.load_blocking()).await
    }

    async fn save(&self, plan: &mut Plan) -> Result<(), StoreError> {
        let store = self.clone();
        let mut staged = plan.clone();
        let saved = blocking(move || {
            store.save_blocking(&mut staged)?;
            Ok(staged)
        })
        .await?;
        plan.version = saved.version;
        Ok(())
    }

    async fn delete(&self) -> Result<(), StoreError> {
        let store = self.clone();
        blocking(move || store.delete_blocking()).await
    }
}

async fn blocking<T, F>(work: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| StoreError::Io(anyhow::Error::new(err).context("plan store task failed")))?
}

/// Parse a plan, falling back to each repair in turn.
///
/// Repairs accumulate: the second one runs on the output of the first.
fn parse_with_repair(raw: &str) -> Result<Plan, String> {
    let original_err = match serde_json::from_str::<Plan>(raw) {
        Ok(plan) => return Ok(plan),
        Err(err) => err,
    };

    let mut text = raw.to_string();
    for repair in Repair::ALL {
        let Some(fixed) = repair.apply(&text) else {
            continue;
        };
        text = fixed;
        match serde_json::from_str::<Plan>(&text) {
            Ok(plan) => {
                warn!(repair = repair.as_str(), "plan document repaired");
                return Ok(plan);
            }
            Err(err) => debug!(repair = repair.as_str(), %err, "repair did not help"),
        }
    }
    Err(original_err.to_string())
}

/// Pretty JSON (two-space indent) with a trailing newline.
pub fn canonical_json(plan: &Plan) -> anyhow::Result<String> {
    let mut buf = serde_json::to_string_pretty(plan).context("serialize plan")?;
    buf.push('\n');
    Ok(buf)
}

fn write_atomic(path: &Path, contents: &str) -> anyhow::Result<()> {
    let parent = parent_dir(path);
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("plan path has no file name: {}", path.display()))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{}.", file_name.to_string_lossy()))
        .suffix(TEMP_SUFFIX)
        .tempfile_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    tmp.write_all(contents.as_bytes())
        .with_context(|| format!("write temp file {}", tmp.path().display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("sync temp file {}", tmp.path().display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("replace plan {}", path.display()))?;
    Ok(())
}

fn remove_if_present(path: &Path) -> anyhow::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(anyhow::Error::new(err).context(format!("remove {}", path.display()))),
    }
}

fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
}
