use crate::archiver::process;
use crate::error::ArchiverError;
use anyhow::{Context, Result};
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const DAEMON_LOCK_FILE: &str = "daemon.lock";

/// Contents of the lock file, for `status` and `stop`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub build_uuid: String,
    pub start_time: String,
    pub archive_dir: PathBuf,
}

pub fn lock_path(state_dir: &Path) -> PathBuf {
    state_dir.join(DAEMON_LOCK_FILE)
}

/// Exclusive hold on a state dir for the life of the daemon. The file is
/// removed and unlocked on drop.
#[derive(Debug)]
pub struct DaemonLock {
    file: File,
    path: PathBuf,
}

impl DaemonLock {
    pub fn acquire(state_dir: &Path, archive_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("failed to create {}", state_dir.display()))?;
        let path = lock_path(state_dir);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            let pid = read_lock_info(state_dir)
                .ok()
                .flatten()
                .map_or_else(|| "unknown".to_string(), |info| info.pid.to_string());
            return Err(ArchiverError::DaemonLocked {
                state_dir: state_dir.to_path_buf(),
                pid,
            }
            .into());
        }

        let info = LockInfo {
            pid: std::process::id(),
            build_uuid: env!("BUILD_UUID").to_string(),
            start_time: Utc::now().to_rfc3339(),
            archive_dir: archive_dir.to_path_buf(),
        };
        file.set_len(0)?;
        file.write_all(serde_json::to_string(&info)?.as_bytes())?;
        file.sync_all()?;

        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), "failed to remove daemon lock: {err}");
        }
        let _ = FileExt::unlock(&self.file);
    }
}

/// `Ok(None)` when no daemon has left a lock behind.
pub fn read_lock_info(state_dir: &Path) -> Result<Option<LockInfo>> {
    let path = lock_path(state_dir);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
    };
    let info = serde_json::from_str(&raw)
        .with_context(|| format!("daemon lock {} is corrupt", path.display()))?;
    Ok(Some(info))
}

/// The daemon currently serving `archive_dir` from `state_dir`, if its
/// process is still alive.
pub fn running_daemon(state_dir: &Path, archive_dir: &Path) -> Result<Option<LockInfo>> {
    let Some(info) = read_lock_info(state_dir)? else {
        return Ok(None);
    };
    if info.archive_dir != archive_dir || !process::is_running(info.pid)? {
        return Ok(None);
    }
    Ok(Some(info))
}
