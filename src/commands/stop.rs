use anyhow::Result;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use crate::archiver::config::ArchiverConfig;
use crate::archiver::lock::{lock_path, read_lock_info};
use crate::archiver::process;
use crate::commands::{CommandReport, block_on};

const DAEMON_BINARY: &str = "cctv-archiver";
// On top of the capture grace: reaping the child and releasing the lock.
const STOP_MARGIN: Duration = Duration::from_secs(15);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long `stop` waits for the daemon it signalled.
fn stop_timeout(cfg: &ArchiverConfig) -> Duration {
    cfg.stop_grace() + STOP_MARGIN
}

fn remove_stale_lock(path: &Path) -> Option<String> {
    match fs::remove_file(path) {
        Ok(()) => Some(format!("removed stale daemon lock {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => None,
        Err(err) => Some(format!("failed to remove daemon lock {}: {err}", path.display())),
    }
}

/// SIGTERM `pid` and poll until it is gone. `Ok(false)` on timeout.
async fn signal_and_wait(pid: u32, timeout: Duration) -> Result<bool> {
    if let Err(err) = process::send_sigterm(pid).await {
        if process::is_running(pid)? {
            return Err(err);
        }
        return Ok(true);
    }

    let exited = async {
        let mut ticker = tokio::time::interval(STOP_POLL_INTERVAL);
        loop {
            ticker.tick().await;
            if !process::is_running(pid)? {
                return Ok::<(), anyhow::Error>(());
            }
        }
    };
    match tokio::time::timeout(timeout, exited).await {
        Ok(result) => result.map(|()| true),
        Err(_) => Ok(false),
    }
}

pub fn run(cfg: &ArchiverConfig) -> Result<CommandReport> {
    let mut report = CommandReport::new("stop");
    let lock = lock_path(&cfg.state_dir);
    report.detail(format!("daemon_lock={}", lock.display()));

    let info = match read_lock_info(&cfg.state_dir) {
        Ok(Some(info)) => info,
        Ok(None) => {
            report.detail("archiver daemon already stopped (lock file not found)");
            return Ok(report);
        }
        Err(err) => {
            report.issue(format!("failed to read daemon lock: {err:#}"));
            return Ok(report);
        }
    };
    let pid = info.pid;
    report.detail(format!("daemon_pid={pid}"));

    let snapshot = match process::inspect(pid)? {
        Some(snapshot) if !snapshot.is_zombie() => snapshot,
        _ => {
            report.detail(format!("daemon pid {pid} is not running"));
            if let Some(note) = remove_stale_lock(&lock) {
                report.detail(note);
            }
            return Ok(report);
        }
    };
    if !snapshot.command.contains(DAEMON_BINARY) {
        report.issue(format!(
            "refusing to stop pid {pid}; command does not match archiver daemon: {}",
            if snapshot.command.is_empty() {
                "<unknown>"
            } else {
                snapshot.command.as_str()
            }
        ));
        return Ok(report);
    }

    let timeout = stop_timeout(cfg);
    if !block_on(signal_and_wait(pid, timeout))?? {
        report.issue(format!(
            "timed out waiting for daemon pid {pid} to stop after {}s",
            timeout.as_secs()
        ));
        return Ok(report);
    }

    report.detail(format!("stopped archiver daemon pid={pid}"));
    if let Some(note) = remove_stale_lock(&lock) {
        report.detail(note);
    }
    Ok(report)
}
