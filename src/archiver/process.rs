//! Child-process plumbing shared by the capture supervisor and the muxer,
//! plus the pid checks `status` and `stop` run against the daemon.

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

/// How a child ended after we asked it to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// It had already exited before the request.
    AlreadyExited(ExitStatus),
    /// It honoured SIGTERM within the grace period.
    Graceful(ExitStatus),
    /// The grace period elapsed and it was killed.
    Killed(ExitStatus),
}

impl Termination {
    pub fn status(self) -> ExitStatus {
        match self {
            Self::AlreadyExited(s) | Self::Graceful(s) | Self::Killed(s) => s,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::AlreadyExited(_) => "already-exited",
            Self::Graceful(_) => "graceful",
            Self::Killed(_) => "killed",
        }
    }
}

/// Spawn `bin args..` with stdout discarded and stderr forwarded line by line
/// to the log under `component`/`bucket`.
pub fn spawn_logged(
    bin: &Path,
    args: &[OsString],
    component: &'static str,
    bucket: String,
) -> Result<Child> {
    let mut child = Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn `{}`", bin.display()))?;

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(component, bucket = %bucket, "{line}");
            }
        });
    }

    Ok(child)
}

/// What `ps` reports about a pid we did not spawn ourselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub state: String,
    pub command: String,
}

impl ProcessSnapshot {
    pub fn is_zombie(&self) -> bool {
        self.state.starts_with('Z')
    }
}

/// `Ok(None)` when no process has `pid`.
pub fn inspect(pid: u32) -> Result<Option<ProcessSnapshot>> {
    let pid = pid.to_string();
    let output = std::process::Command::new("ps")
        .args(["-p", pid.as_str(), "-o", "stat=", "-o", "command="])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .context("failed to inspect process with `ps`")?;
    if !output.status.success() {
        return Ok(None);
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (state, command) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    Ok(Some(ProcessSnapshot {
        state: state.to_string(),
        command: command.trim().to_string(),
    }))
}

/// Zombies count as gone: they only wait to be reaped.
pub fn is_running(pid: u32) -> Result<bool> {
    Ok(inspect(pid)?.is_some_and(|snapshot| !snapshot.is_zombie()))
}

/// SIGTERM by pid, through the system `kill`.
pub async fn send_sigterm(pid: u32) -> Result<()> {
    let status = Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .context("failed to send SIGTERM with `kill -TERM`")?;
    if !status.success() {
        anyhow::bail!("`kill -TERM {pid}` exited with {status}");
    }
    Ok(())
}

/// Ask `child` to stop: SIGTERM, wait up to `grace`, then SIGKILL. Always
/// reaps the child before returning.
pub async fn terminate(child: &mut Child, grace: Duration) -> Result<Termination> {
    if let Some(status) = child.try_wait()? {
        return Ok(Termination::AlreadyExited(status));
    }

    let sent = match child.id() {
        Some(pid) => send_sigterm(pid).await,
        None => Ok(()),
    };

    match sent {
        Ok(()) => {
            if let Ok(waited) = tokio::time::timeout(grace, child.wait()).await {
                return Ok(Termination::Graceful(waited?));
            }
        }
        Err(err) => tracing::debug!("graceful stop unavailable, escalating: {err:#}"),
    }

    child.start_kill().context("failed to SIGKILL child")?;
    let status = child.wait().await.context("failed to reap killed child")?;
    Ok(Termination::Killed(status))
}
