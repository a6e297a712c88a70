//! Keeps the capture child alive for the life of the daemon.
//!
//! The supervisor is an explicit state machine:
//!
//! ```text
//! Stopped -> Starting -> Running -> Restarting  -> Starting ...
//!                                -> RollingOver -> Starting ...
//!                                -> ShuttingDown -> Stopped
//! ```
//!
//! `Restarting` follows any exit we did not ask for (crash, clean exit, or a
//! failed spawn) and waits out the backoff first. `RollingOver` happens at
//! every bucket end boundary so each hour gets its own playlist; it restarts
//! immediately and does not count as a restart. Every wait selects on the
//! cancellation token, and shutdown only finishes once the child is reaped.

use crate::archiver::bucket::TimeBucket;
use crate::archiver::ffmpeg::{CaptureSpec, resolve_ffmpeg_bin};
use crate::archiver::process::{self, Termination};
use crate::archiver::warn::{self, WarnEvent};
use crate::error::ArchiverWarnCode;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Restarting,
    RollingOver,
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub restart_backoff: Duration,
    pub stop_grace: Duration,
    /// Restart the child at every bucket boundary. Always on in the daemon.
    pub rollover: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SupervisorReport {
    pub restarts: u64,
    pub rollovers: u64,
    pub spawn_failures: u64,
}

/// The live child plus what we know about it.
pub struct CaptureProcessHandle {
    child: Child,
    pid: Option<u32>,
    bucket: TimeBucket,
    started_at: Instant,
    restart_count: u64,
}

impl CaptureProcessHandle {
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

enum Wake {
    Cancelled,
    Exited(io::Result<ExitStatus>),
    BucketClosed,
}

pub struct CaptureSupervisor {
    spec: CaptureSpec,
    opts: SupervisorOptions,
    state: SupervisorState,
    report: SupervisorReport,
    on_restart: Option<Box<dyn Fn(&SupervisorReport, &str) + Send + Sync>>,
    clock: Clock,
}

impl CaptureSupervisor {
    pub fn new(spec: CaptureSpec, opts: SupervisorOptions) -> Self {
        Self {
            spec,
            opts,
            state: SupervisorState::Stopped,
            report: SupervisorReport::default(),
            on_restart: None,
            clock: Arc::new(Utc::now),
        }
    }

    /// Wall clock used to pick buckets and schedule rollover.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Called after every unexpected exit, e.g. to write an audit record.
    pub fn on_restart(
        mut self,
        hook: impl Fn(&SupervisorReport, &str) + Send + Sync + 'static,
    ) -> Self {
        self.on_restart = Some(Box::new(hook));
        self
    }

    fn transition(&mut self, next: SupervisorState) {
        if self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "capture supervisor state change");
            self.state = next;
        }
    }

    fn start(&mut self, bucket: TimeBucket) -> Result<CaptureProcessHandle> {
        let bin = resolve_ffmpeg_bin(&self.spec.ffmpeg_bin)?;
        std::fs::create_dir_all(&self.spec.archive_dir)?;
        let child = process::spawn_logged(&bin, &self.spec.args(&bucket), "capture", bucket.id())?;
        let pid = child.id();
        tracing::info!(
            bucket = %bucket,
            pid = pid.unwrap_or_default(),
            restarts = self.report.restarts,
            "capture started"
        );
        Ok(CaptureProcessHandle {
            child,
            pid,
            bucket,
            started_at: Instant::now(),
            restart_count: self.report.restarts,
        })
    }

    async fn wait(&self, handle: &mut CaptureProcessHandle, cancel: &CancellationToken) -> Wake {
        let until_boundary = handle
            .bucket
            .remaining((self.clock)())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let boundary = tokio::time::sleep(until_boundary);

        tokio::select! {
            () = cancel.cancelled() => Wake::Cancelled,
            status = handle.child.wait() => Wake::Exited(status),
            () = boundary, if self.opts.rollover => Wake::BucketClosed,
        }
    }

    /// Sleep out the backoff. `false` means we were cancelled meanwhile.
    async fn backoff(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            () = cancel.cancelled() => false,
            () = tokio::time::sleep(self.opts.restart_backoff) => true,
        }
    }

    async fn stop_child(&self, handle: &mut CaptureProcessHandle) -> Option<Termination> {
        match process::terminate(&mut handle.child, self.opts.stop_grace).await {
            Ok(outcome) => {
                tracing::info!(
                    bucket = %handle.bucket,
                    pid = handle.pid.unwrap_or_default(),
                    outcome = outcome.label(),
                    status = %outcome.status(),
                    "capture stopped"
                );
                Some(outcome)
            }
            Err(err) => {
                tracing::error!(bucket = %handle.bucket, "failed to stop capture: {err:#}");
                None
            }
        }
    }

    fn record_restart(&mut self, action: &str, bucket: &TimeBucket, reason: &str, err: &str) {
        self.report.restarts += 1;
        warn::emit(WarnEvent {
            bucket: &bucket.id(),
            retry: &format!("backoff={}ms", self.opts.restart_backoff.as_millis()),
            reason,
            err,
            ..WarnEvent::new(
                if action == "spawn" {
                    ArchiverWarnCode::W006SpawnFailed
                } else {
                    ArchiverWarnCode::W003CaptureExited
                },
                "capture",
                action,
            )
        });
        tracing::warn!(restarts = self.report.restarts, "restarting capture");
        if let Some(hook) = &self.on_restart {
            hook(&self.report, reason);
        }
    }

    /// Run until `cancel` fires. Returns once the child has been reaped.
    pub async fn run(mut self, cancel: CancellationToken) -> SupervisorReport {
        let mut next_bucket: Option<TimeBucket> = None;

        while !cancel.is_cancelled() {
            self.transition(SupervisorState::Starting);
            let now_bucket = TimeBucket::containing((self.clock)());
            let bucket = next_bucket.map_or(now_bucket, |b| b.max(now_bucket));
            next_bucket = None;

            let mut handle = match self.start(bucket) {
                Ok(handle) => handle,
                Err(err) => {
                    self.report.spawn_failures += 1;
                    self.record_restart("spawn", &bucket, "spawn-failed", &format!("{err:#}"));
                    self.transition(SupervisorState::Restarting);
                    if !self.backoff(&cancel).await {
                        break;
                    }
                    continue;
                }
            };
            self.transition(SupervisorState::Running);

            match self.wait(&mut handle, &cancel).await {
                Wake::Cancelled => {
                    self.transition(SupervisorState::ShuttingDown);
                    self.stop_child(&mut handle).await;
                    break;
                }
                Wake::BucketClosed => {
                    self.transition(SupervisorState::RollingOver);
                    self.stop_child(&mut handle).await;
                    self.report.rollovers += 1;
                    next_bucket = Some(handle.bucket.next());
                    tracing::info!(
                        from = %handle.bucket,
                        uptime_secs = handle.uptime().as_secs(),
                        "capture rolled over to next bucket"
                    );
                }
                Wake::Exited(status) => {
                    let detail = match status {
                        Ok(status) => status.to_string(),
                        Err(err) => err.to_string(),
                    };
                    tracing::debug!(
                        previous_restarts = handle.restart_count,
                        uptime_secs = handle.uptime().as_secs(),
                        "capture exited unexpectedly"
                    );
                    self.record_restart("exit", &handle.bucket, "unexpected-exit", &detail);
                    self.transition(SupervisorState::Restarting);
                    if !self.backoff(&cancel).await {
                        break;
                    }
                }
            }
        }

        self.transition(SupervisorState::Stopped);
        tracing::info!(
            restarts = self.report.restarts,
            rollovers = self.report.rollovers,
            "capture supervisor stopped"
        );
        self.report
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::tempdir;

    fn write_fake_ffmpeg(path: &Path, body: &str) {
        fs::write(path, format!("#!/usr/bin/env bash\n{body}\n")).expect("write fake ffmpeg");
        let mut perms = fs::metadata(path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).expect("chmod");
    }

    fn spec(bin: PathBuf, dir: &Path) -> CaptureSpec {
        CaptureSpec {
            ffmpeg_bin: bin,
            stream_url: "rtsp://camera/stream".to_string(),
            archive_dir: dir.to_path_buf(),
            segment_secs: 10,
        }
    }

    fn opts(backoff_ms: u64, grace_ms: u64) -> SupervisorOptions {
        // Rollover is covered by its own test with a shifted clock.
        SupervisorOptions {
            restart_backoff: Duration::from_millis(backoff_ms),
            stop_grace: Duration::from_millis(grace_ms),
            rollover: false,
        }
    }

    #[tokio::test]
    async fn crashing_capture_is_restarted_until_cancelled() {
        let tmp = tempdir().expect("tempdir");
        let bin = tmp.path().join("ffmpeg");
        let starts = tmp.path().join("starts.log");
        write_fake_ffmpeg(&bin, &format!("echo start >> '{}'\nexit 1", starts.display()));

        let cancel = CancellationToken::new();
        let hook_calls = Arc::new(AtomicU64::new(0));
        let seen = hook_calls.clone();
        let supervisor = CaptureSupervisor::new(spec(bin, tmp.path()), opts(20, 500))
            .on_restart(move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        let task = tokio::spawn(supervisor.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(400)).await;
        cancel.cancel();
        let report = task.await.expect("join");

        assert!(report.restarts >= 2, "{report:?}");
        assert_eq!(report.spawn_failures, 0);
        assert_eq!(hook_calls.load(Ordering::SeqCst), report.restarts);
        let started = fs::read_to_string(&starts).expect("starts log").lines().count() as u64;
        assert!(started >= report.restarts);
    }

    #[tokio::test]
    async fn clean_exit_before_cancellation_still_counts_as_restart() {
        let tmp = tempdir().expect("tempdir");
        let bin = tmp.path().join("ffmpeg");
        write_fake_ffmpeg(&bin, "exit 0");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            CaptureSupervisor::new(spec(bin, tmp.path()), opts(20, 500)).run(cancel.clone()),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        let report = task.await.expect("join");
        assert!(report.restarts >= 1, "{report:?}");
    }

    #[tokio::test]
    async fn missing_binary_is_retried_like_a_crash() {
        let tmp = tempdir().expect("tempdir");
        let bin = tmp.path().join("not-installed").join("ffmpeg");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            CaptureSupervisor::new(spec(bin, tmp.path()), opts(20, 500)).run(cancel.clone()),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        let report = task.await.expect("join");

        assert!(report.spawn_failures >= 2, "{report:?}");
        assert_eq!(report.restarts, report.spawn_failures);
    }

    #[tokio::test]
    async fn cancellation_terminates_running_capture_and_passes_arguments() {
        let tmp = tempdir().expect("tempdir");
        let bin = tmp.path().join("ffmpeg");
        let args_log = tmp.path().join("args.log");
        write_fake_ffmpeg(
            &bin,
            &format!("printf '%s\\n' \"$@\" > '{}'\nexec sleep 30", args_log.display()),
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            CaptureSupervisor::new(spec(bin, tmp.path()), opts(20, 2_000)).run(cancel.clone()),
        );
        tokio::time::sleep(Duration::from_millis(300)).await;
        let started = Instant::now();
        cancel.cancel();
        let report = task.await.expect("join");

        assert_eq!(report.restarts, 0);
        assert!(started.elapsed() < Duration::from_secs(2));
        let args = fs::read_to_string(&args_log).expect("args log");
        assert!(args.contains("rtsp://camera/stream"));
        assert!(args.contains("append_list"));
        assert!(args.contains("_segment_%05d.ts"));
    }

    #[tokio::test]
    async fn bucket_boundary_rolls_capture_over_without_counting_a_restart() {
        let tmp = tempdir().expect("tempdir");
        let bin = tmp.path().join("ffmpeg");
        let args_log = tmp.path().join("args.log");
        write_fake_ffmpeg(
            &bin,
            &format!("for last; do :; done\necho \"$last\" >> '{}'\nexec sleep 30", args_log.display()),
        );

        // Shift the clock so the current bucket closes 300ms from now.
        let real = Utc::now();
        let first = TimeBucket::containing(real);
        let offset = first.end() - real - chrono::TimeDelta::milliseconds(300);
        let options = SupervisorOptions {
            rollover: true,
            ..opts(5_000, 2_000)
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            CaptureSupervisor::new(spec(bin, tmp.path()), options)
                .with_clock(move || Utc::now() + offset)
                .run(cancel.clone()),
        );
        let mut playlists = Vec::new();
        for _ in 0..100 {
            playlists = fs::read_to_string(&args_log)
                .map(|log| log.lines().map(str::to_string).collect())
                .unwrap_or_default();
            if playlists.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
        let report = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("supervisor returns")
            .expect("join");

        assert_eq!(report.rollovers, 1, "{report:?}");
        assert_eq!(report.restarts, 0);
        assert_eq!(
            playlists,
            vec![
                crate::archiver::layout::playlist_path(tmp.path(), &first).display().to_string(),
                crate::archiver::layout::playlist_path(tmp.path(), &first.next()).display().to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn stubborn_capture_is_killed_after_grace_period() {
        let tmp = tempdir().expect("tempdir");
        let bin = tmp.path().join("ffmpeg");
        write_fake_ffmpeg(&bin, "trap '' TERM\nwhile true; do sleep 0.1; done");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            CaptureSupervisor::new(spec(bin, tmp.path()), opts(20, 200)).run(cancel.clone()),
        );
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        let report = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("supervisor returns after escalating")
            .expect("join");
        assert_eq!(report.restarts, 0);
    }
}
