use crate::archiver::audit;
use crate::archiver::classify::{buckets_older_than, remove_files, scan_dir};
use crate::archiver::warn::{self, WarnEvent};
use crate::error::ArchiverWarnCode;
use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionOutcome {
    pub archives_scanned: usize,
    pub deleted: Vec<String>,
    /// Leftover playlists and chunks of expired buckets.
    pub segment_files_deleted: usize,
    pub bytes_freed: u64,
    pub failed: usize,
}

/// Delete every bucket that ended more than `retention` ago, archive and
/// leftover segment files alike. The age comes from the file name, so copies
/// and touches do not extend it.
pub fn reap(dir: &Path, now: DateTime<Utc>, retention: TimeDelta) -> Result<RetentionOutcome> {
    let scan = scan_dir(dir)?;
    let mut out = RetentionOutcome {
        archives_scanned: scan.buckets.values().filter(|f| f.archive.is_some()).count(),
        ..RetentionOutcome::default()
    };

    for (bucket, files) in buckets_older_than(&scan, now, retention) {
        let archive = remove_files(files.archive.iter());
        let segments = remove_files(files.segment_files());
        for (path, err) in archive.failed.iter().chain(&segments.failed) {
            warn::emit(WarnEvent {
                bucket: &bucket.id(),
                path: &path.display().to_string(),
                reason: "expired-delete-failed",
                retry: "next-pass",
                err: err.as_str(),
                ..WarnEvent::new(ArchiverWarnCode::W001DeleteFailed, "retention", "delete")
            });
        }
        if !segments.removed.is_empty() {
            tracing::info!(
                bucket = %bucket,
                files = segments.removed.len(),
                bytes = segments.bytes,
                "retention removed leftover segments of expired bucket"
            );
        }

        out.deleted.extend(
            archive
                .removed
                .iter()
                .filter_map(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned()),
        );
        out.segment_files_deleted += segments.removed.len();
        out.bytes_freed += archive.bytes + segments.bytes;
        out.failed += archive.failed.len() + segments.failed.len();
    }

    Ok(out)
}

/// Periodic reaper. The first pass runs immediately.
pub async fn run_reaper(
    dir: PathBuf,
    state_dir: PathBuf,
    retention: TimeDelta,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::info!("retention reaper shutting down");
                break;
            }
            _ = ticker.tick() => match reap(&dir, Utc::now(), retention) {
                Ok(outcome) => {
                    if !outcome.deleted.is_empty() || outcome.segment_files_deleted > 0 {
                        tracing::info!(
                            deleted = outcome.deleted.len(),
                            segment_files_deleted = outcome.segment_files_deleted,
                            bytes_freed = outcome.bytes_freed,
                            "retention removed expired buckets"
                        );
                        audit::record(
                            &state_dir,
                            "retention",
                            "ok",
                            &format!(
                                "deleted={} segment_files={} bytes={}",
                                outcome.deleted.len(),
                                outcome.segment_files_deleted,
                                outcome.bytes_freed
                            ),
                        );
                    }
                }
                Err(err) => warn::emit(WarnEvent {
                    path: &dir.display().to_string(),
                    reason: "scan-failed",
                    retry: "next-pass",
                    err: &format!("{err:#}"),
                    ..WarnEvent::new(ArchiverWarnCode::W005ScanFailed, "retention", "scan")
                }),
            },
        }
    }
}
