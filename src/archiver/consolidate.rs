use crate::archiver::audit;
use crate::archiver::bucket::TimeBucket;
use crate::archiver::classify::{BucketFiles, DirectoryScan, remove_files, scan_bucket, scan_dir};
use crate::archiver::config::ArchiverConfig;
use crate::archiver::ffmpeg::{MuxerSpec, resolve_ffmpeg_bin};
use crate::archiver::layout::{archive_path, partial_archive_path};
use crate::archiver::process;
use crate::archiver::warn::{self, WarnEvent};
use crate::error::ArchiverWarnCode;
use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Buckets with a muxer currently running, shared by overlapping passes.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    buckets: Arc<Mutex<BTreeSet<TimeBucket>>>,
}

/// Held for the duration of one bucket's consolidation.
#[derive(Debug)]
pub struct InFlightClaim {
    buckets: Arc<Mutex<BTreeSet<TimeBucket>>>,
    bucket: TimeBucket,
}

impl InFlight {
    /// `None` if another pass already holds `bucket`.
    pub fn claim(&self, bucket: TimeBucket) -> Option<InFlightClaim> {
        let mut set = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(bucket) {
            return None;
        }
        Some(InFlightClaim {
            buckets: Arc::clone(&self.buckets),
            bucket,
        })
    }

    #[cfg(test)]
    pub fn contains(&self, bucket: &TimeBucket) -> bool {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(bucket)
    }
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.bucket);
    }
}

/// When a closed bucket may be muxed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// Grace after the bucket end for playlists that never got the end tag.
    pub settle: TimeDelta,
    /// Buckets older than this belong to retention and are never muxed.
    pub retention: Option<TimeDelta>,
}

impl Readiness {
    pub fn from_config(cfg: &ArchiverConfig) -> Self {
        Self {
            settle: TimeDelta::seconds(cfg.consolidation.settle_secs as i64),
            retention: Some(cfg.retention_age()),
        }
    }

    pub fn expired(&self, bucket: &TimeBucket, now: DateTime<Utc>) -> bool {
        self.retention.is_some_and(|limit| bucket.age(now) > limit)
    }
}

/// Whether `bucket` may be consolidated at `now`.
pub fn is_ready(bucket: &TimeBucket, files: &BucketFiles, now: DateTime<Utc>, readiness: Readiness) -> bool {
    files.playlist.is_some()
        && !files.has_usable_archive()
        && bucket.is_complete(now)
        && !readiness.expired(bucket, now)
        && (files.playlist_finalized || bucket.age(now) >= readiness.settle)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsolidationPlan {
    pub ready: Vec<TimeBucket>,
    /// Closed buckets holding chunks but no playlist; the muxer has no input.
    pub missing_playlist: Vec<TimeBucket>,
    /// Unarchived segment sets past retention, left for the reaper.
    pub expired: Vec<TimeBucket>,
}

pub fn plan(scan: &DirectoryScan, now: DateTime<Utc>, readiness: Readiness) -> ConsolidationPlan {
    let mut out = ConsolidationPlan::default();
    for (bucket, files) in &scan.buckets {
        if is_ready(bucket, files, now, readiness) {
            out.ready.push(*bucket);
        } else if readiness.expired(bucket, now) {
            if files.has_segments() && !files.has_usable_archive() {
                out.expired.push(*bucket);
            }
        } else if files.playlist.is_none()
            && !files.chunks.is_empty()
            && !files.has_usable_archive()
            && bucket.is_complete(now)
        {
            out.missing_playlist.push(*bucket);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BucketOutcome {
    Consolidated {
        archive_bytes: u64,
        files_deleted: usize,
        bytes_freed: u64,
        delete_failures: usize,
    },
    SkippedInFlight,
    SkippedArchived,
    SkippedNotReady,
    Failed {
        reason: String,
    },
    Cancelled,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PassReport {
    pub buckets_scanned: usize,
    pub ready: usize,
    pub consolidated: usize,
    pub failed: usize,
    pub skipped_in_flight: usize,
    pub missing_playlist: usize,
    pub files_deleted: usize,
    pub bytes_freed: u64,
    pub delete_failures: usize,
    pub cancelled: bool,
    pub outcomes: Vec<(String, BucketOutcome)>,
}

impl PassReport {
    fn absorb(&mut self, bucket: &TimeBucket, outcome: BucketOutcome) {
        match &outcome {
            BucketOutcome::Consolidated {
                files_deleted,
                bytes_freed,
                delete_failures,
                ..
            } => {
                self.consolidated += 1;
                self.files_deleted += files_deleted;
                self.bytes_freed += bytes_freed;
                self.delete_failures += delete_failures;
            }
            BucketOutcome::SkippedInFlight => self.skipped_in_flight += 1,
            BucketOutcome::Failed { .. } => self.failed += 1,
            BucketOutcome::Cancelled => self.cancelled = true,
            BucketOutcome::SkippedArchived | BucketOutcome::SkippedNotReady => {}
        }
        self.outcomes.push((bucket.id(), outcome));
    }
}

enum MuxExit {
    Finished(std::process::ExitStatus),
    Cancelled,
}

pub struct Consolidator {
    muxer: MuxerSpec,
    readiness: Readiness,
    stop_grace: Duration,
    audit_dir: Option<PathBuf>,
    in_flight: InFlight,
}

impl Consolidator {
    pub fn new(muxer: MuxerSpec, readiness: Readiness, stop_grace: Duration) -> Self {
        Self {
            muxer,
            readiness,
            stop_grace,
            audit_dir: None,
            in_flight: InFlight::default(),
        }
    }

    pub fn from_config(cfg: &ArchiverConfig) -> Self {
        Self::new(
            MuxerSpec::from_config(cfg),
            Readiness::from_config(cfg),
            cfg.stop_grace(),
        )
        .with_audit(cfg.state_dir.clone())
    }

    pub fn with_audit(mut self, state_dir: PathBuf) -> Self {
        self.audit_dir = Some(state_dir);
        self
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    fn dir(&self) -> &Path {
        &self.muxer.archive_dir
    }

    fn audit(&self, status: &str, message: &str) {
        if let Some(dir) = &self.audit_dir {
            audit::record(dir, "consolidate", status, message);
        }
    }

    /// One scan-plan-act pass. Buckets are consolidated one after another.
    pub async fn run_pass(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> Result<PassReport> {
        let scan = scan_dir(self.dir())?;
        let plan = plan(&scan, now, self.readiness);
        let mut report = PassReport {
            buckets_scanned: scan.buckets.len(),
            ready: plan.ready.len(),
            missing_playlist: plan.missing_playlist.len(),
            ..PassReport::default()
        };

        for bucket in &plan.missing_playlist {
            warn::emit(WarnEvent {
                bucket: &bucket.id(),
                path: &self.dir().display().to_string(),
                reason: "chunks-without-playlist",
                retry: "manual-purge",
                ..WarnEvent::new(ArchiverWarnCode::W004PlaylistMissing, "consolidate", "plan")
            });
        }

        if !plan.expired.is_empty() {
            tracing::debug!(
                buckets = plan.expired.len(),
                "skipping unarchived buckets past retention"
            );
        }

        for bucket in plan.ready {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let outcome = self.consolidate_bucket(bucket, now, cancel).await;
            report.absorb(&bucket, outcome);
        }

        tracing::info!(
            scanned = report.buckets_scanned,
            ready = report.ready,
            consolidated = report.consolidated,
            failed = report.failed,
            skipped_in_flight = report.skipped_in_flight,
            bytes_freed = report.bytes_freed,
            "consolidation pass finished"
        );
        Ok(report)
    }

    /// Consolidate one bucket under its in-flight claim.
    pub async fn consolidate_bucket(
        &self,
        bucket: TimeBucket,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> BucketOutcome {
        let Some(_claim) = self.in_flight.claim(bucket) else {
            tracing::debug!(bucket = %bucket, "bucket already being consolidated");
            return BucketOutcome::SkippedInFlight;
        };

        let files = match scan_bucket(self.dir(), &bucket) {
            Ok(files) => files,
            Err(err) => {
                warn::emit(WarnEvent {
                    bucket: &bucket.id(),
                    reason: "rescan-failed",
                    retry: "next-tick",
                    err: &format!("{err:#}"),
                    ..WarnEvent::new(ArchiverWarnCode::W005ScanFailed, "consolidate", "rescan")
                });
                return BucketOutcome::Failed {
                    reason: format!("rescan failed: {err:#}"),
                };
            }
        };
        if files.has_usable_archive() {
            return BucketOutcome::SkippedArchived;
        }
        if !is_ready(&bucket, &files, now, self.readiness) {
            return BucketOutcome::SkippedNotReady;
        }
        tracing::debug!(
            bucket = %bucket,
            segments = files.segment_count(),
            bytes = files.segment_bytes(),
            finalized = files.playlist_finalized,
            "bucket ready for muxing"
        );

        match self.mux(&bucket, cancel).await {
            Ok(MuxExit::Cancelled) => {
                tracing::info!(bucket = %bucket, "consolidation cancelled");
                BucketOutcome::Cancelled
            }
            Ok(MuxExit::Finished(status)) => self.finish(&bucket, status),
            Err(err) => self.fail(&bucket, format!("{err:#}")),
        }
    }

    async fn mux(&self, bucket: &TimeBucket, cancel: &CancellationToken) -> Result<MuxExit> {
        let part = partial_archive_path(self.dir(), bucket);
        remove_if_present(&part)?;

        let bin = resolve_ffmpeg_bin(&self.muxer.ffmpeg_bin)?;
        tracing::info!(bucket = %bucket, "consolidating bucket");
        let mut child = process::spawn_logged(&bin, &self.muxer.args(bucket), "muxer", bucket.id())?;

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            () = cancel.cancelled() => None,
        };
        if let Some(status) = exited {
            return Ok(MuxExit::Finished(status.context("failed to wait for muxer")?));
        }

        let stopped = process::terminate(&mut child, self.stop_grace).await;
        remove_if_present(&part)?;
        stopped?;
        Ok(MuxExit::Cancelled)
    }

    fn finish(&self, bucket: &TimeBucket, status: std::process::ExitStatus) -> BucketOutcome {
        let part = partial_archive_path(self.dir(), bucket);
        let written = fs::metadata(&part).map(|m| m.len()).unwrap_or(0);
        if !status.success() {
            return self.fail(bucket, format!("muxer exited with {status}"));
        }
        if written == 0 {
            return self.fail(bucket, "muxer produced no output".to_string());
        }

        let target = archive_path(self.dir(), bucket);
        if let Err(err) = fs::rename(&part, &target) {
            return self.fail(bucket, format!("failed to publish {}: {err}", target.display()));
        }

        // Re-list: the capture child may have flushed one more chunk since
        // the pre-mux scan.
        let segments = match scan_bucket(self.dir(), bucket) {
            Ok(files) => files,
            Err(err) => {
                warn::emit(WarnEvent {
                    bucket: &bucket.id(),
                    reason: "post-mux-rescan-failed",
                    retry: "purge",
                    err: &format!("{err:#}"),
                    ..WarnEvent::new(ArchiverWarnCode::W005ScanFailed, "consolidate", "cleanup")
                });
                BucketFiles::default()
            }
        };
        let removal = remove_files(segments.segment_files());
        for (path, err) in &removal.failed {
            warn::emit(WarnEvent {
                bucket: &bucket.id(),
                path: &path.display().to_string(),
                reason: "segment-delete-failed",
                retry: "purge",
                err: err.as_str(),
                ..WarnEvent::new(ArchiverWarnCode::W001DeleteFailed, "consolidate", "delete")
            });
        }

        tracing::info!(
            bucket = %bucket,
            archive_bytes = written,
            files_deleted = removal.removed.len(),
            bytes_freed = removal.bytes,
            "bucket consolidated"
        );
        self.audit(
            "ok",
            &format!(
                "bucket={} archive_bytes={written} files_deleted={} delete_failures={}",
                bucket,
                removal.removed.len(),
                removal.failed.len()
            ),
        );
        BucketOutcome::Consolidated {
            archive_bytes: written,
            files_deleted: removal.removed.len(),
            bytes_freed: removal.bytes,
            delete_failures: removal.failed.len(),
        }
    }

    fn fail(&self, bucket: &TimeBucket, reason: String) -> BucketOutcome {
        let part = partial_archive_path(self.dir(), bucket);
        if let Err(err) = remove_if_present(&part) {
            tracing::debug!(path = %part.display(), "failed to remove partial archive: {err:#}");
        }
        warn::emit(WarnEvent {
            bucket: &bucket.id(),
            reason: "muxer-failed",
            retry: "next-tick",
            err: &reason,
            ..WarnEvent::new(ArchiverWarnCode::W002MuxerFailed, "consolidate", "mux")
        });
        self.audit("failed", &format!("bucket={bucket} reason={reason}"));
        BucketOutcome::Failed { reason }
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

/// Tick forever, running each pass as its own task so a slow muxer never
/// delays the next tick. Returns once every pass has observed cancellation.
pub async fn run_scheduler(consolidator: Arc<Consolidator>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut passes: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::info!(in_progress = passes.len(), "consolidation scheduler shutting down");
                break;
            }
            Some(joined) = passes.join_next(), if !passes.is_empty() => {
                if let Err(err) = joined {
                    tracing::error!("consolidation pass panicked: {err}");
                }
            }
            _ = ticker.tick() => {
                let consolidator = Arc::clone(&consolidator);
                let cancel = cancel.clone();
                passes.spawn(async move {
                    if let Err(err) = consolidator.run_pass(Utc::now(), &cancel).await {
                        warn::emit(WarnEvent {
                            err: &format!("{err:#}"),
                            retry: "next-tick",
                            reason: "scan-failed",
                            ..WarnEvent::new(ArchiverWarnCode::W005ScanFailed, "consolidate", "scan")
                        });
                    }
                });
            }
        }
    }

    while let Some(joined) = passes.join_next().await {
        if let Err(err) = joined {
            tracing::error!("consolidation pass panicked: {err}");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::archiver::layout::{chunk_name, playlist_name};
    use chrono::TimeZone;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    const GOOD_MUXER: &str = "for last; do :; done\nprintf 'mp4-data' > \"$last\"";

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).single().expect("valid timestamp")
    }

    fn bucket(id: &str) -> TimeBucket {
        id.parse().expect("bucket id")
    }

    fn write_fake_ffmpeg(path: &Path, body: &str) {
        fs::write(path, format!("#!/usr/bin/env bash\n{body}\n")).expect("write fake ffmpeg");
        let mut perms = fs::metadata(path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).expect("chmod");
    }

    fn seed_bucket(dir: &Path, id: &str, chunks: u32, finalized: bool) {
        let b = bucket(id);
        let mut playlist = String::from("#EXTM3U\n");
        for i in 0..chunks {
            fs::write(dir.join(chunk_name(&b, i)), vec![0u8; 100]).expect("chunk");
            playlist.push_str(&format!("#EXTINF:10.0,\n{}\n", chunk_name(&b, i)));
        }
        if finalized {
            playlist.push_str("#EXT-X-ENDLIST\n");
        }
        fs::write(dir.join(playlist_name(&b)), playlist).expect("playlist");
    }

    fn settle(secs: i64) -> Readiness {
        Readiness {
            settle: TimeDelta::seconds(secs),
            retention: None,
        }
    }

    fn consolidator(dir: &Path, bin: PathBuf) -> Consolidator {
        Consolidator::new(
            MuxerSpec {
                ffmpeg_bin: bin,
                archive_dir: dir.to_path_buf(),
                video_codec: "libx265".to_string(),
                preset: "medium".to_string(),
                crf: 26,
            },
            settle(60),
            Duration::from_secs(2),
        )
    }

    fn segment_names(dir: &Path, id: &str) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .expect("read dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains(id) && !n.starts_with("archive_"))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn plan_picks_closed_unarchived_buckets() {
        let tmp = tempdir().expect("tempdir");
        let dir = tmp.path();
        seed_bucket(dir, "2024-01-01-03", 3, false);
        seed_bucket(dir, "2024-01-01-05", 2, false);
        seed_bucket(dir, "2024-01-01-02", 1, true);
        fs::write(dir.join("archive_2024-01-01-02.mp4"), b"mp4").expect("archive");
        seed_bucket(dir, "2024-01-01-01", 1, true);
        fs::write(dir.join("archive_2024-01-01-01.mp4"), b"").expect("empty archive");
        fs::write(dir.join(chunk_name(&bucket("2024-01-01-00"), 0)), b"x").expect("orphan chunk");

        let scan = scan_dir(dir).expect("scan");
        let plan = plan(&scan, at(2024, 1, 1, 5, 10, 0), settle(60));

        assert_eq!(plan.ready, vec![bucket("2024-01-01-01"), bucket("2024-01-01-03")]);
        assert_eq!(plan.missing_playlist, vec![bucket("2024-01-01-00")]);
    }

    #[test]
    fn unfinalized_playlist_waits_for_settle_period() {
        let tmp = tempdir().expect("tempdir");
        seed_bucket(tmp.path(), "2024-01-01-04", 2, false);
        let scan = scan_dir(tmp.path()).expect("scan");
        let readiness = settle(60);

        assert!(plan(&scan, at(2024, 1, 1, 5, 0, 30), readiness).ready.is_empty());
        assert_eq!(plan(&scan, at(2024, 1, 1, 5, 1, 0), readiness).ready.len(), 1);
    }

    #[test]
    fn finalized_playlist_is_ready_as_soon_as_bucket_closes() {
        let tmp = tempdir().expect("tempdir");
        seed_bucket(tmp.path(), "2024-01-01-04", 2, true);
        let scan = scan_dir(tmp.path()).expect("scan");

        assert!(plan(&scan, at(2024, 1, 1, 4, 59, 59), settle(60)).ready.is_empty());
        assert_eq!(plan(&scan, at(2024, 1, 1, 5, 0, 0), settle(60)).ready.len(), 1);
    }

    #[test]
    fn buckets_past_retention_are_never_planned() {
        let tmp = tempdir().expect("tempdir");
        seed_bucket(tmp.path(), "2024-01-01-03", 2, true);
        fs::write(tmp.path().join(chunk_name(&bucket("2024-01-01-04"), 0)), b"x").expect("chunk");
        let scan = scan_dir(tmp.path()).expect("scan");
        let readiness = Readiness {
            settle: TimeDelta::seconds(60),
            retention: Some(TimeDelta::days(90)),
        };

        let plan = plan(&scan, at(2024, 6, 1, 0, 0, 0), readiness);
        assert!(plan.ready.is_empty());
        assert!(plan.missing_playlist.is_empty());
        assert_eq!(plan.expired, vec![bucket("2024-01-01-03"), bucket("2024-01-01-04")]);
    }

    #[tokio::test]
    async fn bucket_reaped_by_retention_is_not_consolidated_again() {
        let tmp = tempdir().expect("tempdir");
        let dir = tmp.path().join("archive");
        fs::create_dir(&dir).expect("mkdir");
        let bin = tmp.path().join("ffmpeg");
        let marker = tmp.path().join("invoked");
        write_fake_ffmpeg(&bin, &format!("touch '{}'\n{GOOD_MUXER}", marker.display()));
        seed_bucket(&dir, "2024-01-01-03", 1, true);
        fs::write(dir.join("archive_2024-01-01-03.mp4"), b"mp4").expect("archive");

        let now = at(2024, 6, 1, 0, 0, 0);
        let retention = TimeDelta::days(90);
        let reaped = crate::archiver::retention::reap(&dir, now, retention).expect("reap");
        assert_eq!(reaped.deleted, vec!["archive_2024-01-01-03.mp4".to_string()]);

        // Put a leftover back as if the reaper's segment delete had failed.
        seed_bucket(&dir, "2024-01-01-03", 1, true);
        let c = Consolidator::new(
            MuxerSpec {
                ffmpeg_bin: bin,
                archive_dir: dir.clone(),
                video_codec: "libx265".to_string(),
                preset: "medium".to_string(),
                crf: 26,
            },
            Readiness {
                settle: TimeDelta::seconds(60),
                retention: Some(retention),
            },
            Duration::from_secs(2),
        );
        let report = c.run_pass(now, &CancellationToken::new()).await.expect("pass");

        assert_eq!(report.ready, 0);
        assert_eq!(report.consolidated, 0);
        assert!(!dir.join("archive_2024-01-01-03.mp4").exists());
        assert!(!marker.exists());
    }

    #[test]
    fn in_flight_claim_is_exclusive_and_released_on_drop() {
        let in_flight = InFlight::default();
        let b = bucket("2024-01-01-03");

        let claim = in_flight.claim(b).expect("first claim");
        assert!(in_flight.claim(b).is_none());
        assert!(in_flight.contains(&b));
        drop(claim);
        assert!(!in_flight.contains(&b));
        assert!(in_flight.claim(b).is_some());
    }

    #[tokio::test]
    async fn closed_bucket_is_consolidated_and_segments_removed() {
        let tmp = tempdir().expect("tempdir");
        let dir = tmp.path().join("archive");
        fs::create_dir(&dir).expect("mkdir");
        let bin = tmp.path().join("ffmpeg");
        write_fake_ffmpeg(&bin, GOOD_MUXER);
        seed_bucket(&dir, "2024-01-01-03", 3, false);
        seed_bucket(&dir, "2024-01-01-05", 1, false);

        let c = consolidator(&dir, bin);
        let report = c
            .run_pass(at(2024, 1, 1, 5, 10, 0), &CancellationToken::new())
            .await
            .expect("pass");

        assert_eq!(report.consolidated, 1);
        assert_eq!(report.files_deleted, 4);
        let archive = fs::read(dir.join("archive_2024-01-01-03.mp4")).expect("archive");
        assert_eq!(archive, b"mp4-data");
        assert!(!dir.join("archive_2024-01-01-03.mp4.part").exists());
        assert!(segment_names(&dir, "2024-01-01-03").is_empty());
        assert_eq!(segment_names(&dir, "2024-01-01-05").len(), 2);

        let again = c
            .run_pass(at(2024, 1, 1, 5, 20, 0), &CancellationToken::new())
            .await
            .expect("second pass");
        assert_eq!(again.ready, 0);
        assert_eq!(again.consolidated, 0);
    }

    #[tokio::test]
    async fn failed_muxer_leaves_segments_for_the_next_pass() {
        let tmp = tempdir().expect("tempdir");
        let dir = tmp.path().join("archive");
        fs::create_dir(&dir).expect("mkdir");
        let bin = tmp.path().join("ffmpeg");
        write_fake_ffmpeg(&bin, "for last; do :; done\nprintf 'half' > \"$last\"\nexit 1");
        seed_bucket(&dir, "2024-01-01-03", 3, true);

        let c = consolidator(&dir, bin.clone());
        let now = at(2024, 1, 1, 5, 10, 0);
        let report = c.run_pass(now, &CancellationToken::new()).await.expect("pass");

        assert_eq!(report.failed, 1);
        assert_eq!(report.consolidated, 0);
        assert!(!dir.join("archive_2024-01-01-03.mp4").exists());
        assert!(!dir.join("archive_2024-01-01-03.mp4.part").exists());
        assert_eq!(segment_names(&dir, "2024-01-01-03").len(), 4);

        write_fake_ffmpeg(&bin, GOOD_MUXER);
        let retry = c.run_pass(now, &CancellationToken::new()).await.expect("retry");
        assert_eq!(retry.consolidated, 1);
        assert!(segment_names(&dir, "2024-01-01-03").is_empty());
    }

    #[tokio::test]
    async fn muxer_success_without_output_is_a_failure() {
        let tmp = tempdir().expect("tempdir");
        let dir = tmp.path().join("archive");
        fs::create_dir(&dir).expect("mkdir");
        let bin = tmp.path().join("ffmpeg");
        write_fake_ffmpeg(&bin, "exit 0");
        seed_bucket(&dir, "2024-01-01-03", 2, true);

        let c = consolidator(&dir, bin);
        let outcome = c
            .consolidate_bucket(bucket("2024-01-01-03"), at(2024, 1, 1, 5, 10, 0), &CancellationToken::new())
            .await;

        assert!(matches!(outcome, BucketOutcome::Failed { .. }), "{outcome:?}");
        assert_eq!(segment_names(&dir, "2024-01-01-03").len(), 3);
    }

    #[tokio::test]
    async fn claimed_bucket_is_skipped_without_invoking_muxer() {
        let tmp = tempdir().expect("tempdir");
        let dir = tmp.path().join("archive");
        fs::create_dir(&dir).expect("mkdir");
        let bin = tmp.path().join("ffmpeg");
        let marker = tmp.path().join("invoked");
        write_fake_ffmpeg(&bin, &format!("touch '{}'\nexit 1", marker.display()));
        seed_bucket(&dir, "2024-01-01-03", 2, true);

        let c = consolidator(&dir, bin);
        let _held = c.in_flight().claim(bucket("2024-01-01-03")).expect("claim");
        let report = c
            .run_pass(at(2024, 1, 1, 5, 10, 0), &CancellationToken::new())
            .await
            .expect("pass");

        assert_eq!(report.skipped_in_flight, 1);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn cancellation_stops_muxer_and_discards_partial_output() {
        let tmp = tempdir().expect("tempdir");
        let dir = tmp.path().join("archive");
        fs::create_dir(&dir).expect("mkdir");
        let bin = tmp.path().join("ffmpeg");
        write_fake_ffmpeg(&bin, "for last; do :; done\nprintf 'partial' > \"$last\"\nexec sleep 30");
        seed_bucket(&dir, "2024-01-01-03", 2, true);

        let c = Arc::new(consolidator(&dir, bin));
        let cancel = CancellationToken::new();
        let task = {
            let c = Arc::clone(&c);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                c.consolidate_bucket(bucket("2024-01-01-03"), at(2024, 1, 1, 5, 10, 0), &cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        let outcome = task.await.expect("join");

        assert_eq!(outcome, BucketOutcome::Cancelled);
        assert!(!dir.join("archive_2024-01-01-03.mp4.part").exists());
        assert!(!dir.join("archive_2024-01-01-03.mp4").exists());
        assert_eq!(segment_names(&dir, "2024-01-01-03").len(), 3);
        assert!(!c.in_flight().contains(&bucket("2024-01-01-03")));
    }

    #[tokio::test]
    async fn scheduler_runs_first_pass_immediately_and_stops_on_cancel() {
        let tmp = tempdir().expect("tempdir");
        let dir = tmp.path().join("archive");
        fs::create_dir(&dir).expect("mkdir");
        let bin = tmp.path().join("ffmpeg");
        write_fake_ffmpeg(&bin, GOOD_MUXER);
        seed_bucket(&dir, "2020-01-01-03", 2, true);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_scheduler(
            Arc::new(consolidator(&dir, bin)),
            Duration::from_secs(3600),
            cancel.clone(),
        ));
        for _ in 0..50 {
            if dir.join("archive_2020-01-01-03.mp4").exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("scheduler stops")
            .expect("join");

        assert!(dir.join("archive_2020-01-01-03.mp4").exists());
    }
}
