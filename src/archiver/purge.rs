//! One-shot reconciliation of segment files the consolidation path left
//! behind. Runs outside the daemon; the trailing protection window is what
//! keeps it from racing capture and consolidation.

use crate::archiver::bucket::bucket_width;
use crate::archiver::classify::{BucketFiles, RemovalOutcome, buckets_older_than, remove_files, scan_dir};
use crate::archiver::util::format_bytes;
use crate::archiver::warn::{self, WarnEvent};
use crate::error::ArchiverWarnCode;
use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::path::Path;

/// Buckets this close to `now` are never touched: the current one and the
/// two before it.
pub const PROTECTED_BUCKETS: i32 = 3;

pub fn protection_window() -> TimeDelta {
    bucket_width() * PROTECTED_BUCKETS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PurgeMode {
    /// Segment sets whose archive already exists.
    #[default]
    Leftovers,
    /// Segment sets with no usable archive at all.
    Orphans,
}

impl PurgeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Leftovers => "leftovers",
            Self::Orphans => "orphans",
        }
    }

    fn selects(self, files: &BucketFiles) -> bool {
        if !files.has_segments() {
            return false;
        }
        match self {
            Self::Leftovers => files.has_usable_archive(),
            Self::Orphans => !files.has_usable_archive(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PurgeOptions {
    pub mode: PurgeMode,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PurgeOutcome {
    pub mode: PurgeMode,
    pub dry_run: bool,
    pub files_deleted: usize,
    pub bytes_freed: u64,
    pub buckets: Vec<String>,
    pub failed: usize,
}

impl PurgeOutcome {
    pub fn summary(&self) -> String {
        let verb = if self.dry_run { "would free" } else { "freed" };
        format!(
            "{verb} {} ({} bytes) across {} files",
            format_bytes(self.bytes_freed),
            self.bytes_freed,
            self.files_deleted
        )
    }
}

pub fn purge(dir: &Path, now: DateTime<Utc>, opts: PurgeOptions) -> Result<PurgeOutcome> {
    let scan = scan_dir(dir)?;
    let mut out = PurgeOutcome {
        mode: opts.mode,
        dry_run: opts.dry_run,
        ..PurgeOutcome::default()
    };

    for (bucket, files) in buckets_older_than(&scan, now, protection_window()) {
        if !opts.mode.selects(files) {
            continue;
        }
        out.buckets.push(bucket.id());

        let removal = if opts.dry_run {
            RemovalOutcome {
                removed: files.segment_files().map(|f| f.path.clone()).collect(),
                bytes: files.segment_bytes(),
                ..RemovalOutcome::default()
            }
        } else {
            remove_files(files.segment_files())
        };

        for (path, err) in &removal.failed {
            warn::emit(WarnEvent {
                bucket: &bucket.id(),
                path: &path.display().to_string(),
                reason: "segment-delete-failed",
                retry: "rerun-purge",
                err: err.as_str(),
                ..WarnEvent::new(ArchiverWarnCode::W001DeleteFailed, "purge", opts.mode.as_str())
            });
        }
        tracing::debug!(
            bucket = %bucket,
            files = removal.removed.len(),
            bytes = removal.bytes,
            dry_run = opts.dry_run,
            "purged segment set"
        );
        out.files_deleted += removal.removed.len();
        out.bytes_freed += removal.bytes;
        out.failed += removal.failed.len();
    }

    Ok(out)
}
