use crate::archiver::bucket::TimeBucket;
use crate::archiver::layout::{FileKind, parse_file_name};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const PLAYLIST_END_TAG: &str = "#EXT-X-ENDLIST";

#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub kind: FileKind,
    pub size: u64,
}

/// Everything found on disk for one bucket.
#[derive(Debug, Clone, Default)]
pub struct BucketFiles {
    pub playlist: Option<ScannedFile>,
    /// Set only when the playlist carries the HLS end tag, i.e. the capture
    /// child finished writing it.
    pub playlist_finalized: bool,
    pub chunks: Vec<ScannedFile>,
    pub archive: Option<ScannedFile>,
}

impl BucketFiles {
    pub fn has_segments(&self) -> bool {
        self.playlist.is_some() || !self.chunks.is_empty()
    }

    /// A zero-byte archive is a leftover from an interrupted write, not proof
    /// that consolidation succeeded.
    pub fn has_usable_archive(&self) -> bool {
        self.archive.as_ref().is_some_and(|a| a.size > 0)
    }

    pub fn segment_files(&self) -> impl Iterator<Item = &ScannedFile> {
        self.playlist.iter().chain(self.chunks.iter())
    }

    pub fn segment_bytes(&self) -> u64 {
        self.segment_files().map(|f| f.size).sum()
    }

    pub fn segment_count(&self) -> usize {
        self.segment_files().count()
    }
}

/// Point-in-time view of the archive directory. Never cached: every caller
/// scans right before acting.
#[derive(Debug, Clone, Default)]
pub struct DirectoryScan {
    pub buckets: BTreeMap<TimeBucket, BucketFiles>,
    pub foreign_files: usize,
}

impl DirectoryScan {
    pub fn total_bytes(&self) -> u64 {
        self.buckets
            .values()
            .map(|b| b.segment_bytes() + b.archive.as_ref().map_or(0, |a| a.size))
            .sum()
    }
}

fn playlist_is_finalized(path: &Path) -> bool {
    fs::read_to_string(path)
        .map(|raw| raw.lines().any(|line| line.trim() == PLAYLIST_END_TAG))
        .unwrap_or(false)
}

fn insert(files: &mut BucketFiles, scanned: ScannedFile) {
    match scanned.kind {
        FileKind::Playlist => {
            files.playlist_finalized = playlist_is_finalized(&scanned.path);
            files.playlist = Some(scanned);
        }
        FileKind::Chunk { .. } => files.chunks.push(scanned),
        FileKind::Archive => files.archive = Some(scanned),
    }
}

fn scan_filtered(dir: &Path, only: Option<&TimeBucket>) -> Result<DirectoryScan> {
    let mut scan = DirectoryScan::default();

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(scan),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", dir.display()));
        }
    };

    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some((bucket, kind)) = name.to_str().and_then(parse_file_name) else {
            scan.foreign_files += 1;
            continue;
        };
        if only.is_some_and(|wanted| *wanted != bucket) {
            continue;
        }

        // The entry may vanish between listing and stat (consolidation or
        // purge racing us); skip it rather than failing the scan.
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let scanned = ScannedFile {
            path: entry.path(),
            kind,
            size: meta.len(),
        };
        insert(scan.buckets.entry(bucket).or_default(), scanned);
    }

    for files in scan.buckets.values_mut() {
        files.chunks.sort_by(|a, b| a.kind.cmp(&b.kind));
    }

    Ok(scan)
}

/// Classify every managed file in `dir`. A missing directory is an empty scan.
pub fn scan_dir(dir: &Path) -> Result<DirectoryScan> {
    scan_filtered(dir, None)
}

/// Fresh view of a single bucket, used right before mutating it.
pub fn scan_bucket(dir: &Path, bucket: &TimeBucket) -> Result<BucketFiles> {
    let mut scan = scan_filtered(dir, Some(bucket))?;
    Ok(scan.buckets.remove(bucket).unwrap_or_default())
}

/// Outcome of deleting a set of files one by one.
#[derive(Debug, Clone, Default)]
pub struct RemovalOutcome {
    pub removed: Vec<PathBuf>,
    pub bytes: u64,
    /// Already gone when we got to them; someone else deleted these.
    pub vanished: usize,
    pub failed: Vec<(PathBuf, String)>,
}

/// Delete each file independently. Files that are already gone are counted
/// as vanished, not removed; any other error is recorded and the rest still
/// proceed.
pub fn remove_files<'a>(files: impl IntoIterator<Item = &'a ScannedFile>) -> RemovalOutcome {
    let mut out = RemovalOutcome::default();
    for file in files {
        match fs::remove_file(&file.path) {
            Ok(()) => {
                out.bytes += file.size;
                out.removed.push(file.path.clone());
            }
            Err(err) if err.kind() == ErrorKind::NotFound => out.vanished += 1,
            Err(err) => out.failed.push((file.path.clone(), err.to_string())),
        }
    }
    out
}

/// Buckets older than `threshold` (strictly), oldest first.
pub fn buckets_older_than(
    scan: &DirectoryScan,
    now: DateTime<Utc>,
    threshold: TimeDelta,
) -> impl Iterator<Item = (&TimeBucket, &BucketFiles)> {
    scan.buckets
        .iter()
        .filter(move |(bucket, _)| bucket.age(now) > threshold)
}
