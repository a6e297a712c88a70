use crate::archiver::bucket::TimeBucket;
use std::path::{Path, PathBuf};

const PLAYLIST_PREFIX: &str = "playlist_";
const PLAYLIST_EXT: &str = ".m3u8";
const CHUNK_INFIX: &str = "_segment_";
const CHUNK_EXT: &str = ".ts";
const ARCHIVE_PREFIX: &str = "archive_";
const ARCHIVE_EXT: &str = ".mp4";
const PARTIAL_SUFFIX: &str = ".part";

/// What a managed file in the archive directory is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FileKind {
    Playlist,
    Chunk { index: u32 },
    Archive,
}

pub fn playlist_name(bucket: &TimeBucket) -> String {
    format!("{PLAYLIST_PREFIX}{}{PLAYLIST_EXT}", bucket.id())
}

pub fn playlist_path(dir: &Path, bucket: &TimeBucket) -> PathBuf {
    dir.join(playlist_name(bucket))
}

/// ffmpeg `-hls_segment_filename` template; ffmpeg fills in `%05d`.
pub fn chunk_template(dir: &Path, bucket: &TimeBucket) -> PathBuf {
    dir.join(format!("{}{CHUNK_INFIX}%05d{CHUNK_EXT}", bucket.id()))
}

#[cfg(test)]
pub fn chunk_name(bucket: &TimeBucket, index: u32) -> String {
    format!("{}{CHUNK_INFIX}{index:05}{CHUNK_EXT}", bucket.id())
}

pub fn archive_name(bucket: &TimeBucket) -> String {
    format!("{ARCHIVE_PREFIX}{}{ARCHIVE_EXT}", bucket.id())
}

pub fn archive_path(dir: &Path, bucket: &TimeBucket) -> PathBuf {
    dir.join(archive_name(bucket))
}

/// Muxer output while consolidation is running. Never parses as a managed file.
pub fn partial_archive_path(dir: &Path, bucket: &TimeBucket) -> PathBuf {
    dir.join(format!("{}{PARTIAL_SUFFIX}", archive_name(bucket)))
}

/// Map a file name back to its bucket and kind. `None` means foreign.
pub fn parse_file_name(name: &str) -> Option<(TimeBucket, FileKind)> {
    if let Some(id) = name
        .strip_prefix(PLAYLIST_PREFIX)
        .and_then(|rest| rest.strip_suffix(PLAYLIST_EXT))
    {
        return Some((id.parse().ok()?, FileKind::Playlist));
    }

    if let Some(id) = name
        .strip_prefix(ARCHIVE_PREFIX)
        .and_then(|rest| rest.strip_suffix(ARCHIVE_EXT))
    {
        return Some((id.parse().ok()?, FileKind::Archive));
    }

    let stem = name.strip_suffix(CHUNK_EXT)?;
    let (id, index) = stem.split_once(CHUNK_INFIX)?;
    if index.len() < 5 || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let index = index.parse().ok()?;
    Some((id.parse().ok()?, FileKind::Chunk { index }))
}
