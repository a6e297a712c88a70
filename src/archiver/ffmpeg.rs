use crate::archiver::bucket::TimeBucket;
use crate::archiver::config::{ArchiverConfig, ConsolidationConfig};
use crate::archiver::layout::{chunk_template, partial_archive_path, playlist_path};
use crate::error::ArchiverError;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Find the ffmpeg binary. An existing path wins; anything else is looked up
/// on `PATH`. Resolved on every spawn so installing ffmpeg while the daemon
/// is backing off is picked up by the next attempt.
pub fn resolve_ffmpeg_bin(bin: &Path) -> Result<PathBuf, ArchiverError> {
    if bin.components().count() > 1 || bin.is_absolute() {
        if bin.exists() {
            return Ok(bin.to_path_buf());
        }
        return Err(ArchiverError::MissingFfmpegBinary(format!(
            "{} does not exist",
            bin.display()
        )));
    }
    which::which(bin).map_err(|err| {
        ArchiverError::MissingFfmpegBinary(format!("{} not found on PATH: {err}", bin.display()))
    })
}

/// Static part of the capture invocation; the bucket varies per start.
#[derive(Debug, Clone)]
pub struct CaptureSpec {
    pub ffmpeg_bin: PathBuf,
    pub stream_url: String,
    pub archive_dir: PathBuf,
    pub segment_secs: u64,
}

impl CaptureSpec {
    pub fn from_config(cfg: &ArchiverConfig, stream_url: &str) -> Self {
        Self {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            stream_url: stream_url.to_string(),
            archive_dir: cfg.archive_dir.clone(),
            segment_secs: cfg.capture.segment_secs,
        }
    }

    pub fn args(&self, bucket: &TimeBucket) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "-hide_banner",
            "-loglevel",
            "warning",
            "-i",
            self.stream_url.as_str(),
            "-c",
            "copy",
            "-map",
            "0",
            "-f",
            "hls",
            "-hls_time",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        args.push(self.segment_secs.to_string().into());
        args.extend(
            ["-hls_list_size", "0", "-hls_flags", "append_list"]
                .into_iter()
                .map(OsString::from),
        );
        args.push("-hls_segment_filename".into());
        args.push(chunk_template(&self.archive_dir, bucket).into_os_string());
        args.push(playlist_path(&self.archive_dir, bucket).into_os_string());
        args
    }
}

/// Static part of the consolidation invocation.
#[derive(Debug, Clone)]
pub struct MuxerSpec {
    pub ffmpeg_bin: PathBuf,
    pub archive_dir: PathBuf,
    pub video_codec: String,
    pub preset: String,
    pub crf: u8,
}

impl MuxerSpec {
    pub fn from_config(cfg: &ArchiverConfig) -> Self {
        let ConsolidationConfig {
            video_codec,
            preset,
            crf,
            ..
        } = &cfg.consolidation;
        Self {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            archive_dir: cfg.archive_dir.clone(),
            video_codec: video_codec.clone(),
            preset: preset.clone(),
            crf: *crf,
        }
    }

    /// Arguments writing to the `.part` path; the caller renames on success.
    pub fn args(&self, bucket: &TimeBucket) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "warning", "-y", "-i"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push(playlist_path(&self.archive_dir, bucket).into_os_string());
        args.push("-c:v".into());
        args.push(self.video_codec.clone().into());
        args.push("-preset".into());
        args.push(self.preset.clone().into());
        args.push("-crf".into());
        args.push(self.crf.to_string().into());
        args.extend(
            ["-c:a", "copy", "-f", "mp4"]
                .into_iter()
                .map(OsString::from),
        );
        args.push(partial_archive_path(&self.archive_dir, bucket).into_os_string());
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn capture_args_follow_hls_template() {
        let spec = CaptureSpec {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            stream_url: "rtsp://test_url".to_string(),
            archive_dir: PathBuf::from("/test_archive"),
            segment_secs: 10,
        };
        let bucket: TimeBucket = "2026-02-07-10".parse().unwrap();

        assert_eq!(
            strings(spec.args(&bucket)),
            vec![
                "-hide_banner",
                "-loglevel",
                "warning",
                "-i",
                "rtsp://test_url",
                "-c",
                "copy",
                "-map",
                "0",
                "-f",
                "hls",
                "-hls_time",
                "10",
                "-hls_list_size",
                "0",
                "-hls_flags",
                "append_list",
                "-hls_segment_filename",
                "/test_archive/2026-02-07-10_segment_%05d.ts",
                "/test_archive/playlist_2026-02-07-10.m3u8",
            ]
        );
    }

    #[test]
    fn muxer_args_write_to_partial_archive() {
        let spec = MuxerSpec {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            archive_dir: PathBuf::from("/test_archive"),
            video_codec: "libx265".to_string(),
            preset: "medium".to_string(),
            crf: 26,
        };
        let bucket: TimeBucket = "2026-02-07-09".parse().unwrap();

        assert_eq!(
            strings(spec.args(&bucket)),
            vec![
                "-hide_banner",
                "-loglevel",
                "warning",
                "-y",
                "-i",
                "/test_archive/playlist_2026-02-07-09.m3u8",
                "-c:v",
                "libx265",
                "-preset",
                "medium",
                "-crf",
                "26",
                "-c:a",
                "copy",
                "-f",
                "mp4",
                "/test_archive/archive_2026-02-07-09.mp4.part",
            ]
        );
    }

    #[test]
    fn missing_explicit_binary_is_reported() {
        let err = resolve_ffmpeg_bin(Path::new("/nonexistent/dir/ffmpeg")).unwrap_err();
        assert!(matches!(err, ArchiverError::MissingFfmpegBinary(_)));
    }
}
