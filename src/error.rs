use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiverError {
    #[error("RTSP_URL environment variable is not set; the capture daemon cannot start")]
    MissingStreamUrl,
    #[error("config file invalid or unreadable: {0}")]
    InvalidConfig(String),
    #[error("ffmpeg binary unavailable: {0}")]
    MissingFfmpegBinary(String),
    #[error("state dir {} is locked by another daemon (pid {pid})", .state_dir.display())]
    DaemonLocked { state_dir: PathBuf, pid: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiverWarnCode {
    W001DeleteFailed,
    W002MuxerFailed,
    W003CaptureExited,
    W004PlaylistMissing,
    W005ScanFailed,
    W006SpawnFailed,
}

impl ArchiverWarnCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::W001DeleteFailed => "W001_DELETE_FAILED",
            Self::W002MuxerFailed => "W002_MUXER_FAILED",
            Self::W003CaptureExited => "W003_CAPTURE_EXITED",
            Self::W004PlaylistMissing => "W004_PLAYLIST_MISSING",
            Self::W005ScanFailed => "W005_SCAN_FAILED",
            Self::W006SpawnFailed => "W006_SPAWN_FAILED",
        }
    }
}
