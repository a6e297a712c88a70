use crate::error::ArchiverError;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_ARCHIVE_PATH: &str = "/archive";
const STATE_SUBDIR: &str = ".archiver";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub segment_secs: u64,
    pub restart_backoff_secs: u64,
    pub stop_grace_secs: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            segment_secs: 10,
            restart_backoff_secs: 5,
            stop_grace_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    pub interval_secs: u64,
    pub settle_secs: u64,
    pub video_codec: String,
    pub preset: String,
    pub crf: u8,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            settle_secs: 60,
            video_codec: "libx265".to_string(),
            preset: "medium".to_string(),
            crf: 26,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub days: u64,
    pub interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            days: 90,
            interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchiverConfig {
    pub stream_url: Option<String>,
    pub archive_dir: PathBuf,
    pub state_dir: PathBuf,
    pub ffmpeg_bin: PathBuf,
    pub capture: CaptureConfig,
    pub consolidation: ConsolidationConfig,
    pub retention: RetentionConfig,
    pub logging: LoggingConfig,
}

impl ArchiverConfig {
    /// The daemon cannot run without a stream; maintenance commands can.
    pub fn require_stream_url(&self) -> Result<&str, ArchiverError> {
        self.stream_url
            .as_deref()
            .ok_or(ArchiverError::MissingStreamUrl)
    }

    pub fn retention_age(&self) -> chrono::TimeDelta {
        chrono::TimeDelta::days(self.retention.days as i64)
    }

    pub fn restart_backoff(&self) -> Duration {
        Duration::from_secs(self.capture.restart_backoff_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.capture.stop_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialArchiverConfig {
    capture: Option<CaptureConfig>,
    consolidation: Option<ConsolidationConfig>,
    retention: Option<RetentionConfig>,
    logging: Option<LoggingConfig>,
}

/// Source of configuration keys. Production reads the process environment;
/// tests hand in a map.
pub trait KeyLookup {
    fn get(&self, key: &str) -> Option<String>;
}

struct ProcessEnv;

impl KeyLookup for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

impl<F> KeyLookup for F
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        self(key)
    }
}

fn lookup_trimmed(vars: &dyn KeyLookup, key: &str) -> Option<String> {
    vars.get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_or_u64(vars: &dyn KeyLookup, key: &str, fallback: u64) -> u64 {
    lookup_trimmed(vars, key)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(fallback)
}

fn env_or_u8(vars: &dyn KeyLookup, key: &str, fallback: u8) -> u8 {
    lookup_trimmed(vars, key)
        .and_then(|v| v.parse::<u8>().ok())
        .unwrap_or(fallback)
}

fn env_or_string(vars: &dyn KeyLookup, key: &str, fallback: &str) -> String {
    lookup_trimmed(vars, key).unwrap_or_else(|| fallback.to_string())
}

fn env_or_path(vars: &dyn KeyLookup, key: &str, fallback: PathBuf) -> PathBuf {
    lookup_trimmed(vars, key).map(PathBuf::from).unwrap_or(fallback)
}

fn validate(cfg: &ArchiverConfig) -> Result<()> {
    if cfg.capture.segment_secs == 0 {
        return Err(anyhow!("invalid segment duration: must be >= 1 second"));
    }
    if cfg.capture.restart_backoff_secs == 0 {
        return Err(anyhow!("invalid restart backoff: must be >= 1 second"));
    }
    if cfg.capture.stop_grace_secs == 0 {
        return Err(anyhow!("invalid stop grace period: must be >= 1 second"));
    }
    if cfg.consolidation.interval_secs == 0 {
        return Err(anyhow!(
            "invalid consolidation interval: must be >= 1 second"
        ));
    }
    if cfg.consolidation.crf > 51 {
        return Err(anyhow!("invalid crf: require 0 <= crf <= 51"));
    }
    if cfg.consolidation.video_codec.trim().is_empty() {
        return Err(anyhow!("invalid video codec: cannot be empty"));
    }
    if cfg.retention.days == 0 {
        return Err(anyhow!("invalid RETENTION_DAYS: must be >= 1"));
    }
    if cfg.retention.interval_secs == 0 || cfg.retention.interval_secs > 86_400 {
        return Err(anyhow!(
            "invalid retention interval: require 1 <= interval <= 86400 seconds"
        ));
    }
    if cfg.logging.format != "pretty" && cfg.logging.format != "json" {
        return Err(anyhow!("invalid log format: use `pretty` or `json`"));
    }
    Ok(())
}

fn resolve_config_path(vars: &dyn KeyLookup) -> Option<PathBuf> {
    if let Some(custom) = lookup_trimmed(vars, "ARCHIVER_CONFIG_PATH") {
        return Some(PathBuf::from(custom));
    }

    let base = dirs::config_dir()?;
    Some(base.join("cctv-archiver").join("archiver.toml"))
}

fn merge_file_config(base: &mut ArchiverConfig, vars: &dyn KeyLookup) -> Result<()> {
    let Some(path) = resolve_config_path(vars) else {
        return Ok(());
    };
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(&path)
        .map_err(|err| ArchiverError::InvalidConfig(format!("{}: {err}", path.display())))?;
    let parsed: PartialArchiverConfig = toml::from_str(&raw)
        .map_err(|err| ArchiverError::InvalidConfig(format!("{}: {err}", path.display())))?;
    if let Some(capture) = parsed.capture {
        base.capture = capture;
    }
    if let Some(consolidation) = parsed.consolidation {
        base.consolidation = consolidation;
    }
    if let Some(retention) = parsed.retention {
        base.retention = retention;
    }
    if let Some(logging) = parsed.logging {
        base.logging = logging;
    }
    Ok(())
}

pub fn load_config() -> Result<ArchiverConfig> {
    load_config_with(&ProcessEnv)
}

pub fn load_config_with(vars: &dyn KeyLookup) -> Result<ArchiverConfig> {
    let archive_dir = env_or_path(vars, "ARCHIVE_PATH", PathBuf::from(DEFAULT_ARCHIVE_PATH));
    let mut cfg = ArchiverConfig {
        stream_url: lookup_trimmed(vars, "RTSP_URL"),
        state_dir: env_or_path(vars, "ARCHIVER_STATE_DIR", archive_dir.join(STATE_SUBDIR)),
        archive_dir,
        ffmpeg_bin: env_or_path(vars, "ARCHIVER_FFMPEG_BIN", PathBuf::from("ffmpeg")),
        capture: CaptureConfig::default(),
        consolidation: ConsolidationConfig::default(),
        retention: RetentionConfig::default(),
        logging: LoggingConfig::default(),
    };
    merge_file_config(&mut cfg, vars)?;

    cfg.retention.days = env_or_u64(vars, "RETENTION_DAYS", cfg.retention.days);
    cfg.retention.interval_secs = env_or_u64(
        vars,
        "ARCHIVER_RETENTION_INTERVAL_SECS",
        cfg.retention.interval_secs,
    );
    cfg.capture.segment_secs = env_or_u64(vars, "ARCHIVER_SEGMENT_SECS", cfg.capture.segment_secs);
    cfg.capture.restart_backoff_secs = env_or_u64(
        vars,
        "ARCHIVER_RESTART_BACKOFF_SECS",
        cfg.capture.restart_backoff_secs,
    );
    cfg.capture.stop_grace_secs =
        env_or_u64(vars, "ARCHIVER_STOP_GRACE_SECS", cfg.capture.stop_grace_secs);
    cfg.consolidation.interval_secs = env_or_u64(
        vars,
        "ARCHIVER_CONSOLIDATE_INTERVAL_SECS",
        cfg.consolidation.interval_secs,
    );
    cfg.consolidation.settle_secs =
        env_or_u64(vars, "ARCHIVER_SETTLE_SECS", cfg.consolidation.settle_secs);
    cfg.consolidation.video_codec = env_or_string(
        vars,
        "ARCHIVER_VIDEO_CODEC",
        &cfg.consolidation.video_codec,
    );
    cfg.consolidation.preset = env_or_string(vars, "ARCHIVER_PRESET", &cfg.consolidation.preset);
    cfg.consolidation.crf = env_or_u8(vars, "ARCHIVER_CRF", cfg.consolidation.crf);
    cfg.logging.level = env_or_string(vars, "ARCHIVER_LOG_LEVEL", &cfg.logging.level);
    cfg.logging.format = env_or_string(vars, "ARCHIVER_LOG_FORMAT", &cfg.logging.format);

    validate(&cfg)?;
    Ok(cfg)
}
