use anyhow::Result;
use chrono::Utc;

use crate::archiver::audit;
use crate::archiver::config::ArchiverConfig;
use crate::archiver::retention::reap;
use crate::archiver::util::format_bytes;
use crate::commands::CommandReport;

pub fn run(cfg: &ArchiverConfig) -> Result<CommandReport> {
    let mut report = CommandReport::new("retention");
    let outcome = reap(&cfg.archive_dir, Utc::now(), cfg.retention_age())?;

    report.detail(format!(
        "deleted {} of {} archives older than {} days, freed {}",
        outcome.deleted.len(),
        outcome.archives_scanned,
        cfg.retention.days,
        format_bytes(outcome.bytes_freed)
    ));
    for name in &outcome.deleted {
        report.detail(format!("deleted {name}"));
    }
    if outcome.segment_files_deleted > 0 {
        report.detail(format!(
            "deleted {} leftover segment files of expired buckets",
            outcome.segment_files_deleted
        ));
    }
    if !outcome.deleted.is_empty() || outcome.segment_files_deleted > 0 {
        audit::record(
            &cfg.state_dir,
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
    if outcome.failed > 0 {
        report.issue(format!("{} expired files could not be deleted", outcome.failed));
    }
    Ok(report)
}
