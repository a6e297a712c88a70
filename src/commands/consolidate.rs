use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::archiver::config::ArchiverConfig;
use crate::archiver::consolidate::{BucketOutcome, Consolidator};
use crate::archiver::lock::running_daemon;
use crate::archiver::util::format_bytes;
use crate::commands::{CommandReport, block_on};

pub fn run(cfg: &ArchiverConfig) -> Result<CommandReport> {
    let mut report = CommandReport::new("consolidate");
    if let Some(daemon) = running_daemon(&cfg.state_dir, &cfg.archive_dir)? {
        report.issue(format!(
            "archiver daemon pid {} is already consolidating {}; not running a second pass",
            daemon.pid,
            cfg.archive_dir.display()
        ));
        return Ok(report);
    }
    let consolidator = Consolidator::from_config(cfg);
    let pass = block_on(consolidator.run_pass(Utc::now(), &CancellationToken::new()))??;

    report.detail(format!(
        "consolidated {} of {} ready buckets, deleted {} segment files, freed {}",
        pass.consolidated,
        pass.ready,
        pass.files_deleted,
        format_bytes(pass.bytes_freed)
    ));
    for (bucket, outcome) in &pass.outcomes {
        if let BucketOutcome::Failed { reason } = outcome {
            report.issue(format!("bucket {bucket} failed: {reason}"));
        }
    }
    if pass.missing_playlist > 0 {
        report.detail(format!(
            "{} closed buckets have chunks but no playlist",
            pass.missing_playlist
        ));
    }
    if pass.delete_failures > 0 {
        report.issue(format!(
            "{} segment files could not be deleted; run `purge` later",
            pass.delete_failures
        ));
    }
    Ok(report)
}
