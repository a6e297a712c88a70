use anyhow::Result;
use chrono::Utc;

use crate::archiver::audit;
use crate::archiver::config::ArchiverConfig;
use crate::archiver::purge::{PurgeOptions, purge};
use crate::commands::CommandReport;

pub fn run(cfg: &ArchiverConfig, opts: PurgeOptions) -> Result<CommandReport> {
    let mut report = CommandReport::new("purge");
    let outcome = purge(&cfg.archive_dir, Utc::now(), opts)?;

    tracing::info!(
        mode = opts.mode.as_str(),
        dry_run = opts.dry_run,
        buckets = outcome.buckets.len(),
        files = outcome.files_deleted,
        bytes = outcome.bytes_freed,
        "purge finished"
    );
    if !opts.dry_run {
        audit::record(
            &cfg.state_dir,
            "purge",
            if outcome.failed == 0 { "ok" } else { "partial" },
            &format!(
                "mode={} files={} bytes={} failed={}",
                opts.mode.as_str(),
                outcome.files_deleted,
                outcome.bytes_freed,
                outcome.failed
            ),
        );
    }

    report.detail(outcome.summary());
    if outcome.failed > 0 {
        report.issue(format!(
            "{} files could not be deleted; see warnings",
            outcome.failed
        ));
    }
    Ok(report)
}
