use anyhow::Result;

use crate::archiver::config::ArchiverConfig;
use crate::archiver::daemon;
use crate::commands::CommandReport;

pub fn run(cfg: &ArchiverConfig) -> Result<CommandReport> {
    let mut report = CommandReport::new("run");
    let summary = daemon::run(cfg)?;

    report.detail(format!("archive_dir={}", cfg.archive_dir.display()));
    report.detail(format!("capture.restarts={}", summary.supervisor.restarts));
    report.detail(format!("capture.rollovers={}", summary.supervisor.rollovers));
    report.detail(format!(
        "capture.spawn_failures={}",
        summary.supervisor.spawn_failures
    ));
    report.detail(format!("uptime_secs={}", summary.uptime.as_secs()));
    Ok(report)
}
