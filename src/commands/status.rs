use anyhow::Result;
use chrono::Utc;

use crate::archiver::classify::{buckets_older_than, scan_dir};
use crate::archiver::config::ArchiverConfig;
use crate::archiver::consolidate::{Readiness, plan};
use crate::archiver::lock::{lock_path, read_lock_info};
use crate::archiver::purge::protection_window;
use crate::archiver::process;
use crate::archiver::util::format_bytes;
use crate::commands::CommandReport;

pub fn run(cfg: &ArchiverConfig) -> Result<CommandReport> {
    let mut report = CommandReport::new("status");
    let now = Utc::now();

    report.detail(format!("archive_dir={}", cfg.archive_dir.display()));
    report.detail(format!("state_dir={}", cfg.state_dir.display()));
    if !cfg.archive_dir.is_dir() {
        report.issue(format!(
            "archive_dir=missing ({})",
            cfg.archive_dir.display()
        ));
    }

    let scan = scan_dir(&cfg.archive_dir)?;
    let segment_sets = scan.buckets.values().filter(|f| f.has_segments()).count();
    let archives = scan.buckets.values().filter(|f| f.archive.is_some()).count();
    let pending = plan(&scan, now, Readiness::from_config(cfg));
    let (mut leftovers, mut orphans) = (0usize, 0usize);
    for (_, files) in buckets_older_than(&scan, now, protection_window()) {
        if !files.has_segments() {
            continue;
        }
        if files.has_usable_archive() {
            leftovers += 1;
        } else {
            orphans += 1;
        }
    }

    report.detail(format!("buckets.segment_sets={segment_sets}"));
    report.detail(format!("buckets.archives={archives}"));
    report.detail(format!("buckets.pending_consolidation={}", pending.ready.len()));
    report.detail(format!("buckets.leftovers={leftovers}"));
    report.detail(format!("buckets.orphans={orphans}"));
    report.detail(format!(
        "bytes.total={} ({})",
        scan.total_bytes(),
        format_bytes(scan.total_bytes())
    ));
    if scan.foreign_files > 0 {
        report.detail(format!("files.foreign={}", scan.foreign_files));
    }

    let lock = lock_path(&cfg.state_dir);
    match read_lock_info(&cfg.state_dir) {
        Ok(None) => report.detail("daemon.lock=not_found (daemon likely not running)"),
        Ok(Some(info)) => {
            report.detail(format!("daemon.lock={}", lock.display()));
            report.detail(format!("daemon.pid={}", info.pid));
            report.detail(format!("daemon.build_uuid={}", info.build_uuid));
            report.detail(format!("daemon.start_time={}", info.start_time));
            if process::is_running(info.pid)? {
                report.detail("daemon.process=alive");
            } else {
                report.issue("daemon.process=dead (stale lock)");
            }
            let current = env!("BUILD_UUID");
            if info.build_uuid == current {
                report.detail("daemon.build_match=ok");
            } else {
                report.detail(format!(
                    "daemon.build_match=mismatch (lock={} current={current})",
                    info.build_uuid
                ));
            }
        }
        Err(err) => report.issue(format!("daemon.lock=unreadable ({err:#})")),
    }

    Ok(report)
}
