use crate::archiver::audit;
use crate::archiver::config::ArchiverConfig;
use crate::archiver::consolidate::{Consolidator, run_scheduler};
use crate::archiver::ffmpeg::CaptureSpec;
use crate::archiver::lock::DaemonLock;
use crate::archiver::retention::run_reaper;
use crate::archiver::supervisor::{CaptureSupervisor, SupervisorOptions, SupervisorReport};
use anyhow::{Context, Result};
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct DaemonSummary {
    pub supervisor: SupervisorReport,
    pub uptime: Duration,
}

/// Blocking entry point: validate, lock, then serve until SIGINT/SIGTERM.
pub fn run(cfg: &ArchiverConfig) -> Result<DaemonSummary> {
    let stream_url = cfg.require_stream_url()?.to_string();
    fs::create_dir_all(&cfg.archive_dir)
        .with_context(|| format!("failed to create {}", cfg.archive_dir.display()))?;
    fs::create_dir_all(&cfg.state_dir)
        .with_context(|| format!("failed to create {}", cfg.state_dir.display()))?;
    let lock = DaemonLock::acquire(&cfg.state_dir, &cfg.archive_dir)?;
    tracing::info!(
        archive_dir = %cfg.archive_dir.display(),
        lock = %lock.path().display(),
        build = env!("BUILD_UUID"),
        "archiver daemon starting"
    );
    audit::record(
        &cfg.state_dir,
        "daemon",
        "started",
        &format!("pid={} archive_dir={}", std::process::id(), cfg.archive_dir.display()),
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("cctv-archiver")
        .build()
        .context("failed to build tokio runtime")?;

    let started = Instant::now();
    let shutdown = CancellationToken::new();
    let report = runtime.block_on(async {
        let listener = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                shutdown.cancel();
            })
        };
        let report = serve(cfg, stream_url, shutdown.clone()).await;
        listener.abort();
        report
    })?;

    let summary = DaemonSummary {
        supervisor: report,
        uptime: started.elapsed(),
    };
    tracing::info!(
        restarts = report.restarts,
        rollovers = report.rollovers,
        spawn_failures = report.spawn_failures,
        uptime_secs = summary.uptime.as_secs(),
        "archiver daemon stopped"
    );
    audit::record(
        &cfg.state_dir,
        "daemon",
        "stopped",
        &format!("restarts={} rollovers={}", report.restarts, report.rollovers),
    );
    drop(lock);
    Ok(summary)
}

/// Run capture, consolidation and retention until `shutdown` is cancelled,
/// then wait for all three (and the capture child) to finish.
pub async fn serve(
    cfg: &ArchiverConfig,
    stream_url: String,
    shutdown: CancellationToken,
) -> Result<SupervisorReport> {
    let state_dir = cfg.state_dir.clone();
    let supervisor = CaptureSupervisor::new(
        CaptureSpec::from_config(cfg, &stream_url),
        SupervisorOptions {
            restart_backoff: cfg.restart_backoff(),
            stop_grace: cfg.stop_grace(),
            rollover: true,
        },
    )
    .on_restart(move |report, reason| {
        audit::record(
            &state_dir,
            "capture",
            "restarted",
            &format!("restarts={} reason={reason}", report.restarts),
        );
    });

    let capture = tokio::spawn(supervisor.run(shutdown.child_token()));
    let consolidation = tokio::spawn(run_scheduler(
        Arc::new(Consolidator::from_config(cfg)),
        Duration::from_secs(cfg.consolidation.interval_secs),
        shutdown.child_token(),
    ));
    let retention = tokio::spawn(run_reaper(
        cfg.archive_dir.clone(),
        cfg.state_dir.clone(),
        cfg.retention_age(),
        Duration::from_secs(cfg.retention.interval_secs),
        shutdown.child_token(),
    ));

    shutdown.cancelled().await;
    tracing::info!("shutdown requested, waiting for loops to finish");

    let (capture, consolidation, retention) = tokio::join!(capture, consolidation, retention);
    if let Err(err) = consolidation {
        tracing::error!("consolidation loop panicked: {err}");
    }
    if let Err(err) = retention {
        tracing::error!("retention loop panicked: {err}");
    }
    capture.context("capture supervisor panicked")
}

/// Resolves on SIGINT or SIGTERM. A listener that cannot be installed
/// never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("received SIGINT"),
            Err(err) => {
                tracing::error!("failed to install SIGINT handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                tracing::info!("received SIGTERM");
            }
            Err(err) => {
                tracing::error!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
