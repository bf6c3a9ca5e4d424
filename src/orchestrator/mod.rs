//! Application-level orchestration.
//!
//! Owns the run lifecycle: recording the run, wiring the stop signal, and
//! driving the lifecycle plan through the batch runner. The CLI layer calls
//! into this module and only deals with presentation.

mod plan;
mod readiness;
mod session;
mod signal;

use crate::engine::executor::ProcessExecutor;
use crate::engine::probe::ProcProbe;
use crate::engine::{BatchRunner, RunContext, StopSignal};
use crate::model::RunConfig;
use crate::storage::SqliteStore;
use anyhow::{Context, Result};
use plan::LxcCli;
use readiness::ReadinessPolicy;
use session::Session;
use tracing::{debug, info};

/// Execute a benchmark run and return its id. The store is handed back so
/// the caller can report on it.
pub(crate) async fn run_benchmark(
    cfg: &RunConfig,
    store: SqliteStore,
    argv: &[String],
) -> Result<(i64, SqliteStore)> {
    let argv_json = serde_json::to_string(argv).context("serialize argv")?;
    let date = time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into());
    let run_id = store
        .create_run(&argv_json, &date, &cfg.message)
        .context("failed to record run")?;
    debug!(
        run_id,
        config = %serde_json::to_string(cfg).unwrap_or_default(),
        "starting run"
    );

    let stop = StopSignal::new();
    let listener = signal::spawn_stop_listener(stop.clone())
        .context("failed to install SIGUSR1 handler")?;
    info!(
        "Running. Use 'kill -USR1 {}' to stop a batch",
        std::process::id()
    );

    let runner = BatchRunner::new(
        ProcessExecutor::new(cfg.env.clone()),
        ProcProbe::new(&cfg.mount_point),
        cfg.runner.clone(),
    );
    let ctx = RunContext {
        stop,
        store,
        run_id,
        image: cfg.image.clone(),
    };
    let readiness = cfg
        .image
        .contains("ubuntu")
        .then(ReadinessPolicy::default);

    info!(backend = %cfg.backend, "* backend = {}", cfg.backend);
    let mut session = Session::new(
        &runner,
        ctx,
        LxcCli::new(&cfg.lxc, &cfg.image_alias),
        &cfg.backend,
        readiness,
    );
    let outcome = session.run_counts(&cfg.counts).await;
    listener.abort();

    if outcome.is_err() && !cfg.env.is_empty() {
        let env: Vec<String> = cfg.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        info!("inspect with: {} {} list", env.join(" "), cfg.lxc);
    }
    outcome.with_context(|| format!("run {run_id} failed"))?;
    Ok((run_id, session.into_context().store))
}
