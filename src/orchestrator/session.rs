//! One benchmark run: the lifecycle plan for every requested count.

use super::plan::{self, LxcCli};
use super::readiness::{wait_for_cloud_init, ReadinessPolicy};
use crate::engine::executor::CommandExecutor;
use crate::engine::probe::SystemProbe;
use crate::engine::{BatchError, BatchRunner, RunContext};
use crate::model::{Batch, BatchOutcome};
use crate::storage::ResultStore;
use anyhow::Result;
use tracing::{debug, error, info, warn};

pub struct Session<'r, E, P, S> {
    runner: &'r BatchRunner<E, P>,
    ctx: RunContext<S>,
    cli: LxcCli,
    backend: String,
    readiness: Option<ReadinessPolicy>,
    /// Containers created and not yet deleted, in creation order.
    outstanding: Vec<String>,
}

impl<'r, E, P, S> Session<'r, E, P, S>
where
    E: CommandExecutor,
    P: SystemProbe,
    S: ResultStore,
{
    pub fn new(
        runner: &'r BatchRunner<E, P>,
        ctx: RunContext<S>,
        cli: LxcCli,
        backend: impl Into<String>,
        readiness: Option<ReadinessPolicy>,
    ) -> Self {
        Self {
            runner,
            ctx,
            cli,
            backend: backend.into(),
            readiness,
            outstanding: Vec::new(),
        }
    }

    pub fn into_context(self) -> RunContext<S> {
        self.ctx
    }

    /// Run the plan for each count. A fatal error cleans up what this session
    /// created and is returned; a stop request ends the run normally.
    pub async fn run_counts(&mut self, counts: &[usize]) -> Result<()> {
        for &count in counts {
            info!(backend = %self.backend, count, "** N = {count}");
            if let Err(e) = self.run_count(count).await {
                report_failure(&e);
                self.cleanup().await;
                return Err(e);
            }
            if !self.outstanding.is_empty() {
                warn!(left = ?self.outstanding, "containers left behind, removing");
                self.cleanup().await;
            }
            if self.ctx.stop.is_requested() {
                info!("stop requested, not running remaining counts");
                break;
            }
        }
        Ok(())
    }

    async fn run_count(&mut self, count: usize) -> Result<()> {
        let backend = self.backend.clone();

        info!("*** launching {count} containers");
        let launched = self
            .run(plan::launch(&self.cli, &backend, count, count))
            .await?;
        self.outstanding.extend(launched.iter().cloned());
        info!("*** listing");
        self.run(plan::list(&self.cli, "containers", &backend, count))
            .await?;
        info!("*** deleting");
        let deleted = self
            .run(plan::delete(&self.cli, &launched, "containers", &backend, count))
            .await?;
        self.forget(&deleted);

        let launched = self
            .run(plan::launch(&self.cli, &backend, count, 1).unrecorded())
            .await?;
        self.outstanding.extend(launched.iter().cloned());
        if let Some(src) = launched.first().cloned() {
            if let Some(policy) = self.readiness.filter(|_| !self.ctx.stop.is_requested()) {
                wait_for_cloud_init(self.runner.executor(), &self.cli, &src, policy).await?;
            }
            info!("*** pausing {src}");
            self.run(plan::pause(&self.cli, std::slice::from_ref(&src), &backend, count))
                .await?;

            info!("*** making {count} copies");
            let copies = self.run(plan::copy(&self.cli, &src, &backend, count)).await?;
            self.outstanding.extend(copies.iter().cloned());
            self.run(plan::list(&self.cli, "copies", &backend, count))
                .await?;
            info!("*** deleting the copies");
            let deleted = self
                .run(plan::delete(&self.cli, &copies, "copies", &backend, count))
                .await?;
            self.forget(&deleted);

            info!("*** making {count} snapshots");
            let snaps = self
                .run(plan::snapshot(&self.cli, &src, &backend, count))
                .await?;
            debug!(snapshots = ?plan::snapshot_paths(&src, &snaps), "snapshots taken");

            info!("*** cleaning up {src} and snaps");
            // Deleting the source removes its snapshots too.
            let deleted = self
                .run(plan::delete(
                    &self.cli,
                    std::slice::from_ref(&src),
                    "container-with-snaps",
                    &backend,
                    count,
                ))
                .await?;
            self.forget(&deleted);
        }

        self.check_clean().await;
        Ok(())
    }

    async fn run(&mut self, batch: Batch) -> Result<Vec<String>, BatchError> {
        match self.runner.run_batch(&mut self.ctx, &batch).await {
            Ok(report) => {
                debug!(
                    batch = %batch.name,
                    records = report.records.len(),
                    result_id = ?report.result_id,
                    avg = ?report.result.as_ref().map(|r| r.avg_time),
                    "batch finished"
                );
                if let BatchOutcome::Aborted(reason) = &report.outcome {
                    warn!(
                        batch = %batch.name,
                        completed = report.completed_targets.len(),
                        requested = batch.len(),
                        "batch aborted: {reason}"
                    );
                }
                Ok(report.completed_targets)
            }
            Err(e) => {
                // The failing command may have left its target half created.
                if batch.name == "launch" || batch.name == "copy" {
                    self.outstanding.extend(e.completed_targets().iter().cloned());
                    self.outstanding.extend(e.failed_target().map(str::to_string));
                }
                if batch.name.starts_with("delete-") {
                    self.forget(e.completed_targets());
                }
                Err(e)
            }
        }
    }

    fn forget(&mut self, deleted: &[String]) {
        self.outstanding.retain(|t| !deleted.contains(t));
    }

    async fn check_clean(&self) {
        match self.runner.executor().execute(&self.cli.list()).await {
            Ok(out) => debug!("*** check that we're clean:\n{out}"),
            Err(e) => warn!("listing after plan failed: {e}"),
        }
    }

    /// Best-effort force delete of everything still outstanding, newest first.
    async fn cleanup(&mut self) {
        while let Some(target) = self.outstanding.pop() {
            let cmd = self.cli.delete(&target);
            match self.runner.executor().execute(&cmd).await {
                Ok(_) => info!(target = %target, "cleaned up"),
                Err(e) => warn!(target = %target, output = %e.output, "cleanup failed: {e}"),
            }
        }
    }
}

fn report_failure(e: &anyhow::Error) {
    error!("stopped because of an error: {e:#}");
    if let Some(output) = e
        .downcast_ref::<BatchError>()
        .and_then(BatchError::command_output)
    {
        error!("output:\n{output}");
    }
}
