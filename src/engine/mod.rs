//! Timed batch execution.
//!
//! A batch runs strictly sequentially. After every successful command the
//! runner checks, in order, the stop signal, free + cached memory and the
//! last command's duration; any of these ends the batch early without an
//! error. A failing command ends it with an error and nothing is persisted.

pub mod executor;
pub mod probe;
#[cfg(test)]
pub(crate) mod test_support;

use crate::metrics::average_duration;
use crate::model::{
    AbortReason, Batch, BatchOutcome, BatchReport, BatchResult, CommandRecord, RunnerConfig,
};
use crate::storage::{ResultStore, StoreError};
use executor::{CommandExecutor, CommandFailure};
use probe::{ProbeError, SystemProbe};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Cooperative, process-wide request to stop between commands. Never resets.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Everything a batch needs from the surrounding run.
pub struct RunContext<S> {
    pub stop: StopSignal,
    pub store: S,
    pub run_id: i64,
    pub image: String,
}

/// Fatal batch outcomes. The caller owns any cleanup.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("command `{command}` failed in batch {batch}")]
    CommandFailed {
        batch: String,
        command: String,
        /// Target of the failing command. It may exist in a half-created state.
        target: String,
        /// Targets whose commands succeeded before the failure.
        completed: Vec<String>,
        #[source]
        failure: CommandFailure,
    },
    #[error("resource probe failed in batch {batch}")]
    Probe {
        batch: String,
        #[source]
        source: ProbeError,
    },
    #[error("failed to record batch {batch}")]
    Store {
        batch: String,
        #[source]
        source: StoreError,
    },
}

impl BatchError {
    /// Captured output of the failing command, if that is what failed.
    pub fn command_output(&self) -> Option<&str> {
        match self {
            BatchError::CommandFailed { failure, .. } => Some(failure.output.as_str()),
            _ => None,
        }
    }

    pub fn completed_targets(&self) -> &[String] {
        match self {
            BatchError::CommandFailed { completed, .. } => completed.as_slice(),
            _ => &[],
        }
    }

    pub fn failed_target(&self) -> Option<&str> {
        match self {
            BatchError::CommandFailed { target, .. } => Some(target.as_str()),
            _ => None,
        }
    }
}

pub struct BatchRunner<E, P> {
    executor: E,
    probe: P,
    cfg: RunnerConfig,
}

impl<E: CommandExecutor, P: SystemProbe> BatchRunner<E, P> {
    pub fn new(executor: E, probe: P, cfg: RunnerConfig) -> Self {
        Self {
            executor,
            probe,
            cfg,
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub async fn run_batch<S: ResultStore>(
        &self,
        ctx: &mut RunContext<S>,
        batch: &Batch,
    ) -> Result<BatchReport, BatchError> {
        if ctx.stop.is_requested() {
            info!(batch = %batch.name, "skipping, stop requested");
            return Ok(BatchReport::skipped());
        }

        let probe_err = |source: ProbeError| BatchError::Probe {
            batch: batch.name.clone(),
            source,
        };

        let start_res = self.probe.snapshot().map_err(probe_err)?;
        let start_all = Instant::now();
        let mut last_stop: Option<Instant> = None;
        let mut records: Vec<CommandRecord> = Vec::with_capacity(batch.len());
        let mut completed = Vec::with_capacity(batch.len());
        let mut outcome = BatchOutcome::Completed;

        for step in &batch.steps {
            let text = step.command.to_string();
            let start = Instant::now();
            self.echo(format_args!("+ {text}"));

            if let Err(failure) = self.executor.execute(&step.command).await {
                warn!(
                    batch = %batch.name,
                    command = %text,
                    output = %failure.output,
                    "command failed: {failure}"
                );
                return Err(BatchError::CommandFailed {
                    batch: batch.name.clone(),
                    command: text,
                    target: step.target.clone(),
                    completed,
                    failure,
                });
            }

            let stop = Instant::now();
            let dur = stop.duration_since(start).as_secs_f64();
            last_stop = Some(stop);
            completed.push(step.target.clone());
            self.echo(format_args!("=> OK, {dur:.2} sec"));
            records.push(CommandRecord {
                command: text,
                duration: dur,
            });

            if let Some(reason) = self.abort_reason(ctx, dur).map_err(probe_err)? {
                info!(batch = %batch.name, "stopping after {}, {reason}", records.len());
                outcome = BatchOutcome::Aborted(reason);
                break;
            }
        }

        let total_time = last_stop
            .map(|t| t.duration_since(start_all).as_secs_f64())
            .unwrap_or(0.0);
        let end_res = self.probe.snapshot().map_err(probe_err)?;
        let delta = start_res.delta_to(&end_res);

        let mut report = BatchReport {
            outcome,
            completed_targets: completed,
            records,
            result: None,
            result_id: None,
        };

        if batch.record && self.cfg.record {
            let result = BatchResult {
                id: None,
                batch: batch.name.clone(),
                backend: batch.backend.clone(),
                numrecs: report.records.len(),
                count: batch.count,
                total_time,
                avg_time: average_duration(&report.records),
                mem_increase: delta.mem_increase,
                load_increase: delta.load_increase,
                disk_increase: delta.disk_increase,
                image: ctx.image.clone(),
                run_id: ctx.run_id,
            };
            let id = ctx
                .store
                .record_batch(&result, &report.records)
                .map_err(|source| BatchError::Store {
                    batch: batch.name.clone(),
                    source,
                })?;
            debug!(batch = %batch.name, id, "recorded batch");
            report.result = Some(BatchResult {
                id: Some(id),
                ..result
            });
            report.result_id = Some(id);
        }

        Ok(report)
    }

    /// Checked after each successful command: stop, then memory, then duration.
    fn abort_reason<S>(
        &self,
        ctx: &RunContext<S>,
        last_duration: f64,
    ) -> Result<Option<AbortReason>, ProbeError> {
        if ctx.stop.is_requested() {
            return Ok(Some(AbortReason::StopRequested));
        }
        let free_mb = self.probe.free_memory_mb(true)?;
        if free_mb <= self.cfg.mem_threshold_mb {
            return Ok(Some(AbortReason::LowMemory {
                free_mb,
                threshold_mb: self.cfg.mem_threshold_mb,
            }));
        }
        let threshold = self.cfg.duration_threshold.as_secs_f64();
        if last_duration > threshold {
            return Ok(Some(AbortReason::SlowCommand {
                duration: last_duration,
                threshold,
            }));
        }
        Ok(None)
    }

    fn echo(&self, line: std::fmt::Arguments<'_>) {
        if self.cfg.verbose {
            info!("{line}");
        } else {
            debug!("{line}");
        }
    }
}
