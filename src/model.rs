use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Settings for one `run` invocation, logged at debug level when the run starts.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub counts: Vec<usize>,
    pub backend: String,
    pub image: String,
    pub image_alias: String,
    pub message: String,
    pub lxc: String,
    pub env: Vec<(String, String)>,
    pub mount_point: std::path::PathBuf,
    pub runner: RunnerConfig,
}

/// Knobs consumed by the batch runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Echo each command and its completion at info level instead of debug.
    pub verbose: bool,
    /// Abort once free + cached memory drops to or below this many MB.
    pub mem_threshold_mb: i64,
    /// Abort once a single command takes longer than this.
    #[serde(with = "humantime_serde")]
    pub duration_threshold: Duration,
    /// Global switch; a batch is persisted only if this and `Batch::record` are set.
    pub record: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            mem_threshold_mb: 512,
            duration_threshold: Duration::from_secs(600),
            record: true,
        }
    }
}

/// A program and its arguments. Never passed through a shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchStep {
    pub command: CommandSpec,
    /// Logical name of the container, copy or snapshot the command acts on.
    pub target: String,
}

/// An ordered group of commands measured together.
#[derive(Debug, Clone)]
pub struct Batch {
    pub name: String,
    pub backend: String,
    /// Requested operation count this batch belongs to.
    pub count: usize,
    pub record: bool,
    pub steps: Vec<BatchStep>,
}

impl Batch {
    pub fn new(name: impl Into<String>, backend: impl Into<String>, count: usize) -> Self {
        Self {
            name: name.into(),
            backend: backend.into(),
            count,
            record: true,
            steps: Vec::new(),
        }
    }

    pub fn unrecorded(mut self) -> Self {
        self.record = false;
        self
    }

    pub fn push(mut self, command: CommandSpec, target: impl Into<String>) -> Self {
        self.steps.push(BatchStep {
            command,
            target: target.into(),
        });
        self
    }

    /// Add a step whose target is the command text itself (e.g. `lxc list`).
    pub fn push_untargeted(self, command: CommandSpec) -> Self {
        let target = command.to_string();
        self.push(command, target)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command: String,
    /// Seconds.
    pub duration: f64,
}

/// Point-in-time system resources. Memory and disk in MB.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub free_mem_mb: i64,
    pub load: f64,
    pub free_disk_mb: i64,
}

impl ResourceSnapshot {
    /// `later - self`, field by field.
    pub fn delta_to(&self, later: &ResourceSnapshot) -> ResourceDelta {
        ResourceDelta {
            mem_increase: later.free_mem_mb - self.free_mem_mb,
            load_increase: later.load - self.load,
            disk_increase: later.free_disk_mb - self.free_disk_mb,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceDelta {
    pub mem_increase: i64,
    pub load_increase: f64,
    pub disk_increase: i64,
}

/// Aggregate measurements for one executed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    #[serde(default)]
    pub id: Option<i64>,
    pub batch: String,
    pub backend: String,
    pub numrecs: usize,
    pub count: usize,
    pub total_time: f64,
    /// NaN when no command completed.
    pub avg_time: f64,
    pub mem_increase: i64,
    pub load_increase: f64,
    pub disk_increase: i64,
    pub image: String,
    pub run_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub id: i64,
    pub argv: String,
    pub date: String,
    pub message: String,
}

/// Why a batch stopped before running all of its commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AbortReason {
    StopRequested,
    LowMemory { free_mb: i64, threshold_mb: i64 },
    SlowCommand { duration: f64, threshold: f64 },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::StopRequested => f.write_str("user asked to halt"),
            AbortReason::LowMemory {
                free_mb,
                threshold_mb,
            } => write!(
                f,
                "ran out of memory ({free_mb} MB free, threshold {threshold_mb} MB)"
            ),
            AbortReason::SlowCommand {
                duration,
                threshold,
            } => write!(
                f,
                "got impatient (last command took {duration:.2} sec, threshold {threshold:.2} sec)"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BatchOutcome {
    /// Stop was already requested; nothing ran.
    Skipped,
    Completed,
    Aborted(AbortReason),
}

/// What `run_batch` hands back when the batch did not fail.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub outcome: BatchOutcome,
    pub completed_targets: Vec<String>,
    pub records: Vec<CommandRecord>,
    pub result: Option<BatchResult>,
    pub result_id: Option<i64>,
}

impl BatchReport {
    pub fn skipped() -> Self {
        Self {
            outcome: BatchOutcome::Skipped,
            completed_targets: Vec::new(),
            records: Vec::new(),
            result: None,
            result_id: None,
        }
    }
}
