//! Fakes for the runner's collaborators.

use super::executor::{CommandExecutor, CommandFailure};
use super::probe::{ProbeError, SystemProbe};
use super::{RunContext, StopSignal};
use crate::model::{BatchResult, CommandRecord, CommandSpec};
use crate::storage::{ResultStore, StoreError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

pub fn ctx<S>(store: S) -> RunContext<S> {
    RunContext {
        stop: StopSignal::new(),
        store,
        run_id: 7,
        image: "ubuntu".into(),
    }
}

/// Succeeds instantly unless told otherwise. Matches rules on any argument
/// equal to the given target name.
#[derive(Default)]
pub struct FakeExecutor {
    default_delay: Duration,
    delays: HashMap<String, Duration>,
    failures: HashMap<String, (i32, String)>,
    stops: HashMap<String, StopSignal>,
    stop_at_call: Option<(usize, StopSignal)>,
    outputs: Mutex<HashMap<String, VecDeque<Result<String, CommandFailure>>>>,
    executed: Mutex<Vec<String>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub fn delay_for(mut self, target: &str, delay: Duration) -> Self {
        self.delays.insert(target.into(), delay);
        self
    }

    pub fn fail_on(mut self, target: &str, status: i32, output: &str) -> Self {
        self.failures
            .insert(target.into(), (status, output.into()));
        self
    }

    /// Request `stop` once the command naming `target` finishes.
    pub fn stop_after(mut self, target: &str, stop: StopSignal) -> Self {
        self.stops.insert(target.into(), stop);
        self
    }

    /// Request `stop` once the `n`th command overall (1-based) succeeds.
    pub fn stop_on_call(mut self, n: usize, stop: StopSignal) -> Self {
        self.stop_at_call = Some((n, stop));
        self
    }

    /// Queue scripted results for commands whose full text equals `command`.
    pub fn script(self, command: &str, results: Vec<Result<String, CommandFailure>>) -> Self {
        self.outputs
            .lock()
            .unwrap()
            .insert(command.into(), results.into());
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    fn lookup<'a, T>(map: &'a HashMap<String, T>, command: &CommandSpec) -> Option<&'a T> {
        command.args.iter().find_map(|a| map.get(a))
    }
}

#[async_trait]
impl CommandExecutor for FakeExecutor {
    async fn execute(&self, command: &CommandSpec) -> Result<String, CommandFailure> {
        let text = command.to_string();
        let call = {
            let mut executed = self.executed.lock().unwrap();
            executed.push(text.clone());
            executed.len()
        };

        let delay = Self::lookup(&self.delays, command)
            .copied()
            .unwrap_or(self.default_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some((status, output)) = Self::lookup(&self.failures, command) {
            return Err(CommandFailure::exit(*status, output.clone()));
        }
        if let Some(stop) = Self::lookup(&self.stops, command) {
            stop.request();
        }
        if let Some((n, stop)) = &self.stop_at_call {
            if *n == call {
                stop.request();
            }
        }
        let scripted = self
            .outputs
            .lock()
            .unwrap()
            .get_mut(&text)
            .and_then(|q| q.pop_front());
        scripted.unwrap_or_else(|| Ok(String::new()))
    }
}

/// Deterministic resource readings. Sequences are consumed one value per
/// call; once exhausted the base values are returned.
pub struct FakeProbe {
    base_mem: i64,
    free: Mutex<VecDeque<i64>>,
    cached: Mutex<VecDeque<i64>>,
    load: Mutex<VecDeque<f64>>,
    disk: Mutex<VecDeque<i64>>,
    disk_fails: Mutex<bool>,
    calls: Mutex<usize>,
}

impl FakeProbe {
    pub fn new(base_mem: i64) -> Self {
        Self {
            base_mem,
            free: Mutex::default(),
            cached: Mutex::default(),
            load: Mutex::default(),
            disk: Mutex::default(),
            disk_fails: Mutex::new(false),
            calls: Mutex::new(0),
        }
    }

    /// Readings for free + cached memory (the abort check).
    pub fn cached_sequence(self, values: Vec<i64>) -> Self {
        *self.cached.lock().unwrap() = values.into();
        self
    }

    /// Readings for free memory alone (the batch snapshots).
    pub fn free_sequence(self, values: Vec<i64>) -> Self {
        *self.free.lock().unwrap() = values.into();
        self
    }

    pub fn set_load_sequence(&self, values: Vec<f64>) {
        *self.load.lock().unwrap() = values.into();
    }

    pub fn set_disk_sequence(&self, values: Vec<i64>) {
        *self.disk.lock().unwrap() = values.into();
    }

    pub fn fail_disk(&self) {
        *self.disk_fails.lock().unwrap() = true;
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }

    fn bump(&self) {
        *self.calls.lock().unwrap() += 1;
    }
}

impl SystemProbe for FakeProbe {
    fn free_memory_mb(&self, include_cached: bool) -> Result<i64, ProbeError> {
        self.bump();
        let seq = if include_cached { &self.cached } else { &self.free };
        Ok(seq.lock().unwrap().pop_front().unwrap_or(self.base_mem))
    }

    fn load_average(&self) -> Result<f64, ProbeError> {
        self.bump();
        Ok(self.load.lock().unwrap().pop_front().unwrap_or(0.25))
    }

    fn free_disk_mb(&self) -> Result<i64, ProbeError> {
        self.bump();
        if *self.disk_fails.lock().unwrap() {
            return Err(ProbeError::Statvfs {
                path: "/fake".into(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        Ok(self.disk.lock().unwrap().pop_front().unwrap_or(50_000))
    }
}

/// In-memory stand-in for the SQLite store.
#[derive(Default)]
pub struct MemoryStore {
    pub results: Vec<BatchResult>,
    pub records: Vec<(i64, CommandRecord)>,
    pub fail: bool,
}

impl ResultStore for MemoryStore {
    fn insert_batch_result(&mut self, result: &BatchResult) -> Result<i64, StoreError> {
        if self.fail {
            return Err(StoreError::Sqlite(rusqlite::Error::QueryReturnedNoRows));
        }
        self.results.push(result.clone());
        Ok(self.results.len() as i64)
    }

    fn insert_command_record(
        &mut self,
        result_id: i64,
        record: &CommandRecord,
    ) -> Result<(), StoreError> {
        self.records.push((result_id, record.clone()));
        Ok(())
    }
}
