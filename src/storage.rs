//! Result persistence.
//!
//! Batches and their per-command records are appended to a local SQLite
//! database. Nothing is ever updated or deleted.

use crate::model::{BatchResult, CommandRecord, RunInfo};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create {}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Append-only sink for batch results.
pub trait ResultStore {
    fn insert_batch_result(&mut self, result: &BatchResult) -> Result<i64, StoreError>;

    fn insert_command_record(
        &mut self,
        result_id: i64,
        record: &CommandRecord,
    ) -> Result<(), StoreError>;

    /// Persist a result and its records, returning the result's id.
    fn record_batch(
        &mut self,
        result: &BatchResult,
        records: &[CommandRecord],
    ) -> Result<i64, StoreError> {
        let id = self.insert_batch_result(result)?;
        for record in records {
            self.insert_command_record(id, record)?;
        }
        Ok(id)
    }
}

pub fn default_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lxd-bench")
        .join("bench.sqlite3")
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )?;
        migrate(&conn)?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self { conn })
    }

    pub fn create_run(&self, argv: &str, date: &str, message: &str) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO runs (argv, date, message) VALUES (?1, ?2, ?3)",
            params![argv, date, message],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_runs(&self) -> Result<Vec<RunInfo>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, argv, date, message FROM runs ORDER BY id")?;
        let rows = stmt.query_map([], map_run)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn load_run(&self, id: i64) -> Result<Option<RunInfo>, StoreError> {
        self.conn
            .query_row(
                "SELECT id, argv, date, message FROM runs WHERE id = ?1",
                params![id],
                map_run,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn load_batches(&self, run_id: i64) -> Result<Vec<BatchResult>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, batch, backend, numrecs, count, total_time, avg_time,
                    mem_increase, load_increase, disk_increase, image, run_id
             FROM timings WHERE run_id = ?1
             ORDER BY batch, count, numrecs, id",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(BatchResult {
                id: Some(row.get(0)?),
                batch: row.get(1)?,
                backend: row.get(2)?,
                numrecs: row.get::<_, i64>(3)? as usize,
                count: row.get::<_, i64>(4)? as usize,
                total_time: row.get(5)?,
                avg_time: row.get::<_, Option<f64>>(6)?.unwrap_or(f64::NAN),
                mem_increase: row.get(7)?,
                load_increase: row.get(8)?,
                disk_increase: row.get(9)?,
                image: row.get(10)?,
                run_id: row.get(11)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    pub fn load_records(&self, timings_id: i64) -> Result<Vec<CommandRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT cmd, duration FROM recs WHERE timings_id = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![timings_id], |row| {
            Ok(CommandRecord {
                command: row.get(0)?,
                duration: row.get(1)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS runs (
            id INTEGER PRIMARY KEY,
            argv TEXT NOT NULL,
            date TEXT NOT NULL,
            message TEXT NOT NULL DEFAULT ''
        );
        CREATE TABLE IF NOT EXISTS timings (
            id INTEGER PRIMARY KEY,
            batch TEXT NOT NULL,
            backend TEXT NOT NULL,
            numrecs INTEGER NOT NULL,
            count INTEGER NOT NULL,
            total_time REAL NOT NULL,
            avg_time REAL,
            mem_increase INTEGER NOT NULL,
            load_increase REAL NOT NULL,
            disk_increase INTEGER NOT NULL,
            image TEXT NOT NULL,
            run_id INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_timings_run ON timings(run_id);
        CREATE TABLE IF NOT EXISTS recs (
            id INTEGER PRIMARY KEY,
            cmd TEXT NOT NULL,
            duration REAL NOT NULL,
            timings_id INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_recs_timings ON recs(timings_id);",
    )
}

fn map_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunInfo> {
    Ok(RunInfo {
        id: row.get(0)?,
        argv: row.get(1)?,
        date: row.get(2)?,
        message: row.get(3)?,
    })
}

fn insert_timing(conn: &Connection, r: &BatchResult) -> Result<i64, rusqlite::Error> {
    let avg = (!r.avg_time.is_nan()).then_some(r.avg_time);
    conn.execute(
        "INSERT INTO timings (batch, backend, numrecs, count, total_time, avg_time,
                              mem_increase, load_increase, disk_increase, image, run_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            r.batch,
            r.backend,
            r.numrecs as i64,
            r.count as i64,
            r.total_time,
            avg,
            r.mem_increase,
            r.load_increase,
            r.disk_increase,
            r.image,
            r.run_id
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn insert_rec(conn: &Connection, timings_id: i64, rec: &CommandRecord) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO recs (cmd, duration, timings_id) VALUES (?1, ?2, ?3)",
        params![rec.command, rec.duration, timings_id],
    )?;
    Ok(())
}

impl ResultStore for SqliteStore {
    fn insert_batch_result(&mut self, result: &BatchResult) -> Result<i64, StoreError> {
        insert_timing(&self.conn, result).map_err(Into::into)
    }

    fn insert_command_record(
        &mut self,
        result_id: i64,
        record: &CommandRecord,
    ) -> Result<(), StoreError> {
        insert_rec(&self.conn, result_id, record).map_err(Into::into)
    }

    fn record_batch(
        &mut self,
        result: &BatchResult,
        records: &[CommandRecord],
    ) -> Result<i64, StoreError> {
        let tx = self.conn.transaction()?;
        let id = insert_timing(&tx, result)?;
        for record in records {
            insert_rec(&tx, id, record)?;
        }
        tx.commit()?;
        Ok(id)
    }
}

/// A run with its batches, as exported to JSON.
#[derive(Debug, Serialize)]
pub struct RunExport {
    pub run: RunInfo,
    pub batches: Vec<BatchExport>,
}

#[derive(Debug, Serialize)]
pub struct BatchExport {
    #[serde(flatten)]
    pub result: BatchResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<CommandRecord>>,
}

pub fn load_export(store: &SqliteStore, run_id: i64, with_records: bool) -> Result<RunExport> {
    let run = store
        .load_run(run_id)?
        .with_context(|| format!("no run with id {run_id}"))?;
    let mut batches = Vec::new();
    for result in store.load_batches(run_id)? {
        let records = match (with_records, result.id) {
            (true, Some(id)) => Some(store.load_records(id)?),
            _ => None,
        };
        batches.push(BatchExport { result, records });
    }
    Ok(RunExport { run, batches })
}

pub fn export_json<W: Write>(mut out: W, export: &RunExport) -> Result<()> {
    serde_json::to_writer_pretty(&mut out, export).context("serialize run export")?;
    writeln!(out)?;
    Ok(())
}

pub fn export_csv<W: Write>(mut out: W, batches: &[BatchResult]) -> Result<()> {
    writeln!(
        out,
        "id,batch,backend,numrecs,count,total_time,avg_time,mem_inc,load_inc,disk_inc,image,run_id"
    )?;
    for b in batches {
        let avg = if b.avg_time.is_nan() {
            String::new()
        } else {
            format!("{:.6}", b.avg_time)
        };
        writeln!(
            out,
            "{},{},{},{},{},{:.6},{},{},{:.3},{},{},{}",
            b.id.map(|i| i.to_string()).unwrap_or_default(),
            csv_field(&b.batch),
            csv_field(&b.backend),
            b.numrecs,
            b.count,
            b.total_time,
            avg,
            b.mem_increase,
            b.load_increase,
            b.disk_increase,
            csv_field(&b.image),
            b.run_id
        )?;
    }
    Ok(())
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(run_id: i64, batch: &str, numrecs: usize, avg: f64) -> BatchResult {
        BatchResult {
            id: None,
            batch: batch.into(),
            backend: "zfs".into(),
            numrecs,
            count: 3,
            total_time: 3.2,
            avg_time: avg,
            mem_increase: -120,
            load_increase: 0.4,
            disk_increase: -64,
            image: "ubuntu".into(),
            run_id,
        }
    }

    fn recs(n: usize) -> Vec<CommandRecord> {
        (0..n)
            .map(|i| CommandRecord {
                command: format!("lxc launch img ctr-{i}-zfs"),
                duration: 1.0 + i as f64,
            })
            .collect()
    }

    #[test]
    fn batch_and_records_roundtrip() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let run_id = store.create_run("[\"run\"]", "2026-01-01T00:00:00Z", "first").unwrap();
        let id = store
            .record_batch(&result(run_id, "launch", 3, 2.0), &recs(3))
            .unwrap();

        let batches = store.load_batches(run_id).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].id, Some(id));
        assert_eq!(batches[0].numrecs, 3);
        assert_eq!(batches[0].mem_increase, -120);

        let loaded = store.load_records(id).unwrap();
        assert_eq!(loaded, recs(3));
    }

    #[test]
    fn nan_average_is_stored_as_null() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let run_id = store.create_run("[]", "now", "").unwrap();
        store
            .record_batch(&result(run_id, "list-copies", 0, f64::NAN), &[])
            .unwrap();
        let batches = store.load_batches(run_id).unwrap();
        assert!(batches[0].avg_time.is_nan());
        let null_count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM timings WHERE avg_time IS NULL", [], |r| r.get(0))
            .unwrap();
        assert_eq!(null_count, 1);
    }

    #[test]
    fn batches_are_scoped_to_their_run_and_ordered() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let a = store.create_run("[]", "d1", "a").unwrap();
        let b = store.create_run("[]", "d2", "b").unwrap();
        store.record_batch(&result(a, "snapshot", 3, 1.0), &[]).unwrap();
        store.record_batch(&result(a, "copy", 3, 1.0), &[]).unwrap();
        store.record_batch(&result(b, "launch", 3, 1.0), &[]).unwrap();

        let names: Vec<_> = store
            .load_batches(a)
            .unwrap()
            .into_iter()
            .map(|r| r.batch)
            .collect();
        assert_eq!(names, vec!["copy", "snapshot"]);
        assert_eq!(store.list_runs().unwrap().len(), 2);
        assert_eq!(store.load_run(b).unwrap().unwrap().message, "b");
        assert!(store.load_run(99).unwrap().is_none());
    }

    #[test]
    fn open_creates_parent_dirs_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bench.sqlite3");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.create_run("[]", "d", "persisted").unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.list_runs().unwrap()[0].message, "persisted");
    }

    #[test]
    fn exports_csv_and_json() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let run_id = store.create_run("[]", "d", "msg").unwrap();
        store
            .record_batch(&result(run_id, "delete-copies", 2, 0.5), &recs(2))
            .unwrap();

        let mut csv = Vec::new();
        export_csv(&mut csv, &store.load_batches(run_id).unwrap()).unwrap();
        let csv = String::from_utf8(csv).unwrap();
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains(",delete-copies,zfs,2,3,"));

        let export = load_export(&store, run_id, true).unwrap();
        let mut json = Vec::new();
        export_json(&mut json, &export).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(v["run"]["message"], "msg");
        assert_eq!(v["batches"][0]["batch"], "delete-copies");
        assert_eq!(v["batches"][0]["records"].as_array().unwrap().len(), 2);

        assert!(load_export(&store, 42, false).is_err());
    }

    #[test]
    fn csv_quotes_awkward_fields() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
