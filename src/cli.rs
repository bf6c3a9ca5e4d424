use crate::model::{RunConfig, RunnerConfig};
use crate::storage::{self, SqliteStore};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "lxd-bench",
    version,
    about = "Benchmark container lifecycle operations on an LXD storage backend"
)]
pub struct Cli {
    /// Increase verbosity (-v echoes every command, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Results database (defaults to the user data directory)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the benchmark plan against an already provisioned backend
    Run(RunArgs),
    /// Show recorded runs
    Show(ShowArgs),
}

#[derive(Debug, Args, Clone)]
pub struct RunArgs {
    /// Comma separated counts of containers/copies/snapshots to bench
    pub counts: String,

    /// Label of the storage backend the daemon is using (dir, lvm, btrfs, zfs, ...)
    pub backend: String,

    /// Image label recorded with results; "ubuntu" images wait for cloud-init
    #[arg(long, default_value = "ubuntu")]
    pub image: String,

    /// Alias of the image to launch from
    #[arg(long, default_value = "img")]
    pub image_alias: String,

    /// Message about the run
    #[arg(short, long, default_value = "")]
    pub message: String,

    /// Stop a batch once free + cached RAM drops to this many MB
    #[arg(long, default_value_t = 512)]
    pub mem_threshold: i64,

    /// Stop a batch after a single command takes longer than this
    #[arg(long, default_value = "10m")]
    pub runtime_threshold: humantime::Duration,

    /// Client binary to drive
    #[arg(long, default_value = "lxc")]
    pub lxc: String,

    /// Extra environment for the client, e.g. LXD_DIR=/tmp/lxd (repeatable)
    #[arg(long = "env", value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// Mount point whose free space is measured
    #[arg(long, default_value = "/")]
    pub mount_point: PathBuf,

    /// Execute batches without writing results
    #[arg(long)]
    pub no_record: bool,

    /// Do not print the run summary at the end
    #[arg(long)]
    pub quiet: bool,
}

#[derive(Debug, Args, Clone)]
pub struct ShowArgs {
    /// Run id to show; lists runs when omitted
    #[arg(long = "run")]
    pub run_id: Option<i64>,

    /// Include every command record
    #[arg(short, long)]
    pub all: bool,

    /// Print batches as CSV
    #[arg(long, conflicts_with = "json")]
    pub csv: bool,

    /// Print the run as JSON
    #[arg(long)]
    pub json: bool,
}

fn parse_env(s: &str) -> Result<(String, String)> {
    let (k, v) = s
        .split_once('=')
        .with_context(|| format!("expected KEY=VALUE, got {s:?}"))?;
    if k.is_empty() {
        bail!("empty variable name in {s:?}");
    }
    Ok((k.to_string(), v.to_string()))
}

fn parse_counts(s: &str) -> Result<Vec<usize>> {
    let counts = s
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(|c| {
            c.parse::<usize>()
                .with_context(|| format!("invalid count {c:?}"))
        })
        .collect::<Result<Vec<_>>>()?;
    if counts.is_empty() {
        bail!("no counts given");
    }
    if counts.contains(&0) {
        bail!("counts must be positive");
    }
    Ok(counts)
}

/// Build a `RunConfig` from CLI arguments.
pub fn build_config(args: &RunArgs, verbose: u8) -> Result<RunConfig> {
    Ok(RunConfig {
        counts: parse_counts(&args.counts)?,
        backend: args.backend.clone(),
        image: args.image.clone(),
        image_alias: args.image_alias.clone(),
        message: args.message.clone(),
        lxc: args.lxc.clone(),
        env: args.env.clone(),
        mount_point: args.mount_point.clone(),
        runner: RunnerConfig {
            verbose: verbose > 0,
            mem_threshold_mb: args.mem_threshold,
            duration_threshold: *args.runtime_threshold,
            record: !args.no_record,
        },
    })
}

fn open_store(cli: &Cli) -> Result<SqliteStore> {
    let path = cli.db.clone().unwrap_or_else(storage::default_path);
    SqliteStore::open(&path).with_context(|| format!("failed to open {}", path.display()))
}

pub async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Command::Run(args) => {
            let cfg = build_config(args, cli.verbose)?;
            let store = open_store(&cli)?;
            let argv: Vec<String> = std::env::args().skip(1).collect();
            let (run_id, store) = crate::orchestrator::run_benchmark(&cfg, store, &argv).await?;
            if !args.quiet {
                print_run(&store, run_id, false)?;
            }
            Ok(())
        }
        Command::Show(args) => {
            let store = open_store(&cli)?;
            show(&store, args)
        }
    }
}

fn show(store: &SqliteStore, args: &ShowArgs) -> Result<()> {
    let Some(run_id) = args.run_id else {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for run in store.list_runs()? {
            writeln!(out, "{}", crate::text_summary::run_line(&run))?;
        }
        return Ok(());
    };

    if args.csv {
        return storage::export_csv(std::io::stdout().lock(), &store.load_batches(run_id)?);
    }
    if args.json {
        let export = storage::load_export(store, run_id, args.all)?;
        return storage::export_json(std::io::stdout().lock(), &export);
    }
    print_run(store, run_id, args.all)
}

fn print_run(store: &SqliteStore, run_id: i64, with_records: bool) -> Result<()> {
    let export = storage::load_export(store, run_id, with_records)?;
    let summary = crate::text_summary::build_text_summary(&export);
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for line in summary.lines {
        writeln!(out, "{line}")?;
    }
    Ok(())
}
