//! rowbatch - batch reads, bulk writes and row inspection against a row store
//!
//! Usage:
//!   rowbatch [--store <path>] [--config <file>] [-v] <command> ...
//!   rowbatch read <table> <batch_size> <use_threads> [thread_count]
//!   rowbatch write <table> <family> <num_rows> <num_columns> [--seed N] [--threads N]
//!   rowbatch row-size <table> <row_key>
//!   rowbatch list-qualifiers <table> <family> [pattern] [row_key_prefix]
//!
//! The store is a JSON snapshot file loaded at start and written back when
//! the handle is closed.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use anyhow::{ensure, Context};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rowbatch::batch::{CancellationToken, ExecutionMode};
use rowbatch::inspect;
use rowbatch::resource::ResourceManager;
use rowbatch::{
    AggregateResult, BatchEngine, EngineConfig, KeyStrategy, MemoryRowStore, PayloadSpec,
    RowFilter, RowKey, StoreHandle, WriteSpec,
};

const DEFAULT_STORE: &str = "rowbatch-store.json";

#[derive(Parser, Debug)]
#[command(name = "rowbatch", version, about = "Batch row access for wide-column row stores")]
struct Cli {
    /// Store snapshot file (created on first write).
    #[arg(long, global = true, default_value = DEFAULT_STORE)]
    store: PathBuf,

    /// JSON engine config overlaid on the defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug-level logging (RUST_LOG takes precedence).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read a key set in batches.
    Read(ReadArgs),
    /// Generate and bulk-write rows.
    Write(WriteArgs),
    /// Print the stored size of one row.
    RowSize {
        table: String,
        row_key: String,
    },
    /// List distinct qualifiers per row within a column family.
    ListQualifiers {
        table: String,
        family: String,
        /// Qualifier regex, matched against the whole qualifier.
        pattern: Option<String>,
        row_key_prefix: Option<String>,
    },
}

#[derive(Args, Debug)]
struct ReadArgs {
    table: String,

    /// Keys per batch.
    batch_size: usize,

    /// `true` runs batches on a worker pool.
    #[arg(action = clap::ArgAction::Set)]
    use_threads: bool,

    /// Worker count when threaded (default: CPU count, capped at 16).
    thread_count: Option<usize>,

    /// File with one row key per line.
    #[arg(long, conflicts_with = "key_count")]
    keys_file: Option<PathBuf>,

    /// Generate keys `row-000 .. row-{N-1}`.
    #[arg(long, default_value_t = 100)]
    key_count: usize,

    /// How long to wait for outstanding workers.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Restrict results to one column family.
    #[arg(long)]
    family: Option<String>,

    /// Print the summary as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct WriteArgs {
    table: String,
    family: String,
    num_rows: usize,
    num_columns: usize,

    #[arg(long, default_value_t = 200)]
    min_bytes: usize,

    #[arg(long, default_value_t = 500)]
    max_bytes: usize,

    /// Rows per batch (default from config).
    #[arg(long)]
    batch_size: Option<usize>,

    /// Run batches on this many workers.
    #[arg(long)]
    threads: Option<usize>,

    /// Derive row keys and payload lengths from this seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Create the table if it does not exist.
    #[arg(long)]
    create_table: bool,

    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "rowbatch=debug" } else { "rowbatch=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .init();
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::auto_tuned(),
    };

    let store = Arc::new(
        MemoryRowStore::open(&cli.store)
            .with_context(|| format!("opening store {}", cli.store.display()))?,
    );

    match cli.cmd {
        Command::Read(args) => {
            config.batch_size = args.batch_size;
            config.mode = execution_mode(args.use_threads, args.thread_count);
            if let Some(ms) = args.timeout_ms {
                config.termination_timeout_ms = ms;
            }
            let keys = match &args.keys_file {
                Some(path) => load_keys(path)?,
                None => generated_keys(args.key_count),
            };
            let filter = match args.family {
                Some(family) => RowFilter::default().family(family),
                None => RowFilter::default(),
            };

            let engine = BatchEngine::new(config)?.with_cancellation(cancel_on_signal()?);
            let handle = StoreHandle::new(store);
            let result = engine.read(handle.client(), &args.table, &keys, filter)?;
            handle.close()?;
            print_summary("read", &result, args.json)
        }
        Command::Write(args) => {
            if let Some(size) = args.batch_size {
                config.batch_size = size;
            }
            if args.threads.is_some() {
                config.mode = execution_mode(true, args.threads);
            }
            if args.create_table && !store.has_table(&args.table) {
                store.create_table(&args.table);
            }

            let mut spec = WriteSpec::new(args.family, args.num_rows, args.num_columns);
            spec.payload = PayloadSpec::new(args.min_bytes, args.max_bytes)?;
            if let Some(seed) = args.seed {
                spec.keys = KeyStrategy::Deterministic { seed };
                spec.payload_seed = Some(seed);
            }

            let engine = BatchEngine::new(config)?.with_cancellation(cancel_on_signal()?);
            let handle = StoreHandle::new(store);
            let result = engine.write(handle.client(), &args.table, &spec)?;
            handle.close()?;
            print_summary("write", &result, args.json)
        }
        Command::RowSize { table, row_key } => {
            let handle = StoreHandle::new(store);
            let size = inspect::row_size(handle.client().as_ref(), &table, &RowKey::from(row_key))?;
            handle.close()?;
            println!(
                "row {}: {} cells, {} bytes",
                size.row_key, size.cell_count, size.total_bytes
            );
            Ok(())
        }
        Command::ListQualifiers {
            table,
            family,
            pattern,
            row_key_prefix,
        } => {
            let handle = StoreHandle::new(store);
            let rows = inspect::list_qualifiers(
                handle.client().as_ref(),
                &table,
                &family,
                pattern.as_deref(),
                row_key_prefix.as_deref(),
            )?;
            handle.close()?;
            for row in rows {
                println!("{}: {}", row.row_key, row.qualifiers.join(", "));
            }
            Ok(())
        }
    }
}

fn execution_mode(use_threads: bool, thread_count: Option<usize>) -> ExecutionMode {
    if !use_threads {
        return ExecutionMode::Sequential;
    }
    let workers = thread_count.unwrap_or_else(|| ResourceManager::auto_tune().default_workers);
    ExecutionMode::Parallel { workers }
}

fn generated_keys(count: usize) -> Vec<RowKey> {
    (0..count).map(|i| RowKey::from(format!("row-{:03}", i))).collect()
}

fn load_keys(path: &Path) -> anyhow::Result<Vec<RowKey>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading keys from {}", path.display()))?;
    let keys: Vec<RowKey> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(RowKey::from)
        .collect();
    ensure!(!keys.is_empty(), "no row keys in {}", path.display());
    Ok(keys)
}

/// SIGINT/SIGTERM cancel batches that have not started yet.
fn cancel_on_signal() -> anyhow::Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut signals = signal_hook::iterator::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ])
    .context("registering signal handlers")?;

    let cancel = token.clone();
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            tracing::warn!("received signal {}, cancelling outstanding batches", sig);
            cancel.cancel();
        }
    });
    Ok(token)
}

fn print_summary(operation: &str, result: &AggregateResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    println!("=== {} summary ===", operation);
    println!("Rows processed:     {}", result.rows_processed);
    println!("Cells processed:    {}", result.cells_processed);
    if result.cells_rejected > 0 {
        println!("Cells rejected:     {}", result.cells_rejected);
    }
    println!(
        "Batches:            {} succeeded, {} failed",
        result.batches_succeeded, result.batches_failed
    );
    println!("Elapsed:            {} ms", result.elapsed_ms);

    for failure in &result.batch_errors {
        println!("  batch {} failed: {}", failure.batch_index + 1, failure.cause);
    }
    if let Some(partial) = &result.partial_failure {
        println!("  {}", partial.summary);
        for key in partial.failed_rows() {
            println!("  unconfirmed row: {}", key);
        }
    }
    if let Some(timeout) = &result.timeout {
        println!(
            "  timed out after {} ms with batches {:?} outstanding",
            timeout.waited_ms, timeout.outstanding_batches
        );
    }
    if !result.skipped_batches.is_empty() {
        println!("  cancelled before dispatch: batches {:?}", result.skipped_batches);
    }

    println!("Keys ({}):", result.keys.len());
    for key in &result.keys {
        println!("  {}", key);
    }
    Ok(())
}
