//! wareline - extract, normalize and load paginated sources into a warehouse
//!
//! Pulls a music catalog playlist, development statistics or a local
//! measurement feed, splits records into fact and dimension tables and
//! loads them idempotently into DuckDB.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use wareline_core::{CancelToken, ProgressContext, TransactionScope};

mod cmd;
mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "wareline")]
#[command(about = "Paginated source → warehouse ETL pipeline")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Config file path (default: ./wareline.toml or ~/.config/wareline/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Append a timestamped copy of the log to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Rows per sink batch
    #[arg(long, global = true)]
    batch_size: Option<usize>,

    /// Maximum attempts per page for transient failures
    #[arg(long, global = true)]
    max_attempts: Option<u32>,

    /// Unit of atomicity for warehouse writes
    #[arg(long, global = true, value_enum)]
    scope: Option<ScopeArg>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ScopeArg {
    /// One transaction per entity set
    EntitySet,
    /// One transaction per batch
    Batch,
}

impl From<ScopeArg> for TransactionScope {
    fn from(arg: ScopeArg) -> Self {
        match arg {
            ScopeArg::EntitySet => Self::EntitySet,
            ScopeArg::Batch => Self::Batch,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Extract from a source and load into the warehouse
    Run(cmd::run::RunArgs),
    /// Re-run the pipeline over an archived run's raw pages
    Replay(cmd::replay::ReplayArgs),
    /// Load canonical NDJSON written by `run --canonical-out`
    Load(cmd::load::LoadArgs),
    /// Show current configuration
    Config,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Progress context (TTY auto-detect)
    let progress = Arc::new(ProgressContext::new());

    // Logging:
    //   TTY:     quiet (warn) unless --debug; stage lines show activity
    //   non-TTY: info unless --debug
    let is_tty = progress.is_tty();
    let multi = if is_tty { Some(progress.multi()) } else { None };
    let quiet = if is_tty { !cli.debug } else { false };
    wareline_core::init_logging(quiet, cli.debug, multi, cli.log_file.as_deref())
        .context("Failed to initialise logging")?;

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    if let Some(n) = cli.batch_size {
        config.pipeline.batch_size = n;
    }
    if let Some(n) = cli.max_attempts {
        config.pipeline.retry.max_attempts = n;
    }
    if let Some(scope) = cli.scope {
        config.pipeline.transaction_scope = scope.into();
    }

    let ctx = cmd::Context {
        config,
        progress,
        cancel: CancelToken::new(),
    };

    match cli.command {
        Command::Run(args) => {
            setup_signal_handler(&ctx.cancel)?;
            cmd::run::run(args, &ctx)
        }
        Command::Replay(args) => {
            setup_signal_handler(&ctx.cancel)?;
            cmd::replay::run(args, &ctx)
        }
        Command::Load(args) => {
            setup_signal_handler(&ctx.cancel)?;
            cmd::load::run(args, &ctx)
        }
        Command::Config => {
            cmd::print_config(&ctx.config);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// First signal cancels the run cooperatively; a second one exits at once.
fn setup_signal_handler(cancel: &CancelToken) -> Result<()> {
    use std::sync::atomic::Ordering;

    for signal in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        let flag = cancel.flag();
        // SAFETY: AtomicBool::swap and process::exit are async-signal-safe
        let registered = unsafe {
            signal_hook::low_level::register(signal, move || {
                if flag.swap(true, Ordering::Relaxed) {
                    std::process::exit(130);
                }
            })
        };
        registered.with_context(|| format!("Failed to register handler for signal {signal}"))?;
    }
    Ok(())
}
