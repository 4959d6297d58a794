mod config;
mod convert;
mod fetch;
mod progress;
mod prompt;
mod reconcile;
mod remote;
mod row;
mod store;
mod sync;

use std::future::pending;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use crossterm::tty::IsTty;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use config::{Overrides, SyncConfig};
use progress::{BarProgress, LogProgress, Progress, Silent};
use remote::carddav::CardDavDirectory;
use sync::{Session, SyncError, SyncOptions, SyncReport};

const EXIT_FATAL: u8 = 1;
const EXIT_DEGRADED: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

/// Fetch a CardDAV address book into a tab-separated contacts file.
#[derive(Parser, Debug)]
#[command(name = "carddav-tsv", version)]
struct Cli {
    /// Address book URL (or server root with --address-book)
    #[arg(value_name = "URL")]
    url: Option<String>,

    #[arg(short, long)]
    user: Option<String>,

    /// Password; prompted for when not given here or in the config file
    #[arg(short, long)]
    password: Option<String>,

    /// Use HTTP digest authentication instead of basic
    #[arg(long, default_value_t = false)]
    digest: bool,

    /// Accept any server certificate
    #[arg(long, default_value_t = false)]
    no_cert_verify: bool,

    /// Contacts file (default: ~/contacts.tsv)
    #[arg(short, long, value_name = "FILE")]
    file: Option<PathBuf>,

    /// Discover the address book with this name under URL
    #[arg(long, value_name = "NAME")]
    address_book: Option<String>,

    /// Config file (default: <config dir>/carddav-tsv/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Ignore the existing contacts file and write only remote contacts
    #[arg(long, default_value_t = false)]
    fresh: bool,

    /// On Ctrl-C, merge and write the contacts fetched so far
    #[arg(long, default_value_t = false)]
    allow_partial: bool,

    /// Exit with status 2 when any card could not be fetched or converted
    #[arg(long, default_value_t = false)]
    strict: bool,

    /// Number of fetch requests in flight
    #[arg(long, short = 'j', value_name = "N")]
    concurrency: Option<usize>,

    /// Cards per fetch request
    #[arg(long, value_name = "N")]
    batch_size: Option<usize>,

    /// Network timeout in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    #[arg(long, default_value_t = false)]
    no_progress: bool,

    /// More log output (-v, -vv)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, default_value_t = false, conflicts_with = "verbose")]
    quiet: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            url: self.url.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            digest: self.digest,
            no_cert_verify: self.no_cert_verify,
            file: self.file.clone(),
            address_book: self.address_book.clone(),
            timeout_secs: self.timeout,
            concurrency: self.concurrency,
            batch_size: self.batch_size,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match run(&cli) {
        Ok(report) => {
            report.print_summary();
            if cli.strict && report.is_degraded() {
                ExitCode::from(EXIT_DEGRADED)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            let interrupted = matches!(
                err.downcast_ref::<SyncError>(),
                Some(SyncError::Interrupted { .. })
            );
            if interrupted {
                ExitCode::from(EXIT_INTERRUPTED)
            } else {
                ExitCode::from(EXIT_FATAL)
            }
        }
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, _) => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

fn run(cli: &Cli) -> Result<SyncReport> {
    let config = config::resolve(cli.overrides(), cli.config.as_deref(), prompt::read_password)?;
    debug!(
        url = %config.url,
        user = %config.user,
        file = %config.file_path.display(),
        "resolved configuration"
    );

    let options = SyncOptions {
        fresh: cli.fresh,
        allow_partial: cli.allow_partial,
        fetch: config.fetch_options(),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;
    let report = runtime.block_on(sync_remote(&config, options, progress_sink(cli)))?;
    Ok(report)
}

fn progress_sink(cli: &Cli) -> Box<dyn Progress> {
    if cli.quiet {
        Box::new(Silent)
    } else if !cli.no_progress && io::stderr().is_tty() {
        Box::new(BarProgress::new())
    } else {
        Box::new(LogProgress)
    }
}

async fn sync_remote(
    config: &SyncConfig,
    options: SyncOptions,
    progress: Box<dyn Progress>,
) -> Result<SyncReport, SyncError> {
    let interrupt = interrupted();
    tokio::pin!(interrupt);
    // The first poll installs the Ctrl-C handler; it must be in place
    // before the lock file exists.
    if futures::poll!(interrupt.as_mut()).is_ready() {
        return Err(SyncError::Interrupted {
            handled: 0,
            total: 0,
        });
    }

    // Claim and read the local file before touching the network.
    let session = Session::prepare(&config.file_path, options)?;

    let directory = tokio::select! {
        biased;
        _ = interrupt.as_mut() => {
            return Err(SyncError::Interrupted {
                handled: 0,
                total: 0,
            });
        }
        directory = CardDavDirectory::connect(config) => directory?,
    };
    session.run(&directory, progress.as_ref(), interrupt).await
}

/// Resolves on Ctrl-C. Never resolves if the handler cannot be installed.
async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        pending::<()>().await;
    }
}
