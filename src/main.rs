use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use cloudrec_agent::config::{Options, Overrides};
use cloudrec_agent::control::{ControlPlane, HttpControlPlane, LogEntry, Session};
use cloudrec_agent::executor::{run_executors, Executor};
use cloudrec_agent::oplog::{forward_remote_logs, AttentionMatcher, OperationalLogger, RemoteLogLayer};
use cloudrec_agent::platform::Platform;
use cloudrec_agent::{demo, VERSION};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

/// Multi-cloud resource inventory agent
#[derive(Parser, Debug)]
#[command(name = "cloudrec-agent", version, about, long_about = None)]
struct Args {
    /// Config file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// One-time registration token
    #[arg(long)]
    access_token: Option<String>,

    /// Control plane base URL
    #[arg(long)]
    server_url: Option<String>,

    /// Collect every account once and exit
    #[arg(long, conflicts_with = "continuous")]
    run_once: bool,

    /// Keep collecting on the cron schedule
    #[arg(long)]
    continuous: bool,

    /// Platforms to run in this process
    #[arg(short, long, value_enum, default_values_t = [PlatformKind::Demo])]
    platform: Vec<PlatformKind>,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        let run_only_once = if self.run_once {
            Some(true)
        } else if self.continuous {
            Some(false)
        } else {
            None
        };
        Overrides {
            access_token: self.access_token.clone(),
            server_url: self.server_url.clone(),
            run_only_once,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PlatformKind {
    /// Built-in platform with synthetic collectors
    Demo,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Option<Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

/// Open `path` for appending, creating missing parent directories
fn open_log_file(path: &Path) -> Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

/// Local log output plus the remote operational log layer. The remote layer
/// sees ERROR events even when local logging is off.
fn setup_logging(
    level: LogLevel,
    log_file: Option<&Path>,
) -> Result<(
    tracing_appender::non_blocking::WorkerGuard,
    UnboundedReceiver<LogEntry>,
)> {
    let (remote, _sent, remote_rx) = RemoteLogLayer::new();

    let (writer, guard) = match log_file {
        Some(path) => tracing_appender::non_blocking(open_log_file(path)?),
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    // RUST_LOG wins over --log-level
    let level = match level.to_tracing_level() {
        Some(level) => LevelFilter::from_level(level),
        None => LevelFilter::OFF,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(level.into()));

    let local = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(log_file.is_none())
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_filter(filter);

    tracing_subscriber::registry().with(local).with(remote).init();

    Ok((guard, remote_rx))
}

fn build_platform(kind: PlatformKind, options: &Options) -> Result<Arc<Platform>> {
    let config = match kind {
        PlatformKind::Demo => {
            let mut defaults = options.default_accounts.clone();
            if defaults.is_empty() && options.access_token().is_none() {
                defaults.push(demo::default_account());
            }
            demo::platform_config(defaults)
        }
    };
    let platform = Platform::new(config, options.tuning())
        .with_context(|| format!("Invalid platform {:?}", kind))?;
    Ok(Arc::new(platform))
}

fn build_client(options: &Options, platform: &str) -> Result<Option<Arc<dyn ControlPlane>>> {
    let Some(token) = options.access_token() else {
        return Ok(None);
    };
    let session = Session::new(&options.agent_name, Some(token.to_string()));
    let client = HttpControlPlane::new(&options.server_url, platform, options.sites.clone(), session)?;
    Ok(Some(Arc::new(client)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (_log_guard, remote_rx) = setup_logging(args.log_level, args.log_file.as_deref())?;
    tracing::info!("cloudrec-agent {} started with log level: {:?}", VERSION, args.log_level);

    let mut options = Options::load(args.config.as_deref())?;
    options.apply(args.overrides());
    options.validate()?;

    if options.access_token().is_none() {
        tracing::info!("No access token configured, running unregistered");
    }

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl-C, shutting down");
            on_signal.cancel();
        }
    });

    let oplog = OperationalLogger::new(AttentionMatcher::new(options.attention_error_texts.clone()));
    let mut remote_rx = Some(remote_rx);
    let mut executors = Vec::new();
    for kind in &args.platform {
        let platform = build_platform(*kind, &options)?;
        let client = build_client(&options, platform.name())?;

        // One control plane receives the operational logs
        if let Some(client) = &client {
            if let Some(rx) = remote_rx.take() {
                tokio::spawn(forward_remote_logs(rx, client.clone()));
            }
        }

        executors.push(
            Executor::new(platform, client, oplog.clone(), options.executor_options())
                .with_shutdown(shutdown.clone()),
        );
    }

    // Nobody forwards operational logs without a control plane
    drop(remote_rx);

    let errors = run_executors(executors).await;
    match errors.into_iter().next() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
