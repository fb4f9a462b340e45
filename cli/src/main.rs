//! Tether CLI: run one configured tool for a project and talk to it.
//!
//! Each line read from stdin is sent as a request over the service's current
//! channel and the reply is printed to stdout. The tool is relaunched behind
//! the scenes when it dies; a request caught by a relaunch is retried once on
//! the replacement channel.
//!
//! ```text
//! stdin -> relay() -> Service::channel() -> LineChannel::request() -> stdout
//! ```

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tether_config::TetherConfig;
use tether_supervisor::{
    Channel, ChannelError, ChannelId, LineChannel, LineChannelFactory, ProjectKey,
    ProjectServices, Service, Unavailable, UpdateQueue, queued,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Supervise a configured tool and relay stdin lines to it")]
struct Cli {
    /// Configuration file (default: ~/.tether/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Project root the tool runs in
    #[arg(long, default_value = ".")]
    project: PathBuf,
    /// Service name from the configuration
    service: String,
}

/// The file logs are appended to.
struct LogFile {
    path: PathBuf,
    file: fs::File,
}

/// Logs go to a file or nowhere: replies own stdout, and a tool configured
/// with inherited stderr writes there.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (log, skipped) = open_log(&log_paths());

    let Some(LogFile { path, file }) = log else {
        tracing_subscriber::registry().with(filter).init();
        return;
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        .with(filter)
        .init();

    tracing::info!(path = %path.display(), "tether logging to file");
    for (unusable, err) in skipped {
        tracing::warn!(path = %unusable.display(), "skipped log location: {err}");
    }
}

/// Open the first candidate that can be appended to. Candidates passed over
/// on the way are returned with the reason.
fn open_log(candidates: &[PathBuf]) -> (Option<LogFile>, Vec<(PathBuf, io::Error)>) {
    let mut skipped = Vec::new();
    for path in candidates {
        let opened = path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| OpenOptions::new().create(true).append(true).open(path));
        match opened {
            Ok(file) => {
                let log = LogFile {
                    path: path.clone(),
                    file,
                };
                return (Some(log), skipped);
            }
            Err(err) => skipped.push((path.clone(), err)),
        }
    }
    (None, skipped)
}

/// `logs/tether.log` beside the config file, then under `./.tether`.
fn log_paths() -> Vec<PathBuf> {
    let beside_config = TetherConfig::path()
        .and_then(|config| config.parent().map(|dir| dir.join("logs")));
    beside_config
        .into_iter()
        .chain([PathBuf::from(".tether").join("logs")])
        .map(|dir| dir.join("tether.log"))
        .collect()
}

fn load_config(path: Option<&Path>) -> Result<TetherConfig> {
    match path {
        Some(path) => Ok(TetherConfig::load_from(path)?),
        None => Ok(TetherConfig::load()?.unwrap_or_default()),
    }
}

enum Outcome {
    Reply(String),
    Failed(ChannelError),
    Unavailable(Unavailable),
}

/// Wait until the service has a live channel other than `not`.
///
/// Updates are only used as wake-ups; the service is the source of truth.
async fn next_channel(
    service: &Service<LineChannelFactory>,
    updates: &mut UpdateQueue<LineChannel>,
    not: Option<ChannelId>,
) -> Result<Arc<LineChannel>, Unavailable> {
    loop {
        match service.channel() {
            Ok(channel) if Some(channel.id()) != not && !channel.is_invalidated() => {
                return Ok(channel);
            }
            Ok(_) | Err(Unavailable::NotStarted | Unavailable::Starting) => {}
            Err(reason) => return Err(reason),
        }
        if updates.recv().await.is_none() {
            return Err(Unavailable::Stopped);
        }
    }
}

async fn relay(
    service: &Service<LineChannelFactory>,
    updates: &mut UpdateQueue<LineChannel>,
    line: &str,
) -> Outcome {
    let channel = match next_channel(service, updates, None).await {
        Ok(channel) => channel,
        Err(reason) => return Outcome::Unavailable(reason),
    };

    match channel.request(line).await {
        Ok(reply) => Outcome::Reply(reply),
        Err(ChannelError::Invalidated(id)) => {
            tracing::debug!(channel = %id, "channel replaced during request, retrying");
            match next_channel(service, updates, Some(id)).await {
                Ok(next) => match next.request(line).await {
                    Ok(reply) => Outcome::Reply(reply),
                    Err(err) => Outcome::Failed(err),
                },
                Err(reason) => Outcome::Unavailable(reason),
            }
        }
        Err(err) => Outcome::Failed(err),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(cli.config.as_deref())?;
    let Some(service_config) = config.service(&cli.service) else {
        let known = config.service_names().join(", ");
        bail!(
            "no service named '{}' is configured (known: {})",
            cli.service,
            if known.is_empty() { "none" } else { known.as_str() }
        );
    };

    let root = fs::canonicalize(&cli.project)
        .with_context(|| format!("project directory {} not found", cli.project.display()))?;
    let descriptor = service_config
        .to_descriptor(&root, config.inherit_stderr())
        .with_context(|| format!("invalid configuration for service '{}'", cli.service))?;
    tracing::info!(
        service = %cli.service,
        project = %root.display(),
        command = %descriptor.display_command(),
        "starting session"
    );

    let projects = ProjectServices::new();
    let policy = config.restart_policy();
    let service = projects.get_or_create(&ProjectKey::new(&root), |_| {
        Service::new(cli.service.as_str(), descriptor, LineChannelFactory, policy)
    });
    let (observer, mut updates) = queued::<LineChannel>();
    let _subscription = service.attach(observer);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut ended = None;

    loop {
        let line = tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("interrupted");
                break;
            }
            line = lines.next_line() => line.context("failed to read stdin")?,
        };
        let Some(line) = line else {
            tracing::info!("stdin closed");
            break;
        };

        let outcome = tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("interrupted");
                break;
            }
            outcome = relay(&service, &mut updates, &line) => outcome,
        };
        match outcome {
            Outcome::Reply(reply) => {
                stdout.write_all(reply.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            Outcome::Failed(err) => {
                tracing::warn!(service = %cli.service, "request failed: {err}");
                eprintln!("tether: request failed: {err}");
            }
            Outcome::Unavailable(reason) => {
                ended = Some(reason);
                break;
            }
        }
    }

    projects.shutdown().await;
    if let Some(reason) = ended {
        bail!("service '{}' unavailable: {reason}", cli.service);
    }
    Ok(())
}
