//! cfgbuild
//!
//! Builds system and home configurations with live progress, compares them
//! against the running generation and activates them, locally or on a
//! remote host over SSH.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use console::style;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cfgbuild_core::exec::{Executor, LocalExecutor, SshExecutor};
use cfgbuild_core::Settings;

mod copy;
mod home;
mod os;

#[derive(Parser)]
#[command(name = "cfgbuild", version, about = "Build, compare and activate configurations")]
struct Cli {
    /// Print build logs and per-item progress
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Work with NixOS configurations
    Os {
        #[command(subcommand)]
        command: os::OsCommand,
    },

    /// Work with Home Manager configurations
    Home {
        #[command(subcommand)]
        command: home::HomeCommand,
    },

    /// Copy a path and its closure to another host
    Copy(copy::CopyArgs),
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // stdout is reserved for output paths
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::WARN.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    let token = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown(token.clone()));

    if let Err(err) = run(cli, token).await {
        eprintln!("{} {:#}", style("error:").red().bold().for_stderr(), err);

        let code = err
            .downcast_ref::<cfgbuild_core::Error>()
            .map_or(1, cfgbuild_core::Error::exit_code);
        std::process::exit(code);
    }
}

async fn run(cli: Cli, token: CancellationToken) -> anyhow::Result<()> {
    let mut settings = Settings::load()?;
    settings.verbose |= cli.verbose;

    match cli.command {
        Commands::Os { command } => os::run(settings, token, command).await,
        Commands::Home { command } => home::run(settings, token, command).await,
        Commands::Copy(args) => copy::run(settings, token, args).await,
    }
}

/// Print a workflow step header
pub(crate) fn print_section(text: &str) {
    eprintln!("{} {}", style(">").green().for_stderr(), text);
}

/// Executor for a target host, or this machine when there is none
pub(crate) struct Remote {
    ssh: Option<Arc<SshExecutor>>,
    executor: Arc<dyn Executor>,
}

impl Remote {
    /// Connect to the target, giving up as soon as the token is cancelled
    pub(crate) async fn connect(
        settings: &Settings,
        token: &CancellationToken,
        target: Option<&str>,
    ) -> anyhow::Result<Self> {
        let Some(target) = target else {
            return Ok(Self {
                ssh: None,
                executor: Arc::new(LocalExecutor::new()),
            });
        };

        let ssh = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Connection to {} abandoned", target);
                return Err(cfgbuild_core::Error::Cancelled.into());
            }
            ssh = SshExecutor::connect(settings, target) => Arc::new(ssh?),
        };
        Ok(Self {
            executor: ssh.clone(),
            ssh: Some(ssh),
        })
    }

    pub(crate) fn executor(&self) -> Arc<dyn Executor> {
        self.executor.clone()
    }

    pub(crate) async fn disconnect(self) {
        if let Some(ssh) = self.ssh {
            if let Err(e) = ssh.disconnect().await {
                debug!("Failed to disconnect cleanly: {}", e);
            }
        }
    }
}

async fn cancel_on_shutdown(token: CancellationToken) {
    shutdown_signal().await;
    debug!("Shutdown requested, cancelling running commands");
    token.cancel();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
