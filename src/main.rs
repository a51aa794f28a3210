use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use ssh_portal::{bus, config, sshd, sshtoken};

#[derive(Parser)]
#[command(name = "ssh-portal", version, about = "SSH access gateway for Lagoon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the edge SSH server inside a Lagoon cluster
    Sshd,
    /// Run the authorization policy service
    Sshapi,
    /// Run the token-issuing SSH server
    Sshtokend,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_env("SSH_PORTAL_LOG").unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().json())
        .init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let cli = Cli::parse();

    // Root cancellation: SIGTERM and Ctrl+C both stop the service; Ctrl+C
    // maps to the conventional 130 exit status.
    let shutdown = CancellationToken::new();
    let signal_task = tokio::spawn(shutdown_signal(shutdown.clone()));

    match cli.command {
        Command::Sshd => sshd::run(config::SshdConfig::load(), shutdown.clone()).await?,
        Command::Sshapi => bus::server::run(config::SshapiConfig::load(), shutdown.clone()).await?,
        Command::Sshtokend => {
            sshtoken::run(config::SshtokendConfig::load(), shutdown.clone()).await?;
        }
    }

    // The service may have stopped on its own; a still-pending signal task
    // aborts to Err, which reads as a normal exit.
    signal_task.abort();
    let interrupted = matches!(signal_task.await, Ok(ShutdownCause::Interrupt));
    tracing::info!("ssh-portal stopped");
    Ok(if interrupted {
        ExitCode::from(130)
    } else {
        ExitCode::SUCCESS
    })
}

enum ShutdownCause {
    Interrupt,
    Terminate,
}

async fn shutdown_signal(shutdown: CancellationToken) -> ShutdownCause {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let cause = tokio::select! {
        () = ctrl_c => ShutdownCause::Interrupt,
        () = terminate => ShutdownCause::Terminate,
    };

    tracing::info!("shutdown signal received");
    shutdown.cancel();
    cause
}
