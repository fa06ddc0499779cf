use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use natbridge_core::Config;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Bidirectional NAT-traversing port-forwarding tunnel.
#[derive(Parser, Debug)]
#[command(name = "natbridge", version, about)]
struct Cli {
    /// Path to the config file (YAML or JSON, sniffed by extension).
    #[arg(short, long, default_value = "config.yml")]
    config: PathBuf,
}

fn install_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("natbridge: {e}");
            return ExitCode::FAILURE;
        }
    };

    install_logging(&config.log_level);

    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received, cancelling in-flight work");
        shutdown_cancel.cancel();
    });

    let coordinator = natbridge_core::Coordinator::new(config);
    match coordinator.run(cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "natbridge exited with an error");
            ExitCode::FAILURE
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
