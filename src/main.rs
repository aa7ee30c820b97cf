use clap::Parser;
use tracing::info;

use catenis_emulator::cli::{self, Cli};
use catenis_emulator::logging;
use catenis_emulator::server::startup::{run_emulator, EmulatorConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.shutdown {
        return cli::request_shutdown(cli.cmd_port).await;
    }

    init_logging_from_env()?;

    let config = EmulatorConfig::new(cli.api_port, cli.cmd_port, cli.api_version);
    let mut handle = run_emulator(config).await?;

    info!("Catenis API Emulator v{}", env!("CARGO_PKG_VERSION"));
    info!("API server listening on {}", handle.api_addr());
    info!("Command server listening on {}", handle.cmd_addr());

    let closed_by_command = tokio::select! {
        _ = handle.wait_closed() => true,
        reason = await_shutdown_trigger() => {
            info!("Shutdown signal received ({})", reason);
            false
        }
    };

    if closed_by_command {
        info!("Emulator closed by command");
    } else {
        handle.shutdown().await;
    }
    info!("Emulator shut down");
    Ok(())
}

/// Initialize logging based on the CATENIS_EMULATOR_DEV environment variable.
fn init_logging_from_env() -> Result<(), Box<dyn std::error::Error>> {
    let log_config = if std::env::var("CATENIS_EMULATOR_DEV")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
    {
        logging::LogConfig::development()
    } else {
        logging::LogConfig::production()
    };
    logging::init_logging(log_config)
}

/// Wait for either Ctrl+C or SIGTERM (Unix only) and return a label for logging.
#[cfg(unix)]
async fn await_shutdown_trigger() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(err) => {
            tracing::warn!(
                "Failed to install SIGTERM handler: {}; falling back to Ctrl+C only",
                err
            );
            match tokio::signal::ctrl_c().await {
                Ok(()) => "ctrl-c",
                Err(err) => {
                    panic!("Failed to install Ctrl+C handler: {}", err);
                }
            }
        }
    }
}

/// On non-Unix platforms, only Ctrl+C is available.
#[cfg(not(unix))]
async fn await_shutdown_trigger() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "ctrl-c",
        Err(err) => {
            panic!("Failed to install Ctrl+C handler: {}", err);
        }
    }
}
