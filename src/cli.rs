//! Command-line options and the remote shutdown client.
//!
//! Uses clap derive. Running without `--shutdown` starts the emulator;
//! `--shutdown` instead probes a running instance over its command port and
//! asks it to close.

use clap::Parser;
use tracing::info;

pub const DEFAULT_API_PORT: u16 = 3500;
pub const DEFAULT_CMD_PORT: u16 = 3501;
pub const DEFAULT_API_VERSION: &str = "0.13";

/// Programmable test double for the Catenis REST + WebSocket API.
#[derive(Parser, Debug)]
#[command(
    name = "catenis-emulator",
    version = env!("CARGO_PKG_VERSION"),
    about = "Catenis API Emulator — a programmable test double"
)]
pub struct Cli {
    /// Port the emulated Catenis API listens on.
    #[arg(long, default_value_t = DEFAULT_API_PORT)]
    pub api_port: u16,

    /// Port the control-plane command server listens on.
    #[arg(long, default_value_t = DEFAULT_CMD_PORT)]
    pub cmd_port: u16,

    /// Catenis API version segment used in URL paths.
    #[arg(long, default_value = DEFAULT_API_VERSION)]
    pub api_version: String,

    /// Shut down a running emulator instance instead of starting one.
    #[arg(long)]
    pub shutdown: bool,
}

/// Ask a running instance to close: confirm it really is an emulator via
/// `GET /info`, then issue `POST /close`.
pub async fn request_shutdown(cmd_port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let base = format!("http://127.0.0.1:{cmd_port}");
    let client = reqwest::Client::new();

    let info: String = client
        .get(format!("{base}/info"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    if !info.starts_with("Catenis API Emulator") {
        return Err(format!("unexpected service on port {cmd_port}: {info}").into());
    }

    client
        .post(format!("{base}/close"))
        .send()
        .await?
        .error_for_status()?;
    info!("emulator on port {cmd_port} asked to close");
    Ok(())
}
