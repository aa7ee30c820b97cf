//! Emulator startup and lifecycle.
//!
//! [`EmulatorConfig`] assembles both listeners; [`run_emulator`] binds them
//! and returns an [`EmulatorHandle`] exposing the actual bound addresses and
//! a clean shutdown path. Integration tests rely on binding port 0 to get
//! an ephemeral port per test.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::context::EmulatorState;
use crate::server::api::{self, ApiState};
use crate::server::command::{self, CommandState};
use crate::server::ws::{self, NotifyState, NotifyTimings};

/// Everything needed to start an emulator instance.
pub struct EmulatorConfig {
    pub api_addr: SocketAddr,
    pub cmd_addr: SocketAddr,
    pub api_version: String,
    pub timings: NotifyTimings,
}

impl EmulatorConfig {
    pub fn new(api_port: u16, cmd_port: u16, api_version: impl Into<String>) -> Self {
        Self {
            api_addr: SocketAddr::from(([127, 0, 0, 1], api_port)),
            cmd_addr: SocketAddr::from(([127, 0, 0, 1], cmd_port)),
            api_version: api_version.into(),
            timings: NotifyTimings::default(),
        }
    }

    /// Ephemeral ports on loopback, suitable for integration tests.
    pub fn for_testing() -> Self {
        Self::new(0, 0, "0.13")
    }

    pub fn with_timings(mut self, timings: NotifyTimings) -> Self {
        self.timings = timings;
        self
    }
}

/// Handle to a running emulator. Returned by [`run_emulator`].
pub struct EmulatorHandle {
    api_addr: SocketAddr,
    cmd_addr: SocketAddr,
    api_shutdown: Arc<watch::Sender<bool>>,
    cmd_shutdown: Arc<watch::Sender<bool>>,
    notify: Arc<NotifyState>,
    api_task: JoinHandle<Result<(), std::io::Error>>,
    cmd_task: JoinHandle<Result<(), std::io::Error>>,
}

impl EmulatorHandle {
    pub fn api_addr(&self) -> SocketAddr {
        self.api_addr
    }

    pub fn cmd_addr(&self) -> SocketAddr {
        self.cmd_addr
    }

    /// `http://ip:port` base URL of the API listener.
    pub fn api_base_url(&self) -> String {
        format!("http://{}", self.api_addr)
    }

    /// `http://ip:port` base URL of the command listener.
    pub fn cmd_base_url(&self) -> String {
        format!("http://{}", self.cmd_addr)
    }

    /// Wait until both listeners have stopped (for example after a close
    /// command arrived on the control plane).
    pub async fn wait_closed(&mut self) {
        let _ = (&mut self.api_task).await;
        let _ = (&mut self.cmd_task).await;
    }

    /// Trigger graceful shutdown: close every notification channel, stop
    /// both listeners, then await their tasks.
    pub async fn shutdown(self) {
        ws::close_all_clients(&self.notify);
        let _ = self.api_shutdown.send(true);
        let _ = self.cmd_shutdown.send(true);

        for task in [self.api_task, self.cmd_task] {
            match tokio::time::timeout(Duration::from_secs(5), task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => error!("listener task returned error: {err}"),
                Ok(Err(err)) => error!("listener task panicked: {err}"),
                Err(_) => warn!("listener task did not finish within 5s timeout"),
            }
        }
    }
}

/// Bind both listeners and start serving.
pub async fn run_emulator(
    config: EmulatorConfig,
) -> Result<EmulatorHandle, Box<dyn std::error::Error>> {
    let emulator = Arc::new(EmulatorState::new(config.api_version));
    let notify = Arc::new(NotifyState::new(config.timings));

    let (api_shutdown, api_rx) = watch::channel(false);
    let (cmd_shutdown, cmd_rx) = watch::channel(false);
    let api_shutdown = Arc::new(api_shutdown);
    let cmd_shutdown = Arc::new(cmd_shutdown);

    let api_router = api::create_api_router(ApiState {
        emulator: emulator.clone(),
        notify: notify.clone(),
    });
    let cmd_router = command::create_command_router(CommandState {
        emulator,
        notify: notify.clone(),
        api_shutdown: api_shutdown.clone(),
        cmd_shutdown: cmd_shutdown.clone(),
    });

    let api_listener = TcpListener::bind(config.api_addr).await?;
    let api_addr = api_listener.local_addr()?;
    let cmd_listener = TcpListener::bind(config.cmd_addr).await?;
    let cmd_addr = cmd_listener.local_addr()?;

    let api_task = tokio::spawn(serve_with_shutdown(api_listener, api_router, api_rx));
    let cmd_task = tokio::spawn(serve_with_shutdown(cmd_listener, cmd_router, cmd_rx));

    Ok(EmulatorHandle {
        api_addr,
        cmd_addr,
        api_shutdown,
        cmd_shutdown,
        notify,
        api_task,
        cmd_task,
    })
}

async fn serve_with_shutdown(
    listener: TcpListener,
    router: Router,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
}
