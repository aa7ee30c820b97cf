//! Control-plane command endpoints.
//!
//! Implements:
//! - GET/POST /device-credentials - read/replace the credentials registry
//! - GET/POST /http-context - read/install the request expectation
//! - GET/POST /notify-context - read/install the notification table
//! - POST /notify-close - close every open notification channel
//! - GET /info - identify the emulator and its version
//! - POST /close - shut the emulator down
//!
//! Unknown routes and mismatched methods answer 404 with an empty body.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::context::{
    CredentialsInstall, DeviceCredentials, EmulatorState, HttpContext, NotifyContext,
};
use crate::server::api;
use crate::server::ws::{self, NotifyState};

/// Shared state for the command listener.
#[derive(Clone)]
pub struct CommandState {
    pub emulator: Arc<EmulatorState>,
    pub notify: Arc<NotifyState>,
    /// Signals the API listener's graceful shutdown.
    pub api_shutdown: Arc<watch::Sender<bool>>,
    /// Signals this listener's own graceful shutdown.
    pub cmd_shutdown: Arc<watch::Sender<bool>>,
}

/// Create the command router.
pub fn create_command_router(state: CommandState) -> Router {
    Router::new()
        .route(
            "/device-credentials",
            get(get_credentials)
                .post(post_credentials)
                .fallback(route_not_found),
        )
        .route(
            "/http-context",
            get(get_http_context)
                .post(post_http_context)
                .fallback(route_not_found),
        )
        .route(
            "/notify-context",
            get(get_notify_context)
                .post(post_notify_context)
                .fallback(route_not_found),
        )
        .route(
            "/notify-close",
            post(post_notify_close).fallback(route_not_found),
        )
        .route("/info", get(get_info).fallback(route_not_found))
        .route("/close", post(post_close).fallback(route_not_found))
        .fallback(route_not_found)
        .with_state(state)
}

async fn route_not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

fn has_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("application/json"))
        .unwrap_or(false)
}

fn bad_request(message: &'static str) -> Response {
    (StatusCode::BAD_REQUEST, message).into_response()
}

async fn get_credentials(State(state): State<CommandState>) -> Json<Vec<DeviceCredentials>> {
    Json(state.emulator.credentials().as_ref().clone())
}

async fn post_credentials(
    State(state): State<CommandState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    const INVALID: &str = "Invalid device credentials";
    if !has_json_content_type(&headers) {
        return bad_request(INVALID);
    }
    let install: CredentialsInstall = match serde_json::from_slice(&body) {
        Ok(install) => install,
        Err(err) => {
            debug!(error = %err, "rejecting credentials document");
            return bad_request(INVALID);
        }
    };
    match state.emulator.install_credentials(install) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(_) => bad_request(INVALID),
    }
}

async fn get_http_context(State(state): State<CommandState>) -> Json<Option<HttpContext>> {
    Json(state.emulator.http_context().map(|ctx| ctx.as_ref().clone()))
}

async fn post_http_context(
    State(state): State<CommandState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    const INVALID: &str = "Invalid HTTP context";
    if !has_json_content_type(&headers) {
        return bad_request(INVALID);
    }
    let context: HttpContext = match serde_json::from_slice(&body) {
        Ok(context) => context,
        Err(err) => {
            debug!(error = %err, "rejecting HTTP context document");
            return bad_request(INVALID);
        }
    };
    if api::resolve_expected_url(
        &state.emulator.api_base_path(),
        &context.expected_request.api_method_path,
    )
    .is_none()
    {
        return bad_request(INVALID);
    }
    match state.emulator.install_http_context(context) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(_) => bad_request(INVALID),
    }
}

async fn get_notify_context(State(state): State<CommandState>) -> Json<Option<NotifyContext>> {
    Json(
        state
            .emulator
            .notify_context()
            .map(|ctx| ctx.as_ref().clone()),
    )
}

async fn post_notify_context(
    State(state): State<CommandState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    const INVALID: &str = "Invalid notification context";
    if !has_json_content_type(&headers) {
        return bad_request(INVALID);
    }
    let context: NotifyContext = match serde_json::from_slice(&body) {
        Ok(context) => context,
        Err(err) => {
            debug!(error = %err, "rejecting notification context document");
            return bad_request(INVALID);
        }
    };
    match state.emulator.install_notify_context(context) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(_) => bad_request(INVALID),
    }
}

async fn post_notify_close(State(state): State<CommandState>) -> StatusCode {
    ws::close_all_clients(&state.notify);
    StatusCode::OK
}

async fn get_info() -> Json<String> {
    Json(format!(
        "Catenis API Emulator (ver. {})",
        env!("CARGO_PKG_VERSION")
    ))
}

/// Shut down: close the open notification channels, stop the API listener,
/// then stop this listener. The 200 response is delivered while the
/// listeners drain, so callers see it before the API socket goes away.
async fn post_close(State(state): State<CommandState>) -> StatusCode {
    info!("close command received, shutting down");
    ws::close_all_clients(&state.notify);
    let _ = state.api_shutdown.send(true);
    let _ = state.cmd_shutdown.send(true);
    StatusCode::OK
}
