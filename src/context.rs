//! Test-programmable emulator state.
//!
//! The control plane installs three documents — the device credentials
//! registry, the single-shot HTTP expectation, and the notification table —
//! and the data plane reads them while serving requests. Each document lives
//! in a mutex-guarded cell holding an `Arc` snapshot: installation validates
//! the incoming document and swaps the whole snapshot, readers clone the
//! `Arc` so an in-flight request keeps a consistent view for its duration.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events a notification channel can subscribe to.
pub const NOTIFY_EVENTS: [&str; 12] = [
    "new-msg-received",
    "sent-msg-read",
    "asset-received",
    "asset-confirmed",
    "final-msg-progress",
    "asset-export-outcome",
    "asset-migration-outcome",
    "nf-token-received",
    "nf-token-confirmed",
    "nf-asset-issuance-outcome",
    "nf-token-retrieval-outcome",
    "nf-token-transfer-outcome",
];

pub fn is_notify_event(name: &str) -> bool {
    NOTIFY_EVENTS.contains(&name)
}

/// A device identity known to the emulator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCredentials {
    pub device_id: String,
    pub api_access_secret: String,
}

/// Install payload for the credentials endpoint: a single entry or a bulk
/// array. Either form replaces the registry in full.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CredentialsInstall {
    One(DeviceCredentials),
    Many(Vec<DeviceCredentials>),
}

impl CredentialsInstall {
    pub fn into_vec(self) -> Vec<DeviceCredentials> {
        match self {
            CredentialsInstall::One(entry) => vec![entry],
            CredentialsInstall::Many(entries) => entries,
        }
    }
}

/// Methods an expectation can be installed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    GET,
    POST,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::GET => "GET",
            HttpMethod::POST => "POST",
        }
    }
}

/// The request the test expects the client under test to issue next.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedRequest {
    pub http_method: HttpMethod,
    /// Path plus optional query, relative to the API base path. A leading
    /// slash is accepted and ignored.
    pub api_method_path: String,
    /// Exact raw JSON body expected, compared byte for byte.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Whether the request must carry a valid signature. Defaults to true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticate: Option<bool>,
}

impl ExpectedRequest {
    pub fn must_authenticate(&self) -> bool {
        self.authenticate.unwrap_or(true)
    }
}

/// The response to replay when the expected request arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequiredResponse {
    #[serde(rename_all = "camelCase")]
    Error {
        status_code: u16,
        error_message: String,
    },
    Success {
        /// JSON text embedded under `data` in the success envelope.
        data: String,
    },
}

/// One-shot pairing of expected request and canned response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpContext {
    pub expected_request: ExpectedRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_response: Option<RequiredResponse>,
}

/// Notification payload for one `(device, event)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyEntry {
    /// JSON text delivered verbatim as a single text frame.
    pub data: String,
    /// Delay before delivery, in milliseconds. Absent or zero means
    /// immediate delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Two-level table: device id -> event name -> payload.
pub type NotifyContext = HashMap<String, HashMap<String, NotifyEntry>>;

/// Validation failures when installing a document; the messages double as
/// the control plane's 400 bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("Invalid device credentials")]
    Credentials,
    #[error("Invalid HTTP context")]
    Http,
    #[error("Invalid notification context")]
    Notify,
}

fn parses_to_non_null_json(text: &str) -> bool {
    serde_json::from_str::<Value>(text)
        .map(|value| !value.is_null())
        .unwrap_or(false)
}

/// Shared emulator state: the API version and the three installable cells.
pub struct EmulatorState {
    api_version: String,
    credentials: Mutex<Arc<Vec<DeviceCredentials>>>,
    http_context: Mutex<Option<Arc<HttpContext>>>,
    notify_context: Mutex<Option<Arc<NotifyContext>>>,
}

impl EmulatorState {
    pub fn new(api_version: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            credentials: Mutex::new(Arc::new(Vec::new())),
            http_context: Mutex::new(None),
            notify_context: Mutex::new(None),
        }
    }

    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    /// Base path all emulated API URLs hang off, with trailing slash.
    pub fn api_base_path(&self) -> String {
        format!("/api/{}/", self.api_version)
    }

    pub fn credentials(&self) -> Arc<Vec<DeviceCredentials>> {
        self.credentials.lock().clone()
    }

    /// Replace the credentials registry in full.
    pub fn install_credentials(&self, install: CredentialsInstall) -> Result<(), ContextError> {
        let entries = install.into_vec();
        if entries.iter().any(|entry| entry.device_id.is_empty()) {
            return Err(ContextError::Credentials);
        }
        *self.credentials.lock() = Arc::new(entries);
        Ok(())
    }

    pub fn secret_for(&self, device_id: &str) -> Option<String> {
        self.credentials
            .lock()
            .iter()
            .find(|entry| entry.device_id == device_id)
            .map(|entry| entry.api_access_secret.clone())
    }

    pub fn http_context(&self) -> Option<Arc<HttpContext>> {
        self.http_context.lock().clone()
    }

    /// Validate and install the single-shot expectation, replacing any
    /// previous one.
    pub fn install_http_context(&self, context: HttpContext) -> Result<(), ContextError> {
        if let Some(response) = &context.required_response {
            match response {
                RequiredResponse::Success { data } => {
                    if !parses_to_non_null_json(data) {
                        return Err(ContextError::Http);
                    }
                }
                RequiredResponse::Error { status_code, .. } => {
                    if axum::http::StatusCode::from_u16(*status_code).is_err() {
                        return Err(ContextError::Http);
                    }
                }
            }
        }
        *self.http_context.lock() = Some(Arc::new(context));
        Ok(())
    }

    pub fn notify_context(&self) -> Option<Arc<NotifyContext>> {
        self.notify_context.lock().clone()
    }

    /// Validate and install the notification table, replacing any previous
    /// one.
    pub fn install_notify_context(&self, context: NotifyContext) -> Result<(), ContextError> {
        for (device_id, events) in &context {
            if device_id.is_empty() {
                return Err(ContextError::Notify);
            }
            for (event, entry) in events {
                if !is_notify_event(event) || !parses_to_non_null_json(&entry.data) {
                    return Err(ContextError::Notify);
                }
            }
        }
        *self.notify_context.lock() = Some(Arc::new(context));
        Ok(())
    }

    /// Look up the notification payload installed for a channel.
    pub fn notify_entry(&self, device_id: &str, event: &str) -> Option<NotifyEntry> {
        self.notify_context
            .lock()
            .as_ref()?
            .get(device_id)?
            .get(event)
            .cloned()
    }
}
