//! Emulated Catenis API surface.
//!
//! Implements:
//! - The single-shot expectation matcher (any path, any method)
//! - CORS preflight handling
//! - Request authentication, shared with the notification channels
//! - Response framing (envelopes, CORS headers, pretty-printed JSON)

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use crate::context::{EmulatorState, RequiredResponse};
use crate::server::ws::{self, NotifyState};
use crate::signer;

/// Arbitrary authority both sides of a URL comparison are resolved against;
/// only path and query take part in matching.
const MATCH_AUTHORITY: &str = "catenis.emulator";

const PREFLIGHT_ALLOW_METHODS: &str = "POST, GET, OPTIONS";
const PREFLIGHT_ALLOW_HEADERS: &str =
    "Origin, X-Requested-With, Content-Type, Accept, X-Bcot-Timestamp, Authorization";
const PREFLIGHT_MAX_AGE: &str = "86400";

/// Shared state for the API listener: the programmable emulator state and
/// the notification-channel registry.
#[derive(Clone)]
pub struct ApiState {
    pub emulator: Arc<EmulatorState>,
    pub notify: Arc<NotifyState>,
}

/// Create the API router: the notification upgrade endpoint plus a catch-all
/// expectation matcher.
pub fn create_api_router(state: ApiState) -> Router {
    let ws_path = format!("{}notify/ws/:event", state.emulator.api_base_path());
    Router::new()
        .route(&ws_path, get(ws::notify_ws_handler))
        .fallback(matcher_handler)
        .with_state(state)
}

/// Authentication failure, carrying the status and message surfaced to the
/// caller.
#[derive(Debug, Clone)]
pub struct AuthFailure {
    pub status: StatusCode,
    pub message: String,
}

fn invalid_device_or_signature() -> AuthFailure {
    AuthFailure {
        status: StatusCode::UNAUTHORIZED,
        message: "Authorization failed; invalid device or signature".to_string(),
    }
}

/// Validate a request's signature headers against the installed device
/// credentials. Returns the authenticated device id.
///
/// `body` must be the exact bytes the signature covers; callers that did not
/// read a body pass the empty slice. The notification channels reuse this
/// with their retained upgrade headers.
pub fn authenticate_request(
    emulator: &EmulatorState,
    method: &str,
    request_url: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<String, AuthFailure> {
    let auth = signer::parse_headers(headers, Utc::now()).map_err(|err| AuthFailure {
        status: StatusCode::UNAUTHORIZED,
        message: err.to_string(),
    })?;

    let Some(host) = headers.get(header::HOST).and_then(|value| value.to_str().ok()) else {
        return Err(AuthFailure {
            status: StatusCode::UNAUTHORIZED,
            message: signer::SignatureError::MissingHeaders.to_string(),
        });
    };

    let Some(secret) = emulator.secret_for(&auth.device_id) else {
        debug!(device_id = %auth.device_id, "authentication for unknown device");
        return Err(invalid_device_or_signature());
    };

    if !signer::verify_signature(&auth, method, request_url, host, body, &secret) {
        debug!(device_id = %auth.device_id, "signature mismatch");
        return Err(invalid_device_or_signature());
    }

    Ok(auth.device_id)
}

/// Catch-all handler implementing the expectation matcher.
async fn matcher_handler(
    State(state): State<ApiState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if is_cors_preflight(&method, &headers) {
        return preflight_response(&headers);
    }

    // Snapshot: an install during this request does not affect the match.
    let Some(context) = state.emulator.http_context() else {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Missing HTTP context",
            &headers,
        );
    };
    let expected = &context.expected_request;

    if method.as_str() != expected.http_method.as_str() {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!(
                "Unexpected HTTP request method: expected: {}; received: {}",
                expected.http_method.as_str(),
                method.as_str()
            ),
            &headers,
        );
    }

    let Some(expected_url) = resolve_expected_url(
        &state.emulator.api_base_path(),
        &expected.api_method_path,
    ) else {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error",
            &headers,
        );
    };
    let request_url = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    let Some(received_url) = parse_request_url(&request_url) else {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error",
            &headers,
        );
    };

    if !urls_match(&expected_url, &received_url) {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!(
                "Unexpected HTTP request path: expected: {}; received: {}",
                path_and_query(&expected_url),
                path_and_query(&received_url)
            ),
            &headers,
        );
    }

    // The signature covers the body only when a body expectation consumed it.
    let mut signed_body: &[u8] = &[];
    if let Some(expected_data) = expected.data.as_deref() {
        signed_body = &body;
        if !body.is_empty() {
            let content_type = headers
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("");
            if !content_type.starts_with("application/json") {
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!(
                        "Unexpected content type: expected: application/json; received: {content_type}"
                    ),
                    &headers,
                );
            }
            if body.as_ref() != expected_data.as_bytes() {
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!(
                        "Unexpected HTTP request body: expected: {expected_data}; received: {}",
                        String::from_utf8_lossy(&body)
                    ),
                    &headers,
                );
            }
        }
    }

    if expected.must_authenticate() {
        if let Err(failure) = authenticate_request(
            &state.emulator,
            method.as_str(),
            &request_url,
            &headers,
            signed_body,
        ) {
            return error_response(failure.status, failure.message, &headers);
        }
    }

    match context.required_response.as_ref() {
        Some(RequiredResponse::Error {
            status_code,
            error_message,
        }) => {
            let status = StatusCode::from_u16(*status_code)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            error_response(status, error_message.clone(), &headers)
        }
        Some(RequiredResponse::Success { data }) => match serde_json::from_str::<Value>(data) {
            Ok(parsed) => success_response(parsed, &headers),
            // Unreachable for contexts that passed install validation.
            Err(_) => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                &headers,
            ),
        },
        None => empty_response(&headers),
    }
}

/// Resolve the expected URL by joining the method path (leading slash
/// stripped) onto the API base path.
pub fn resolve_expected_url(base_path: &str, api_method_path: &str) -> Option<Url> {
    let root = Url::parse(&format!("http://{MATCH_AUTHORITY}{base_path}")).ok()?;
    root.join(api_method_path.trim_start_matches('/')).ok()
}

fn parse_request_url(path_and_query: &str) -> Option<Url> {
    Url::parse(&format!("http://{MATCH_AUTHORITY}{path_and_query}")).ok()
}

fn path_and_query(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

/// Paths must match exactly; queries must carry the same parameter names
/// with equal multisets of values, order-insensitive.
fn urls_match(expected: &Url, received: &Url) -> bool {
    expected.path() == received.path() && query_multimap(expected) == query_multimap(received)
}

fn query_multimap(url: &Url) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in url.query_pairs() {
        map.entry(name.into_owned()).or_default().push(value.into_owned());
    }
    for values in map.values_mut() {
        values.sort();
    }
    map
}

fn is_cors_preflight(method: &Method, headers: &HeaderMap) -> bool {
    method == Method::OPTIONS
        && (headers.contains_key("access-control-request-headers")
            || headers.contains_key("access-control-request-method"))
}

fn preflight_response(req_headers: &HeaderMap) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(PREFLIGHT_ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(PREFLIGHT_ALLOW_HEADERS),
    );
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static(PREFLIGHT_MAX_AGE),
    );
    apply_cors(response.headers_mut(), req_headers);
    response
}

/// Echo the request origin when present (with `Vary: Origin`), `*` otherwise.
fn apply_cors(headers: &mut HeaderMap, req_headers: &HeaderMap) {
    match req_headers.get(header::ORIGIN) {
        Some(origin) => {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
            headers.insert(header::VARY, HeaderValue::from_static("Origin"));
        }
        None => {
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_ORIGIN,
                HeaderValue::from_static("*"),
            );
        }
    }
}

fn json_response(status: StatusCode, value: &Value, req_headers: &HeaderMap) -> Response {
    let body = serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string());
    let mut response = (status, body).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    apply_cors(response.headers_mut(), req_headers);
    response
}

fn success_response(data: Value, req_headers: &HeaderMap) -> Response {
    json_response(
        StatusCode::OK,
        &json!({ "status": "success", "data": data }),
        req_headers,
    )
}

fn error_response(
    status: StatusCode,
    message: impl Into<String>,
    req_headers: &HeaderMap,
) -> Response {
    json_response(
        status,
        &json!({ "status": "error", "message": message.into() }),
        req_headers,
    )
}

fn empty_response(req_headers: &HeaderMap) -> Response {
    let mut response = StatusCode::OK.into_response();
    apply_cors(response.headers_mut(), req_headers);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{
        CredentialsInstall, DeviceCredentials, ExpectedRequest, HttpContext, HttpMethod,
    };
    use crate::server::ws::NotifyTimings;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const DEVICE_ID: &str = "drc3XdxNtzoucpw9xiRp";
    const SECRET: &str = "4c1749c8e86f65e0a73e5fb19f2aa9e74a716bc22d7956bf3072b4bc3fbfc7e8";
    const HOST: &str = "localhost:3500";

    fn test_state() -> ApiState {
        ApiState {
            emulator: Arc::new(EmulatorState::new("0.13")),
            notify: Arc::new(NotifyState::new(NotifyTimings::default())),
        }
    }

    fn install_context(state: &ApiState, context: HttpContext) {
        state.emulator.install_http_context(context).unwrap();
    }

    fn expectation(method: HttpMethod, path: &str) -> HttpContext {
        HttpContext {
            expected_request: ExpectedRequest {
                http_method: method,
                api_method_path: path.to_string(),
                data: None,
                authenticate: Some(false),
            },
            required_response: None,
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn signed_request(method: &str, url: &str, body: &[u8]) -> Request<Body> {
        let now = Utc::now();
        let timestamp = signer::format_timestamp(now);
        let sign_date = signer::format_sign_date(now);
        let signature =
            signer::compute_signature(method, url, HOST, &timestamp, &sign_date, body, SECRET);
        Request::builder()
            .method(method)
            .uri(url)
            .header("host", HOST)
            .header("content-type", "application/json")
            .header(signer::TIMESTAMP_HEADER, timestamp)
            .header(
                "authorization",
                signer::authorization_header(DEVICE_ID, &sign_date, &signature),
            )
            .body(Body::from(body.to_vec()))
            .unwrap()
    }

    #[tokio::test]
    async fn missing_context_yields_500() {
        let router = create_api_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/api/0.13/messages")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["status"], "error");
        assert_eq!(json["message"], "Missing HTTP context");
    }

    #[tokio::test]
    async fn method_mismatch_yields_diagnostic() {
        let state = test_state();
        install_context(&state, expectation(HttpMethod::POST, "messages/log"));
        let router = create_api_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/api/0.13/messages/log")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(
            json["message"],
            "Unexpected HTTP request method: expected: POST; received: GET"
        );
    }

    #[tokio::test]
    async fn matching_request_without_response_yields_empty_200() {
        let state = test_state();
        install_context(&state, expectation(HttpMethod::GET, "messages"));
        let router = create_api_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/api/0.13/messages")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "*"
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn success_response_is_enveloped_and_pretty_printed() {
        let state = test_state();
        install_context(
            &state,
            HttpContext {
                expected_request: ExpectedRequest {
                    http_method: HttpMethod::GET,
                    api_method_path: "messages".into(),
                    data: None,
                    authenticate: Some(false),
                },
                required_response: Some(RequiredResponse::Success {
                    data: "{\"messageId\":\"mdx8vuCGWdb2TFeWFZd6\"}".into(),
                }),
            },
        );
        let router = create_api_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/api/0.13/messages")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        // Two-space indentation of the pretty printer.
        assert!(text.contains("\n  \"status\": \"success\""), "body: {text}");
        let json: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["data"]["messageId"], "mdx8vuCGWdb2TFeWFZd6");
    }

    #[tokio::test]
    async fn query_sets_match_order_insensitively() {
        let state = test_state();
        install_context(&state, expectation(HttpMethod::GET, "messages?a=1&b=2&b=3"));
        let router = create_api_router(state.clone());

        let response = router
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/api/0.13/messages?b=3&a=1&b=2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = create_api_router(state)
            .oneshot(
                Request::builder()
                    .method("GET")
                    .uri("/api/0.13/messages?a=1&b=2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert!(json["message"]
            .as_str()
            .unwrap()
            .starts_with("Unexpected HTTP request path"));
    }

    #[tokio::test]
    async fn body_mismatch_yields_diagnostic() {
        let state = test_state();
        install_context(
            &state,
            HttpContext {
                expected_request: ExpectedRequest {
                    http_method: HttpMethod::POST,
                    api_method_path: "messages/log".into(),
                    data: Some("{\"message\":\"Test message #1\"}".into()),
                    authenticate: Some(false),
                },
                required_response: None,
            },
        );
        let router = create_api_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/0.13/messages/log")
                    .header("content-type", "application/json")
                    .body(Body::from("{\"message\":\"WRONG\"}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert!(json["message"]
            .as_str()
            .unwrap()
            .starts_with("Unexpected HTTP request body"));
    }

    #[tokio::test]
    async fn wrong_content_type_yields_diagnostic() {
        let state = test_state();
        install_context(
            &state,
            HttpContext {
                expected_request: ExpectedRequest {
                    http_method: HttpMethod::POST,
                    api_method_path: "messages/log".into(),
                    data: Some("{}".into()),
                    authenticate: Some(false),
                },
                required_response: None,
            },
        );
        let router = create_api_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/0.13/messages/log")
                    .header("content-type", "text/plain")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert!(json["message"]
            .as_str()
            .unwrap()
            .starts_with("Unexpected content type"));
    }

    #[tokio::test]
    async fn authenticated_request_succeeds_end_to_end() {
        let state = test_state();
        state
            .emulator
            .install_credentials(CredentialsInstall::One(DeviceCredentials {
                device_id: DEVICE_ID.into(),
                api_access_secret: SECRET.into(),
            }))
            .unwrap();
        install_context(
            &state,
            HttpContext {
                expected_request: ExpectedRequest {
                    http_method: HttpMethod::POST,
                    api_method_path: "messages/log".into(),
                    data: Some("{\"message\":\"Test message #1\"}".into()),
                    authenticate: Some(true),
                },
                required_response: Some(RequiredResponse::Success {
                    data: "{\"messageId\":\"mdx8vuCGWdb2TFeWFZd6\"}".into(),
                }),
            },
        );
        let router = create_api_router(state);

        let response = router
            .oneshot(signed_request(
                "POST",
                "/api/0.13/messages/log",
                b"{\"message\":\"Test message #1\"}",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "success");
        assert_eq!(json["data"]["messageId"], "mdx8vuCGWdb2TFeWFZd6");
    }

    #[tokio::test]
    async fn unknown_device_yields_401() {
        let state = test_state();
        install_context(
            &state,
            HttpContext {
                expected_request: ExpectedRequest {
                    http_method: HttpMethod::POST,
                    api_method_path: "messages/log".into(),
                    data: Some("{\"message\":\"Test message #1\"}".into()),
                    authenticate: None,
                },
                required_response: None,
            },
        );
        let router = create_api_router(state);

        let response = router
            .oneshot(signed_request(
                "POST",
                "/api/0.13/messages/log",
                b"{\"message\":\"Test message #1\"}",
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(
            json["message"],
            "Authorization failed; invalid device or signature"
        );
    }

    #[tokio::test]
    async fn tampered_body_fails_authentication() {
        let state = test_state();
        state
            .emulator
            .install_credentials(CredentialsInstall::One(DeviceCredentials {
                device_id: DEVICE_ID.into(),
                api_access_secret: SECRET.into(),
            }))
            .unwrap();
        install_context(
            &state,
            HttpContext {
                expected_request: ExpectedRequest {
                    http_method: HttpMethod::POST,
                    api_method_path: "messages/log".into(),
                    data: Some("{\"message\":\"tampered\"}".into()),
                    authenticate: None,
                },
                required_response: None,
            },
        );
        let router = create_api_router(state);

        // Signature computed over a different body than the one sent.
        let mut request = signed_request("POST", "/api/0.13/messages/log", b"{\"message\":\"x\"}");
        *request.body_mut() = Body::from("{\"message\":\"tampered\"}");
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn cors_preflight_is_answered_generically() {
        let router = create_api_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/0.13/anything")
                    .header("origin", "http://example.com")
                    .header("access-control-request-method", "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let allow_headers = response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_HEADERS)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(allow_headers.contains("X-Bcot-Timestamp"));
        assert!(allow_headers.contains("Authorization"));
        assert_eq!(
            response
                .headers()
                .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                .unwrap(),
            "http://example.com"
        );
        assert_eq!(response.headers().get(header::VARY).unwrap(), "Origin");
    }

    #[test]
    fn expected_url_resolution_strips_leading_slash() {
        let with_slash = resolve_expected_url("/api/0.13/", "/messages/log").unwrap();
        let without = resolve_expected_url("/api/0.13/", "messages/log").unwrap();
        assert_eq!(with_slash, without);
        assert_eq!(with_slash.path(), "/api/0.13/messages/log");
    }

    #[test]
    fn query_multimap_collects_repeated_names() {
        let url = Url::parse("http://x/p?a=1&b=2&b=3").unwrap();
        let map = query_multimap(&url);
        assert_eq!(map["a"], vec!["1"]);
        assert_eq!(map["b"], vec!["2", "3"]);
    }
}
