//! Request-signature parsing and verification.
//!
//! Catenis authenticates requests with a custom HMAC-SHA-256 scheme: the
//! client canonicalizes the request, derives a signing key from the device's
//! API access secret and a sign date, and places the result in the
//! `Authorization` header next to an `X-BCoT-Timestamp` header. This module
//! parses those headers, enforces the time windows, and recomputes signatures
//! so callers can compare them against the header value.

use std::sync::LazyLock;

use axum::http::HeaderMap;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use hmac::{Hmac, Mac};
use regex::Regex;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Timestamp header carried by every signed request.
pub const TIMESTAMP_HEADER: &str = "x-bcot-timestamp";

/// Compact ISO-8601 basic format of the timestamp header (UTC, literal `Z`).
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

const SIGN_DATE_FORMAT: &str = "%Y%m%d";

/// Maximum skew between the request timestamp and the server clock.
const MAX_TIMESTAMP_SKEW_SECS: i64 = 300;

/// Days a sign date stays usable, counting the sign date itself.
const SIGN_DATE_VALID_DAYS: i64 = 7;

const SIGNATURE_METHOD: &str = "CTN1-HMAC-SHA256";
const SIGNATURE_SCOPE: &str = "ctn1_request";
const KEY_PREFIX: &str = "CTN1";

// Only the keywords are case-insensitive; the method and scope literals are
// matched exactly.
static AUTH_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^CTN1-HMAC-SHA256 +(?i:Credential)=([0-9A-Za-z_]{20})/(\d{8})/ctn1_request, *(?i:Signature)=([0-9a-f]{64})$",
    )
    .expect("authorization header pattern is valid")
});

/// Reasons a signed request fails header validation, each carrying the
/// message surfaced to the client on a 401.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("Authorization failed; missing required HTTP headers")]
    MissingHeaders,
    #[error("Authorization failed; timestamp not well formed")]
    MalformedTimestamp,
    #[error("Authorization failed; timestamp not within acceptable time variation")]
    TimestampOutOfBounds,
    #[error("Authorization failed; authorization header not well formed")]
    MalformedAuthHeader,
    #[error("Authorization failed; authorization sign date not well formed")]
    MalformedSignDate,
    #[error("Authorization failed; authorization sign date out of bounds")]
    SignDateOutOfBounds,
}

/// Values extracted from the `Authorization` and timestamp headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthData {
    pub device_id: String,
    pub sign_date: String,
    pub timestamp: String,
    pub signature: String,
}

/// Parse and validate the authentication headers of a request.
///
/// The timestamp must lie within ±[`MAX_TIMESTAMP_SKEW_SECS`] of `now`, and
/// `now`'s UTC calendar day must fall in the half-open window
/// `[sign_date, sign_date + SIGN_DATE_VALID_DAYS)`.
pub fn parse_headers(headers: &HeaderMap, now: DateTime<Utc>) -> Result<AuthData, SignatureError> {
    let timestamp = header_str(headers, TIMESTAMP_HEADER).ok_or(SignatureError::MissingHeaders)?;
    let authorization = header_str(headers, "authorization").ok_or(SignatureError::MissingHeaders)?;

    let parsed_ts = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
        .map_err(|_| SignatureError::MalformedTimestamp)?
        .and_utc();
    if (now - parsed_ts).num_seconds().abs() > MAX_TIMESTAMP_SKEW_SECS {
        return Err(SignatureError::TimestampOutOfBounds);
    }

    let caps = AUTH_HEADER_RE
        .captures(authorization)
        .ok_or(SignatureError::MalformedAuthHeader)?;
    let device_id = caps[1].to_string();
    let sign_date = caps[2].to_string();
    let signature = caps[3].to_string();

    let parsed_date = NaiveDate::parse_from_str(&sign_date, SIGN_DATE_FORMAT)
        .map_err(|_| SignatureError::MalformedSignDate)?;
    let today = now.date_naive();
    if today < parsed_date || today >= parsed_date + Duration::days(SIGN_DATE_VALID_DAYS) {
        return Err(SignatureError::SignDateOutOfBounds);
    }

    Ok(AuthData {
        device_id,
        sign_date,
        timestamp: timestamp.to_string(),
        signature,
    })
}

/// Recompute the signature for a request and compare it to the header value.
/// The comparison is an exact match on the lowercase hex encoding.
pub fn verify_signature(
    auth: &AuthData,
    method: &str,
    request_url: &str,
    host: &str,
    body: &[u8],
    api_access_secret: &str,
) -> bool {
    compute_signature(
        method,
        request_url,
        host,
        &auth.timestamp,
        &auth.sign_date,
        body,
        api_access_secret,
    ) == auth.signature
}

/// Compute the request signature.
///
/// The conformed request hashes the method, raw request URL, the essential
/// headers (`host`, timestamp, in that order), and the body digest. The
/// string-to-sign binds the timestamp and sign-date scope to the conformed
/// hash, and is signed with a key derived in two HMAC steps from the API
/// access secret.
pub fn compute_signature(
    method: &str,
    request_url: &str,
    host: &str,
    timestamp: &str,
    sign_date: &str,
    body: &[u8],
    api_access_secret: &str,
) -> String {
    let essential_headers = format!("host:{host}\n{TIMESTAMP_HEADER}:{timestamp}\n");
    let conformed_request = format!(
        "{method}\n{request_url}\n{essential_headers}{}\n",
        hex::encode(Sha256::digest(body))
    );
    let string_to_sign = format!(
        "{SIGNATURE_METHOD}\n{timestamp}\n{sign_date}/{SIGNATURE_SCOPE}\n{}\n",
        hex::encode(Sha256::digest(conformed_request.as_bytes()))
    );

    let date_key = hmac_sha256(
        format!("{KEY_PREFIX}{api_access_secret}").as_bytes(),
        sign_date.as_bytes(),
    );
    let sign_key = hmac_sha256(&date_key, SIGNATURE_SCOPE.as_bytes());
    hex::encode(hmac_sha256(&sign_key, string_to_sign.as_bytes()))
}

/// Format an instant as a timestamp header value.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Format an instant as a sign date.
pub fn format_sign_date(at: DateTime<Utc>) -> String {
    at.format(SIGN_DATE_FORMAT).to_string()
}

/// Assemble an `Authorization` header value from its parts.
pub fn authorization_header(device_id: &str, sign_date: &str, signature: &str) -> String {
    format!(
        "{SIGNATURE_METHOD} Credential={device_id}/{sign_date}/{SIGNATURE_SCOPE}, Signature={signature}"
    )
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC-SHA256 accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
