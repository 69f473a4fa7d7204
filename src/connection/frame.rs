//! Wire Frame Codec
//!
//! Single responsibility: turn requests into text frames and text frames into
//! replies. No knowledge of connection state or pending requests.
//!
//! # Wire Format
//!
//! ## Outbound
//! ```text
//! <unixMillis>:<path>::<requestId>:<json>
//! ```
//! The empty field between path and id is reserved.
//!
//! ## Inbound
//! ```text
//! <digits>:<field>:<field>:<requestId>:ok|failed[ ][json]
//! ```
//! The two middle fields echo the path (or a server marker) and carry no
//! meaning for the client. A missing payload means `{}`.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

use crate::error::ClientError;

/// Reply status carried by an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Failed,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub timestamp: u64,
    pub path: String,
    pub marker: String,
    pub id: u64,
    pub status: ReplyStatus,
    pub payload: Value,
}

impl Reply {
    /// Map the reply onto the caller-facing result.
    pub fn into_result(self) -> Result<Value, ClientError> {
        match self.status {
            ReplyStatus::Ok => Ok(self.payload),
            ReplyStatus::Failed => Err(ClientError::RemoteFailure(self.payload)),
        }
    }
}

fn reply_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^(\d+):([^:]*):([^:]*):(\d+):(ok|failed) ?(.*)$")
            .expect("reply pattern is a valid regex")
    })
}

/// Canonical payload form: objects and arrays pass through, everything else
/// becomes an empty object.
pub fn normalize_payload(payload: Value) -> Value {
    match payload {
        Value::Object(_) | Value::Array(_) => payload,
        _ => Value::Object(Map::new()),
    }
}

/// Encode an outbound request frame.
pub fn encode_request(
    timestamp: u64,
    path: &str,
    id: u64,
    payload: Value,
) -> Result<String, ClientError> {
    let json = serde_json::to_string(&normalize_payload(payload))?;
    Ok(format!("{}:{}::{}:{}", timestamp, path, id, json))
}

/// Decode an inbound reply frame.
///
/// Anything that does not match the reply shape exactly is rejected.
pub fn decode_reply(raw: &str) -> Result<Reply, ClientError> {
    let caps = reply_pattern()
        .captures(raw)
        .ok_or_else(|| ClientError::Frame(truncate(raw)))?;

    let timestamp = caps[1]
        .parse::<u64>()
        .map_err(|e| ClientError::Frame(format!("timestamp: {}", e)))?;
    let id = caps[4]
        .parse::<u64>()
        .map_err(|e| ClientError::Frame(format!("request id: {}", e)))?;

    let status = if caps[5].eq_ignore_ascii_case("ok") {
        ReplyStatus::Ok
    } else {
        ReplyStatus::Failed
    };

    let body = &caps[6];
    let payload = if body.is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_str(body)
            .map_err(|e| ClientError::Frame(format!("payload for request {}: {}", id, e)))?
    };

    Ok(Reply {
        timestamp,
        path: caps[2].to_string(),
        marker: caps[3].to_string(),
        id,
        status,
        payload,
    })
}

fn truncate(raw: &str) -> String {
    const MAX: usize = 120;
    match raw.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}...", &raw[..cut]),
        None => raw.to_string(),
    }
}
