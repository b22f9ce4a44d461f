// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! JSON-RPC 2.0 message types and the `Content-Length` wire framing.
//!
//! Both sides of the proxy (the client TCP connection and the language
//! server's stdio pipes) speak the same framing: a block of `Name: Value`
//! header lines ended by a blank line, of which at least `Content-Length`
//! must be present, followed by exactly that many bytes of UTF-8 JSON.

use anyhow::{Context, Result, anyhow};
use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};

/// A JSON-RPC request or response ID.
///
/// Ids arrive as integers or strings and keep whichever form they came in
/// with; the proxy only replaces them when id rewriting is configured.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// A numeric ID.
    Number(i64),
    /// A string ID.
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

/// The error object carried by a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseError {
    /// The error code.
    pub code: i64,
    /// The error message.
    pub message: String,
    /// Additional error data, forwarded as-is when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// `InternalError` from the JSON-RPC 2.0 spec. Used when a forwarding
/// failure has no error object from the peer to propagate.
pub const INTERNAL_ERROR: i64 = -32603;

/// A request: expects exactly one response correlated by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    /// Absent parameters decode as `Null`.
    #[serde(default)]
    pub params: serde_json::Value,
}

/// A notification: a request without an id, expecting no reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// A response, carrying one of `result` or `error` for a prior request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

/// Wrap a serialized message body in a `Content-Length` frame.
#[must_use]
pub fn frame(body: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 32);
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(body.as_bytes());
    out
}

/// Try to parse one framed message from the front of `buffer`.
///
/// Returns `Ok(None)` until the buffer holds a complete frame. On success
/// the frame's bytes are consumed from the buffer, so repeated calls drain
/// back-to-back messages.
///
/// # Errors
///
/// Returns an error when the frame boundary cannot be recovered: headers
/// that are not UTF-8, a header block without a usable `Content-Length`, or
/// a body that is not UTF-8.
pub fn try_parse_message(buffer: &mut BytesMut) -> Result<Option<String>> {
    // The header block runs up to the first blank line.
    let Some(blank) = buffer.windows(4).position(|w| w == b"\r\n\r\n") else {
        return Ok(None);
    };
    let body_start = blank + 4;

    let headers =
        std::str::from_utf8(&buffer[..blank]).context("frame headers are not UTF-8")?;
    let body_len = content_length(headers)
        .ok_or_else(|| anyhow!("header block carries no Content-Length"))?
        .context("invalid Content-Length value")?;

    if buffer.len() < body_start + body_len {
        return Ok(None);
    }

    buffer.advance(body_start);
    let body = buffer.split_to(body_len);
    let message = String::from_utf8(body.to_vec()).context("frame body is not UTF-8")?;
    Ok(Some(message))
}

/// Finds the `Content-Length` header in a header block. The outer `Option`
/// is presence, the inner `Result` the value parse.
fn content_length(headers: &str) -> Option<Result<usize, std::num::ParseIntError>> {
    headers.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("content-length")
            .then(|| value.trim().parse())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(body: &str) -> BytesMut {
        BytesMut::from(&frame(body)[..])
    }

    #[test]
    fn test_parse_complete_frame() -> Result<()> {
        let body = r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#;
        let mut buffer = framed(body);

        assert_eq!(try_parse_message(&mut buffer)?, Some(body.to_string()));
        assert!(buffer.is_empty());
        Ok(())
    }

    #[test]
    fn test_partial_frames_wait_for_more_data() -> Result<()> {
        let body = r#"{"ok":true}"#;
        let full = frame(body);
        let mut buffer = BytesMut::new();

        // Nothing parses until the last byte has arrived.
        for &byte in &full[..full.len() - 1] {
            buffer.extend_from_slice(&[byte]);
            assert_eq!(try_parse_message(&mut buffer)?, None);
        }

        buffer.extend_from_slice(&full[full.len() - 1..]);
        assert_eq!(try_parse_message(&mut buffer)?, Some(body.to_string()));
        Ok(())
    }

    #[test]
    fn test_back_to_back_frames_parse_in_order() -> Result<()> {
        let first = r#"{"jsonrpc":"2.0","id":1}"#;
        let second = r#"{"jsonrpc":"2.0","id":2}"#;
        let mut buffer = framed(first);
        buffer.extend_from_slice(&frame(second));

        assert_eq!(try_parse_message(&mut buffer)?, Some(first.to_string()));
        assert_eq!(try_parse_message(&mut buffer)?, Some(second.to_string()));
        assert!(buffer.is_empty());
        Ok(())
    }

    #[test]
    fn test_header_name_is_case_insensitive() -> Result<()> {
        let body = r#"{"test":true}"#;
        let raw = format!("content-LENGTH: {}\r\n\r\n{}", body.len(), body);
        let mut buffer = BytesMut::from(raw.as_str());

        assert_eq!(try_parse_message(&mut buffer)?, Some(body.to_string()));
        Ok(())
    }

    #[test]
    fn test_extra_headers_are_ignored() -> Result<()> {
        let body = r#"{"ok":true}"#;
        let raw = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let mut buffer = BytesMut::from(raw.as_str());

        assert_eq!(try_parse_message(&mut buffer)?, Some(body.to_string()));
        Ok(())
    }

    #[test]
    fn test_missing_content_length_is_error() {
        // A complete header block without a length is unrecoverable.
        let mut buffer = BytesMut::from("X-Whatever: 3\r\n\r\nabc");
        assert!(try_parse_message(&mut buffer).is_err());
    }

    #[test]
    fn test_unparsable_content_length_is_error() {
        let mut buffer = BytesMut::from("Content-Length: lots\r\n\r\nabc");
        assert!(try_parse_message(&mut buffer).is_err());
    }

    #[test]
    fn test_frame_length_counts_bytes_not_chars() {
        // Multi-byte UTF-8 must be measured in bytes for Content-Length.
        let body = r#"{"text":"héllo"}"#;
        let framed = frame(body);
        let header = String::from_utf8_lossy(&framed[..framed.len() - body.len()]);
        assert!(header.contains(&format!("Content-Length: {}", body.len())));
    }

    #[test]
    fn test_request_id_keeps_its_wire_form() -> Result<()> {
        let numeric: RequestMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":42,"method":"test"}"#)?;
        assert_eq!(numeric.id, RequestId::Number(42));
        assert_eq!(serde_json::to_string(&numeric.id)?, "42");

        let string: RequestMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"abc-123","method":"test"}"#)?;
        assert_eq!(string.id, RequestId::String("abc-123".to_string()));
        assert_eq!(serde_json::to_string(&string.id)?, "\"abc-123\"");
        Ok(())
    }

    #[test]
    fn test_request_params_default_to_null() -> Result<()> {
        let msg: RequestMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"shutdown"}"#)?;
        assert!(msg.params.is_null());
        Ok(())
    }

    #[test]
    fn test_response_carries_result_or_error() -> Result<()> {
        let ok: ResponseMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"result":{"capabilities":{}}}"#)?;
        assert!(ok.result.is_some());
        assert!(ok.error.is_none());

        let failed: ResponseMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32600,"message":"Invalid Request"}}"#,
        )?;
        assert!(failed.result.is_none());
        assert_eq!(failed.error.context("missing error")?.code, -32600);
        Ok(())
    }

    #[test]
    fn test_notification_has_no_id() -> Result<()> {
        let msg: NotificationMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"initialized","params":{}}"#)?;
        assert_eq!(msg.method, "initialized");
        Ok(())
    }
}
