// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! A configurable mock language server for testing the proxy.
//!
//! Speaks Content-Length framed JSON-RPC over stdin/stdout. Requests that
//! carry positions echo back what the server actually received (the URI, the
//! raw request id, recorded `didOpen`/`didSave` counts), so tests on the
//! client side of the proxy can observe translation and injection without
//! inspecting the wire. CLI flags control failure modes. No tokio; plain
//! blocking I/O on a single thread.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Mock language server for integration testing.
#[derive(Parser, Debug)]
#[command(name = "mockls")]
struct Args {
    /// Return `InternalError` for this method (repeatable).
    #[arg(long)]
    fail_on: Vec<String>,

    /// Never respond to this method (repeatable).
    #[arg(long)]
    hang_on: Vec<String>,

    /// Never publish diagnostics.
    #[arg(long)]
    no_diagnostics: bool,
}

/// A JSON-RPC request or notification.
#[derive(Debug, Deserialize)]
struct Request {
    #[allow(dead_code, reason = "Required by JSON-RPC protocol")]
    jsonrpc: String,
    id: Option<Value>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
}

/// A JSON-RPC response.
#[derive(Debug, Serialize)]
struct Response {
    jsonrpc: String,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

/// JSON-RPC error object.
#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Thread-safe writer handle. Wraps `std::io::Stdout` for production,
/// or a shared `Vec<u8>` for tests.
type Writer = Arc<Mutex<Box<dyn Write + Send>>>;

/// Create a writer that forwards to stdout.
fn stdout_writer() -> Writer {
    Arc::new(Mutex::new(Box::new(std::io::stdout())))
}

#[cfg(test)]
fn buffer_writer() -> (Writer, Arc<Mutex<Vec<u8>>>) {
    let buf = Arc::new(Mutex::new(Vec::<u8>::new()));
    let writer: Box<dyn Write + Send> = Box::new(SharedVecWriter(buf.clone()));
    (Arc::new(Mutex::new(writer)), buf)
}

/// Write adapter for `Arc<Mutex<Vec<u8>>>` used in tests.
#[cfg(test)]
struct SharedVecWriter(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl Write for SharedVecWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .map_err(|e| std::io::Error::other(e.to_string()))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Shared state for the mock server.
struct MockServer {
    args: Args,
    /// Document text by URI, recorded from `didOpen`/`didChange`.
    documents: HashMap<String, String>,
    /// How many `didOpen` notifications each URI has received.
    open_counts: HashMap<String, u64>,
    /// How many `didSave` notifications each URI has received.
    save_counts: HashMap<String, u64>,
    writer: Writer,
}

impl MockServer {
    fn new(args: Args, writer: Writer) -> Self {
        Self {
            args,
            documents: HashMap::new(),
            open_counts: HashMap::new(),
            save_counts: HashMap::new(),
            writer,
        }
    }

    /// Run the server, reading from the given reader.
    fn run(&mut self, reader: &mut dyn Read) {
        let mut buffer = Vec::new();
        let mut temp = [0u8; 4096];

        loop {
            match reader.read(&mut temp) {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.extend_from_slice(&temp[..n]),
            }

            while let Some((message, consumed)) = try_parse_message(&buffer) {
                buffer.drain(..consumed);

                let Ok(request) = serde_json::from_str::<Request>(&message) else {
                    continue;
                };

                self.handle_message(request);
            }
        }
    }

    fn handle_message(&mut self, request: Request) {
        let Some(method) = request.method.clone() else {
            return;
        };

        if request.id.is_some() {
            self.handle_request(&method, request);
        } else {
            self.handle_notification(&method, &request.params);
        }
    }

    fn handle_request(&mut self, method: &str, request: Request) {
        let Some(id) = request.id else { return };

        // Check hang_on — never respond
        if self.args.hang_on.iter().any(|m| m == method) {
            return;
        }

        // Check fail_on — return `InternalError`
        if self.args.fail_on.iter().any(|m| m == method) {
            self.send_response(&Response {
                jsonrpc: "2.0".to_string(),
                id,
                result: None,
                error: Some(RpcError {
                    code: -32603,
                    message: format!("mockls: configured to fail on {method}"),
                }),
            });
            return;
        }

        let result = match method {
            "initialize" => Some(handle_initialize()),
            "shutdown" => Some(Value::Null),
            "textDocument/hover" => self.observe(&request.params, &id),
            "textDocument/definition" => self.handle_definition(&request.params),
            _ => {
                self.send_response(&Response {
                    jsonrpc: "2.0".to_string(),
                    id,
                    result: None,
                    error: Some(RpcError {
                        code: -32601,
                        message: format!("mockls: method not found: {method}"),
                    }),
                });
                return;
            }
        };

        self.send_response(&Response {
            jsonrpc: "2.0".to_string(),
            id,
            result,
            error: None,
        });
    }

    fn handle_notification(&mut self, method: &str, params: &Value) {
        match method {
            "textDocument/didOpen" => {
                if let Some(td) = params.get("textDocument") {
                    let uri = td.get("uri").and_then(Value::as_str).unwrap_or_default();
                    let text = td.get("text").and_then(Value::as_str).unwrap_or_default();
                    self.documents.insert(uri.to_string(), text.to_string());
                    *self.open_counts.entry(uri.to_string()).or_insert(0) += 1;

                    if !self.args.no_diagnostics {
                        self.publish_diagnostics(uri);
                    }
                }
            }
            "textDocument/didChange" => {
                if let Some(td) = params.get("textDocument") {
                    let uri = td.get("uri").and_then(Value::as_str).unwrap_or_default();
                    if let Some(text) = params
                        .get("contentChanges")
                        .and_then(Value::as_array)
                        .and_then(|arr| arr.last())
                        .and_then(|c| c.get("text"))
                        .and_then(Value::as_str)
                    {
                        self.documents.insert(uri.to_string(), text.to_string());
                    }
                }
            }
            "textDocument/didSave" => {
                if let Some(td) = params.get("textDocument") {
                    let uri = td.get("uri").and_then(Value::as_str).unwrap_or_default();
                    *self.save_counts.entry(uri.to_string()).or_insert(0) += 1;
                }
            }
            "exit" => {
                std::process::exit(0);
            }
            // workspace/didChangeWorkspaceFolders and all others are silently accepted
            _ => {}
        }
    }

    /// Builds the echo result for position requests: the URI exactly as this
    /// server received it (once under the translatable `uri` key and once
    /// under `sawUri`, which the proxy leaves alone), the raw request id,
    /// and the recorded document state.
    fn observe(&self, params: &Value, id: &Value) -> Option<Value> {
        let uri = params
            .get("textDocument")
            .and_then(|td| td.get("uri"))
            .and_then(Value::as_str)?;

        Some(serde_json::json!({
            "uri": uri,
            "sawUri": uri,
            "requestId": id,
            "text": self.documents.get(uri),
            "opens": self.open_counts.get(uri).copied().unwrap_or(0),
            "saves": self.save_counts.get(uri).copied().unwrap_or(0),
        }))
    }

    fn handle_definition(&self, params: &Value) -> Option<Value> {
        let uri = params
            .get("textDocument")
            .and_then(|td| td.get("uri"))
            .and_then(Value::as_str)?;

        Some(serde_json::json!({
            "uri": uri,
            "range": {
                "start": { "line": 0, "character": 0 },
                "end": { "line": 0, "character": 1 }
            }
        }))
    }

    fn publish_diagnostics(&self, uri: &str) {
        send_message(
            &self.writer,
            &serde_json::json!({
                "jsonrpc": "2.0",
                "method": "textDocument/publishDiagnostics",
                "params": {
                    "uri": uri,
                    "diagnostics": [{
                        "range": {
                            "start": { "line": 0, "character": 0 },
                            "end": { "line": 0, "character": 1 }
                        },
                        "severity": 2,
                        "source": "mockls",
                        "message": "mockls: mock diagnostic"
                    }]
                }
            }),
        );
    }

    fn send_response(&mut self, response: &Response) {
        let Ok(json) = serde_json::to_string(response) else {
            return;
        };

        write_framed(&self.writer, &json);
    }
}

fn handle_initialize() -> Value {
    serde_json::json!({
        "capabilities": {
            "hoverProvider": true,
            "definitionProvider": true,
            "textDocumentSync": {
                "openClose": true,
                "change": 1,
                "save": { "includeText": false }
            },
            "workspace": {
                "workspaceFolders": {
                    "supported": true,
                    "changeNotifications": true
                }
            }
        }
    })
}

/// Write a Content-Length framed JSON string.
fn write_framed(writer: &Writer, json: &str) {
    let header = format!("Content-Length: {}\r\n\r\n", json.len());
    let Ok(mut w) = writer.lock() else { return };
    let _ = w.write_all(header.as_bytes());
    let _ = w.write_all(json.as_bytes());
    let _ = w.flush();
}

/// Send a JSON-RPC message to the client.
fn send_message(writer: &Writer, value: &Value) {
    let Ok(json) = serde_json::to_string(value) else {
        return;
    };
    write_framed(writer, &json);
}

/// Parse a Content-Length framed message from a buffer.
/// Returns the message string and the number of bytes consumed.
fn try_parse_message(buffer: &[u8]) -> Option<(String, usize)> {
    let header_end = buffer.windows(4).position(|w| w == b"\r\n\r\n")?;
    let headers = std::str::from_utf8(&buffer[..header_end]).ok()?;

    let mut content_length: Option<usize> = None;
    for line in headers.lines() {
        if line.to_ascii_lowercase().starts_with("content-length:") {
            content_length = line
                .split_once(':')
                .and_then(|(_, v)| v.trim().parse().ok());
        }
    }

    let content_length = content_length?;
    let total = header_end + 4 + content_length;

    if buffer.len() < total {
        return None;
    }

    let body = std::str::from_utf8(&buffer[header_end + 4..total]).ok()?;
    Some((body.to_string(), total))
}

fn main() {
    let args = Args::parse();
    let writer = stdout_writer();
    let mut server = MockServer::new(args, writer);
    let mut stdin = std::io::stdin().lock();
    server.run(&mut stdin);
}

#[cfg(test)]
#[allow(
    clippy::expect_used,
    clippy::unwrap_used,
    reason = "Tests use expect/unwrap for clear failure messages"
)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn default_args() -> Args {
        Args {
            fail_on: vec![],
            hang_on: vec![],
            no_diagnostics: false,
        }
    }

    fn frame(body: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
    }

    fn extract_messages(data: &[u8]) -> Vec<Value> {
        let mut messages = Vec::new();
        let mut buf = data.to_vec();
        while let Some((msg, consumed)) = try_parse_message(&buf) {
            if let Ok(v) = serde_json::from_str::<Value>(&msg) {
                messages.push(v);
            }
            buf.drain(..consumed);
        }
        messages
    }

    fn run_server_with(args: Args, input: &[u8]) -> Vec<Value> {
        let (writer, buf) = buffer_writer();
        let mut server = MockServer::new(args, writer);
        let mut reader = Cursor::new(input.to_vec());
        server.run(&mut reader);
        let data = buf
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        extract_messages(&data)
    }

    fn initialize_request(id: u64) -> String {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "initialize",
            "params": {
                "processId": null,
                "capabilities": {},
                "rootUri": "file:///tmp/test"
            }
        })
        .to_string()
    }

    fn did_open_notification(uri: &str, text: &str) -> String {
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": "textDocument/didOpen",
            "params": {
                "textDocument": {
                    "uri": uri,
                    "languageId": "python",
                    "version": 1,
                    "text": text
                }
            }
        })
        .to_string()
    }

    fn hover_request(id: Value, uri: &str) -> String {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "textDocument/hover",
            "params": {
                "textDocument": { "uri": uri },
                "position": { "line": 0, "character": 0 }
            }
        })
        .to_string()
    }

    #[test]
    fn test_initialize_response_valid() {
        let input = frame(&initialize_request(1));

        let messages = run_server_with(default_args(), &input);

        assert!(!messages.is_empty(), "Expected at least one response");
        let resp = &messages[0];
        assert_eq!(resp["id"], 1);
        assert_eq!(resp["result"]["capabilities"]["hoverProvider"], true);
        assert_eq!(
            resp["result"]["capabilities"]["workspace"]["workspaceFolders"]["supported"],
            true
        );
        assert!(resp["error"].is_null(), "Expected no error");
    }

    #[test]
    fn test_hover_echoes_uri_id_and_text() {
        let uri = "file:///tmp/a.py";
        let mut input = frame(&initialize_request(1));
        input.extend(frame(&did_open_notification(uri, "print(1)\n")));
        input.extend(frame(&hover_request(serde_json::json!("0"), uri)));

        let messages = run_server_with(default_args(), &input);

        let hover = messages
            .iter()
            .find(|m| m.get("id").and_then(Value::as_str) == Some("0"))
            .expect("hover response with id \"0\"");
        assert_eq!(hover["result"]["uri"], uri);
        assert_eq!(hover["result"]["sawUri"], uri);
        assert_eq!(hover["result"]["requestId"], "0");
        assert_eq!(hover["result"]["text"], "print(1)\n");
        assert_eq!(hover["result"]["opens"], 1);
    }

    #[test]
    fn test_did_open_counts_accumulate() {
        let uri = "file:///tmp/a.py";
        let mut input = frame(&initialize_request(1));
        input.extend(frame(&did_open_notification(uri, "x")));
        input.extend(frame(&did_open_notification(uri, "y")));
        input.extend(frame(&hover_request(serde_json::json!(2), uri)));

        let messages = run_server_with(default_args(), &input);

        let hover = messages
            .iter()
            .find(|m| m.get("id").and_then(Value::as_u64) == Some(2))
            .expect("hover response with id 2");
        assert_eq!(hover["result"]["opens"], 2);
        assert_eq!(hover["result"]["text"], "y");
    }

    #[test]
    fn test_diagnostics_published_on_did_open() {
        let uri = "file:///tmp/a.py";
        let mut input = frame(&initialize_request(1));
        input.extend(frame(&did_open_notification(uri, "x")));

        let messages = run_server_with(default_args(), &input);

        let diag = messages
            .iter()
            .find(|m| {
                m.get("method").and_then(Value::as_str) == Some("textDocument/publishDiagnostics")
            })
            .expect("publishDiagnostics notification");
        assert_eq!(diag["params"]["uri"], uri);
        assert_eq!(diag["params"]["diagnostics"][0]["source"], "mockls");
    }

    #[test]
    fn test_no_diagnostics_flag_suppresses_them() {
        let mut args = default_args();
        args.no_diagnostics = true;

        let mut input = frame(&initialize_request(1));
        input.extend(frame(&did_open_notification("file:///tmp/a.py", "x")));

        let messages = run_server_with(args, &input);
        assert!(
            !messages
                .iter()
                .any(|m| m.get("method").is_some()),
            "Expected no notifications"
        );
    }

    #[test]
    fn test_fail_on_returns_internal_error() {
        let mut args = default_args();
        args.fail_on = vec!["textDocument/hover".to_string()];

        let mut input = frame(&initialize_request(1));
        input.extend(frame(&hover_request(serde_json::json!(2), "file:///x")));

        let messages = run_server_with(args, &input);

        let resp = messages
            .iter()
            .find(|m| m.get("id").and_then(Value::as_u64) == Some(2))
            .expect("error response with id 2");
        assert_eq!(resp["error"]["code"], -32603);
    }

    #[test]
    fn test_hang_on_never_responds() {
        let mut args = default_args();
        args.hang_on = vec!["textDocument/hover".to_string()];

        let mut input = frame(&initialize_request(1));
        input.extend(frame(&hover_request(serde_json::json!(2), "file:///x")));

        let messages = run_server_with(args, &input);
        assert!(
            !messages
                .iter()
                .any(|m| m.get("id").and_then(Value::as_u64) == Some(2)),
            "Expected no response for the hung method"
        );
    }

    #[test]
    fn test_unknown_method_not_found() {
        let mut input = frame(&initialize_request(1));
        input.extend(frame(
            &serde_json::json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "textDocument/rename",
                "params": {}
            })
            .to_string(),
        ));

        let messages = run_server_with(default_args(), &input);

        let resp = messages
            .iter()
            .find(|m| m.get("id").and_then(Value::as_u64) == Some(2))
            .expect("error response with id 2");
        assert_eq!(resp["error"]["code"], -32601);
    }

    #[test]
    fn test_request_id_form_is_echoed() {
        let mut input = frame(&initialize_request(42));
        input.extend(frame(&hover_request(
            serde_json::json!("string-id"),
            "file:///x",
        )));

        let messages = run_server_with(default_args(), &input);

        assert_eq!(messages[0]["id"], 42, "Init should echo numeric id");
        let hover = messages
            .iter()
            .find(|m| m.get("id").and_then(Value::as_str) == Some("string-id"));
        assert!(hover.is_some(), "Hover should echo string id");
    }
}
