// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Per-connection JSON-RPC dispatcher.
//!
//! A [`Connection`] owns one side of the proxy: a reader task that decodes
//! frames off the byte stream, a shared writer for outbound frames, and a
//! table of in-flight outbound requests awaiting responses. Inbound requests
//! and notifications are delivered through an unbounded channel; the session
//! spawns one task per delivered message, so nothing here imposes ordering
//! between handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{Context, Result, anyhow};
use bytes::BytesMut;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::protocol::{
    self, NotificationMessage, RequestId, RequestMessage, ResponseError, ResponseMessage,
};

/// An inbound request or notification, decoded off the wire.
#[derive(Debug)]
pub struct InboundMessage {
    /// The request id; `None` for notifications.
    pub id: Option<RequestId>,
    /// The method name.
    pub method: String,
    /// The parameters, `Null` when absent.
    pub params: Value,
}

impl InboundMessage {
    /// Whether this message expects no response.
    #[must_use]
    pub const fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Why a [`Connection::call`] did not produce a result.
#[derive(Debug)]
pub enum CallError {
    /// The peer answered with a JSON-RPC error object.
    Rpc(ResponseError),
    /// The connection closed (or was canceled) before a response arrived.
    Closed,
    /// The request could not be written.
    Transport(anyhow::Error),
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rpc(e) => write!(f, "peer returned error {}: {}", e.code, e.message),
            Self::Closed => write!(f, "connection closed before a response arrived"),
            Self::Transport(e) => write!(f, "transport failure: {e}"),
        }
    }
}

impl std::error::Error for CallError {}

type PendingCalls = Mutex<HashMap<RequestId, oneshot::Sender<ResponseMessage>>>;

/// One framed JSON-RPC connection: reader task, writer, and in-flight
/// request table.
pub struct Connection {
    peer: &'static str,
    /// Session trace id; `Some` enables on-wire frame logging.
    trace: Option<String>,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: PendingCalls,
    next_id: AtomicI64,
    closed: CancellationToken,
}

impl Connection {
    /// Starts a connection over the given byte-duplex transport.
    ///
    /// `peer` names the far side for logs ("client" or "server"). Returns the
    /// connection handle plus the channel on which inbound requests and
    /// notifications arrive. When the returned receiver yields `None`, the
    /// connection is gone.
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        peer: &'static str,
        trace: Option<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<InboundMessage>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let conn = Arc::new(Self {
            peer,
            trace,
            writer: Mutex::new(Box::new(writer)),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            closed: CancellationToken::new(),
        });

        tokio::spawn(conn.clone().read_loop(reader, inbound_tx));

        (conn, inbound_rx)
    }

    /// Sends a request and waits for the matching response.
    ///
    /// With `pinned_id` the request goes out under exactly that id; otherwise
    /// a fresh id is allocated from the connection's counter. The wait has no
    /// timeout: it ends when the response arrives or the connection closes.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        pinned_id: Option<RequestId>,
    ) -> Result<Value, CallError> {
        let id = pinned_id
            .unwrap_or_else(|| RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst)));

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.contains_key(&id) {
                // Two in-flight requests must never share an id on one
                // connection; this is a caller bug, not a peer failure.
                error!(
                    "outbound request id {id} already in flight on {} connection",
                    self.peer
                );
                return Err(CallError::Transport(anyhow!(
                    "duplicate in-flight request id {id}"
                )));
            }
            pending.insert(id.clone(), tx);
        }

        let request = RequestMessage {
            jsonrpc: "2.0".to_string(),
            id: id.clone(),
            method: method.to_string(),
            params,
        };

        if let Err(e) = self.send(&request).await {
            self.pending.lock().await.remove(&id);
            return Err(CallError::Transport(e));
        }

        tokio::select! {
            response = rx => match response {
                Ok(response) => {
                    if let Some(error) = response.error {
                        Err(CallError::Rpc(error))
                    } else {
                        Ok(response.result.unwrap_or(Value::Null))
                    }
                }
                // Sender dropped: the reader task cleared the table on close.
                Err(_) => Err(CallError::Closed),
            },
            () = self.closed.cancelled() => {
                self.pending.lock().await.remove(&id);
                Err(CallError::Closed)
            }
        }
    }

    /// Sends a notification; returns once the frame is written.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let notification = NotificationMessage {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        };
        self.send(&notification).await
    }

    /// Sends a success response for an inbound request.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub async fn reply(&self, id: RequestId, result: Value) -> Result<()> {
        let response = ResponseMessage {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        };
        self.send(&response).await
    }

    /// Sends an error response for an inbound request.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub async fn reply_error(&self, id: RequestId, error: ResponseError) -> Result<()> {
        let response = ResponseMessage {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: None,
            error: Some(error),
        };
        self.send(&response).await
    }

    /// Closes the connection. In-flight calls resolve with [`CallError::Closed`].
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Resolves when the connection has closed (either side).
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Whether the connection has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Serializes and writes one framed message.
    async fn send<T: serde::Serialize>(&self, message: &T) -> Result<()> {
        let body = serde_json::to_string(message).context("serializing outbound message failed")?;

        if let Some(tag) = &self.trace {
            info!("TRACE {tag} {} send: {body}", self.peer);
        }

        let framed = protocol::frame(&body);
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&framed)
            .await
            .with_context(|| format!("writing to {} connection failed", self.peer))?;
        writer
            .flush()
            .await
            .with_context(|| format!("flushing {} connection failed", self.peer))?;
        Ok(())
    }

    /// Reader task: decodes frames and routes them until EOF, a read error,
    /// an unrecoverable framing error, or cancellation.
    async fn read_loop<R>(
        self: Arc<Self>,
        mut reader: R,
        inbound: mpsc::UnboundedSender<InboundMessage>,
    ) where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut buffer = BytesMut::with_capacity(8192);
        let mut temp = [0u8; 4096];

        'outer: loop {
            let n = tokio::select! {
                () = self.closed.cancelled() => break,
                read = reader.read(&mut temp) => match read {
                    Ok(0) => {
                        debug!("{} connection closed by peer", self.peer);
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!("error reading from {} connection: {e}", self.peer);
                        break;
                    }
                },
            };
            buffer.extend_from_slice(&temp[..n]);

            loop {
                let message = match protocol::try_parse_message(&mut buffer) {
                    Ok(Some(message)) => message,
                    Ok(None) => break,
                    Err(e) => {
                        // The frame boundary is lost; nothing after this point
                        // on the stream can be trusted.
                        warn!(
                            "unrecoverable framing error on {} connection: {e:#}",
                            self.peer
                        );
                        break 'outer;
                    }
                };

                if let Some(tag) = &self.trace {
                    info!("TRACE {tag} {} recv: {message}", self.peer);
                }

                // A malformed body is logged and skipped; framing is intact,
                // so the connection continues.
                let value: Value = match serde_json::from_str(&message) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("malformed JSON body on {} connection: {e}", self.peer);
                        continue;
                    }
                };

                self.route(value, &inbound).await;
            }
        }

        self.closed.cancel();
        // Dropping the pending senders wakes every in-flight call with Closed.
        self.pending.lock().await.clear();
        let _ = self.writer.lock().await.shutdown().await;
    }

    /// Routes one decoded message: responses to their waiters, everything
    /// else to the inbound channel.
    async fn route(&self, value: Value, inbound: &mpsc::UnboundedSender<InboundMessage>) {
        if let Some(method) = value.get("method").and_then(Value::as_str) {
            let message = InboundMessage {
                id: value
                    .get("id")
                    .cloned()
                    .and_then(|v| serde_json::from_value(v).ok()),
                method: method.to_string(),
                params: value.get("params").cloned().unwrap_or(Value::Null),
            };
            // A dropped receiver means the session is tearing down.
            let _ = inbound.send(message);
        } else if value.get("id").is_some() {
            match serde_json::from_value::<ResponseMessage>(value) {
                Ok(response) => {
                    let Some(id) = response.id.clone() else {
                        warn!("response with null id on {} connection", self.peer);
                        return;
                    };
                    let waiter = self.pending.lock().await.remove(&id);
                    if let Some(sender) = waiter {
                        let _ = sender.send(response);
                    } else {
                        warn!(
                            "response for unknown request id {id} on {} connection",
                            self.peer
                        );
                    }
                }
                Err(e) => warn!("malformed response on {} connection: {e}", self.peer),
            }
        } else {
            warn!("message with neither method nor id on {} connection", self.peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    type Spawned = (Arc<Connection>, mpsc::UnboundedReceiver<InboundMessage>);

    /// Two connections wired back-to-back through an in-memory pipe.
    fn pair() -> (Spawned, Spawned) {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (left_read, left_write) = tokio::io::split(left);
        let (right_read, right_write) = tokio::io::split(right);
        (
            Connection::spawn(left_read, left_write, "client", None),
            Connection::spawn(right_read, right_write, "server", None),
        )
    }

    #[tokio::test]
    async fn test_call_and_reply() -> Result<()> {
        let ((left, _left_rx), (right, mut right_rx)) = pair();

        tokio::spawn(async move {
            if let Some(msg) = right_rx.recv().await {
                assert_eq!(msg.method, "ping");
                if let Some(id) = msg.id {
                    let _ = right.reply(id, json!({"pong": true})).await;
                }
            }
        });

        let result = timeout(
            Duration::from_secs(5),
            left.call("ping", json!({}), None),
        )
        .await??;
        assert_eq!(result, json!({"pong": true}));
        Ok(())
    }

    #[tokio::test]
    async fn test_pinned_id_is_used_on_the_wire() -> Result<()> {
        let ((left, _left_rx), (right, mut right_rx)) = pair();

        tokio::spawn(async move {
            if let Some(msg) = right_rx.recv().await {
                assert_eq!(msg.id, Some(RequestId::String("abc".into())));
                if let Some(id) = msg.id {
                    let _ = right.reply(id, Value::Null).await;
                }
            }
        });

        let result = timeout(
            Duration::from_secs(5),
            left.call("ping", json!({}), Some(RequestId::String("abc".into()))),
        )
        .await??;
        assert_eq!(result, Value::Null);
        Ok(())
    }

    #[tokio::test]
    async fn test_notify_delivers_without_reply() -> Result<()> {
        let ((left, _left_rx), (_right, mut right_rx)) = pair();

        left.notify("textDocument/didSave", json!({"textDocument": {"uri": "file:///x"}}))
            .await?;

        let msg = timeout(Duration::from_secs(5), right_rx.recv())
            .await?
            .context("notification not delivered")?;
        assert!(msg.is_notification());
        assert_eq!(msg.method, "textDocument/didSave");
        Ok(())
    }

    #[tokio::test]
    async fn test_error_reply_surfaces_as_rpc_error() -> Result<()> {
        let ((left, _left_rx), (right, mut right_rx)) = pair();

        tokio::spawn(async move {
            if let Some(msg) = right_rx.recv().await
                && let Some(id) = msg.id
            {
                let _ = right
                    .reply_error(
                        id,
                        ResponseError {
                            code: -32601,
                            message: "method not found".into(),
                            data: None,
                        },
                    )
                    .await;
            }
        });

        let err = timeout(
            Duration::from_secs(5),
            left.call("nope", Value::Null, None),
        )
        .await?
        .expect_err("expected an error response");
        match err {
            CallError::Rpc(e) => {
                assert_eq!(e.code, -32601);
                assert_eq!(e.message, "method not found");
            }
            other => panic!("expected Rpc error, got {other}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_peer_close_aborts_pending_call() -> Result<()> {
        let ((left, _left_rx), (right, mut right_rx)) = pair();

        tokio::spawn(async move {
            // Swallow the request, then hang up without replying.
            let _ = right_rx.recv().await;
            right.close();
        });

        let err = timeout(
            Duration::from_secs(5),
            left.call("hang", Value::Null, None),
        )
        .await?
        .expect_err("expected the call to abort");
        assert!(matches!(err, CallError::Closed));
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_calls_resolve_independently() -> Result<()> {
        let ((left, _left_rx), (right, mut right_rx)) = pair();

        tokio::spawn(async move {
            // Answer the two requests in reverse arrival order.
            let first = right_rx.recv().await;
            let second = right_rx.recv().await;
            for msg in [second, first].into_iter().flatten() {
                if let Some(id) = msg.id {
                    let _ = right.reply(id, json!({"method": msg.method})).await;
                }
            }
        });

        let (a, b) = tokio::join!(
            timeout(Duration::from_secs(5), left.call("alpha", Value::Null, None)),
            timeout(Duration::from_secs(5), left.call("beta", Value::Null, None)),
        );
        assert_eq!(a??, json!({"method": "alpha"}));
        assert_eq!(b??, json!({"method": "beta"}));
        Ok(())
    }
}
