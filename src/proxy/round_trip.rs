// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Forwards one inbound message to the peer connection and relays the
//! outcome back.
//!
//! A round trip rewrites URIs on the way out, optionally rewrites the
//! JSON-RPC id, forwards, awaits the peer's response (requests only),
//! rewrites URIs on the way back, and replies on the originating connection
//! under the original inbound id. Notifications are one-way. Any number of
//! round trips may be in flight concurrently on one session; the only state
//! they share is the session's id counter and the connection dispatch
//! tables.

use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{Context, Result, anyhow};

use crate::config::IdRewrite;
use crate::rpc::{CallError, Connection, INTERNAL_ERROR, InboundMessage, RequestId, ResponseError};

use super::rewrite::{UriTranslator, rewrite_tree};
use super::session::OpenTracker;

/// One message crossing from `src` to `dest`.
pub(crate) struct RoundTrip<'a> {
    pub src: &'a Connection,
    pub dest: &'a Connection,
    /// Applied to URI fields on the way out.
    pub outbound: UriTranslator,
    /// Applied to URI fields on the response's way back.
    pub inbound: UriTranslator,
    pub id_policy: IdRewrite,
    /// Session-scoped counter feeding the `string`/`number` rewrite modes.
    pub request_ids: &'a AtomicI64,
    /// When set, client→server traffic manufactures `textDocument/didOpen`
    /// notifications for newly seen files before the message is forwarded.
    pub synthetic_open: Option<&'a OpenTracker>,
}

impl RoundTrip<'_> {
    pub async fn run(self, msg: InboundMessage) -> Result<()> {
        let InboundMessage { id, method, mut params } = msg;

        let translated = rewrite_tree(&mut params, &self.outbound);

        if let Some(tracker) = self.synthetic_open {
            // Failures inside are logged there and never abort the trigger.
            tracker.flush(self.dest, &translated).await;
        }

        let Some(inbound_id) = id else {
            return self
                .dest
                .notify(&method, params)
                .await
                .with_context(|| format!("forwarding notification {method} failed"));
        };

        let outbound_id = next_outbound_id(self.id_policy, self.request_ids, &inbound_id);

        match self.dest.call(&method, params, Some(outbound_id)).await {
            Ok(mut result) => {
                rewrite_tree(&mut result, &self.inbound);
                self.src
                    .reply(inbound_id, result)
                    .await
                    .with_context(|| format!("replying to {method} on source failed"))
            }
            Err(err) => {
                // Peer error objects travel back verbatim; everything else
                // (cancellation, transport loss) becomes an internal error.
                let response_error = match err {
                    CallError::Rpc(e) => e,
                    other => ResponseError {
                        code: INTERNAL_ERROR,
                        message: other.to_string(),
                        data: None,
                    },
                };
                let failure = anyhow!(
                    "calling {method} on peer failed: {} (code {})",
                    response_error.message,
                    response_error.code
                );

                // The caller logs the peer failure even when the error reply
                // lands; if the reply also fails, surface both.
                match self.src.reply_error(inbound_id, response_error).await {
                    Ok(()) => Err(failure),
                    Err(reply_err) => Err(failure.context(format!(
                        "additionally, delivering the error reply failed: {reply_err}"
                    ))),
                }
            }
        }
    }
}

/// Picks the id a forwarded request goes out under.
fn next_outbound_id(policy: IdRewrite, counter: &AtomicI64, inbound: &RequestId) -> RequestId {
    match policy {
        IdRewrite::None => inbound.clone(),
        // Both rewrite modes deliberately break `$/cancelRequest` and
        // `$/partialResult` correlation; see the configuration docs.
        IdRewrite::String => {
            RequestId::String(counter.fetch_add(1, Ordering::SeqCst).to_string())
        }
        IdRewrite::Number => RequestId::Number(counter.fetch_add(1, Ordering::SeqCst)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_policy_none_preserves_form() {
        let counter = AtomicI64::new(0);
        let id = next_outbound_id(IdRewrite::None, &counter, &RequestId::Number(7));
        assert_eq!(id, RequestId::Number(7));
        let id = next_outbound_id(IdRewrite::None, &counter, &RequestId::String("x".into()));
        assert_eq!(id, RequestId::String("x".into()));
        // The counter is untouched in pass-through mode.
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_id_policy_string_counts_from_zero() {
        let counter = AtomicI64::new(0);
        let inbound = RequestId::Number(7);
        assert_eq!(
            next_outbound_id(IdRewrite::String, &counter, &inbound),
            RequestId::String("0".into())
        );
        assert_eq!(
            next_outbound_id(IdRewrite::String, &counter, &inbound),
            RequestId::String("1".into())
        );
    }

    #[test]
    fn test_id_policy_number_is_monotonic() {
        let counter = AtomicI64::new(0);
        let inbound = RequestId::String("seven".into());
        assert_eq!(
            next_outbound_id(IdRewrite::Number, &counter, &inbound),
            RequestId::Number(0)
        );
        assert_eq!(
            next_outbound_id(IdRewrite::Number, &counter, &inbound),
            RequestId::Number(1)
        );
    }

    #[test]
    fn test_rewritten_ids_are_distinct_across_threads() {
        let counter = std::sync::Arc::new(AtomicI64::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                (0..100)
                    .map(|_| {
                        next_outbound_id(IdRewrite::Number, &counter, &RequestId::Number(1))
                    })
                    .collect::<Vec<_>>()
            }));
        }
        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            for id in handle.join().expect("thread panicked") {
                assert!(seen.insert(id), "duplicate outbound id");
            }
        }
        assert_eq!(seen.len(), 800);
    }
}
