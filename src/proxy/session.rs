// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! One proxied client: a client connection, a spawned language server, and a
//! private workspace cache directory, bound together for the lifetime of the
//! connection.
//!
//! The session readiness barrier orders everything: no message is forwarded
//! in either direction until the workspace has been provisioned by the
//! `initialize` handler. Handlers run one task per inbound message with no
//! ordering between them, so two concurrent requests may complete in any
//! order; correlation is by id only.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use lsp_types::DidChangeWorkspaceFoldersParams;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::rpc::{Connection, InboundMessage};
use crate::workspace::{HookRunner, WorkspaceProvisioner};

use super::rewrite::UriTranslator;
use super::round_trip::RoundTrip;

/// Per-session dedup of synthetic `textDocument/didOpen` notifications.
///
/// Some language servers refuse requests for files they have not seen a
/// `didOpen` for, even though the protocol does not require one. When a
/// language id is configured, the proxy manufactures the notification the
/// first time each file crosses from client to server. This is best-effort:
/// no matching `didClose` is ever sent, and read or send failures never
/// abort the request that triggered the open.
pub(crate) struct OpenTracker {
    language: String,
    sent: Mutex<HashSet<PathBuf>>,
}

impl OpenTracker {
    fn new(language: String) -> Self {
        Self {
            language,
            sent: Mutex::new(HashSet::new()),
        }
    }

    /// Check-and-mark under the lock; no I/O happens while it is held.
    /// Paths are marked even if the later read fails, matching "at most one
    /// attempt per path per session".
    fn claim(&self, uris: &[String]) -> Vec<(String, PathBuf)> {
        let mut sent = self.sent.lock().unwrap_or_else(PoisonError::into_inner);
        uris.iter()
            .filter_map(|uri| {
                let path = PathBuf::from(uri.strip_prefix("file://")?);
                sent.insert(path.clone()).then(|| (uri.clone(), path))
            })
            .collect()
    }

    /// Sends `textDocument/didOpen` for every not-yet-seen file in `uris`.
    pub(crate) async fn flush(&self, dest: &Connection, uris: &[String]) {
        for (uri, path) in self.claim(uris) {
            let text = match tokio::fs::read_to_string(&path).await {
                Ok(text) => text,
                Err(e) => {
                    debug!("skipping synthetic didOpen for {}: {e}", path.display());
                    continue;
                }
            };
            let Ok(parsed) = uri.parse::<lsp_types::Uri>() else {
                debug!("skipping synthetic didOpen for unparsable uri {uri}");
                continue;
            };
            let params = lsp_types::DidOpenTextDocumentParams {
                text_document: lsp_types::TextDocumentItem {
                    uri: parsed,
                    language_id: self.language.clone(),
                    version: 1,
                    text,
                },
            };
            match serde_json::to_value(params) {
                Ok(params) => {
                    if let Err(e) = dest.notify("textDocument/didOpen", params).await {
                        warn!("sending synthetic didOpen for {uri} failed: {e:#}");
                    }
                }
                Err(e) => warn!("encoding synthetic didOpen for {uri} failed: {e}"),
            }
        }
    }
}

/// Extracts the client's workspace root path from `initialize` params.
///
/// Prefers `rootUri`, then `rootPath`, then the first entry of
/// `workspaceFolders`. Returns `None` when the client named none of them.
fn client_root_from_initialize(params: &Value) -> Option<String> {
    if let Some(root) = params
        .get("rootUri")
        .and_then(Value::as_str)
        .and_then(|uri| uri.strip_prefix("file://"))
        .filter(|path| !path.is_empty())
    {
        return Some(root.to_string());
    }
    if let Some(root) = params
        .get("rootPath")
        .and_then(Value::as_str)
        .filter(|path| !path.is_empty())
    {
        return Some(root.to_string());
    }
    params
        .get("workspaceFolders")
        .and_then(Value::as_array)
        .and_then(|folders| folders.first())
        .and_then(|folder| folder.get("uri"))
        .and_then(Value::as_str)
        .and_then(|uri| uri.strip_prefix("file://"))
        .filter(|path| !path.is_empty())
        .map(str::to_string)
}

/// A live proxy session.
pub struct Session {
    trace_id: Uuid,
    client: Arc<Connection>,
    server: Arc<Connection>,
    /// Symlink-resolved absolute path of this session's cache directory.
    cache_dir: PathBuf,
    /// Client-space workspace prefix, captured from `initialize`.
    client_root: OnceLock<String>,
    /// Monotonic counter feeding the id rewrite modes.
    request_ids: AtomicI64,
    /// Readiness barrier: `false` until provisioning succeeds.
    ready: watch::Sender<bool>,
    cancel: CancellationToken,
    settings: Arc<Config>,
    provisioner: Arc<dyn WorkspaceProvisioner>,
    hooks: Arc<dyn HookRunner>,
    open_tracker: Option<OpenTracker>,
}

impl Session {
    pub fn new(
        trace_id: Uuid,
        client: Arc<Connection>,
        server: Arc<Connection>,
        cache_dir: PathBuf,
        settings: Arc<Config>,
        provisioner: Arc<dyn WorkspaceProvisioner>,
        hooks: Arc<dyn HookRunner>,
    ) -> Arc<Self> {
        let open_tracker = (!settings.did_open_language.is_empty())
            .then(|| OpenTracker::new(settings.did_open_language.clone()));
        let (ready, _) = watch::channel(false);

        Arc::new(Self {
            trace_id,
            client,
            server,
            cache_dir,
            client_root: OnceLock::new(),
            request_ids: AtomicI64::new(0),
            ready,
            cancel: CancellationToken::new(),
            settings,
            provisioner,
            hooks,
            open_tracker,
        })
    }

    /// The session's trace id.
    #[must_use]
    pub const fn trace_id(&self) -> Uuid {
        self.trace_id
    }

    /// Runs the session until either side disconnects: dispatches every
    /// inbound message onto its own task, then closes both connections.
    pub async fn run(
        self: &Arc<Self>,
        mut client_rx: mpsc::UnboundedReceiver<InboundMessage>,
        mut server_rx: mpsc::UnboundedReceiver<InboundMessage>,
    ) {
        loop {
            tokio::select! {
                msg = client_rx.recv() => match msg {
                    Some(msg) => {
                        let session = self.clone();
                        tokio::spawn(async move { session.handle_client_message(msg).await });
                    }
                    None => break,
                },
                msg = server_rx.recv() => match msg {
                    Some(msg) => {
                        let session = self.clone();
                        tokio::spawn(async move { session.handle_server_message(msg).await });
                    }
                    None => break,
                },
            }
        }

        // One side is gone: release blocked handlers and close the other.
        self.cancel.cancel();
        self.client.close();
        self.server.close();
        info!("[{}] session disconnected", self.trace_id);
    }

    async fn handle_client_message(self: Arc<Self>, msg: InboundMessage) {
        if msg.method == "initialize" && !self.prepare_workspace(&msg.params).await {
            // Provisioning failed: the session stays un-ready and the
            // initialize is never forwarded.
            return;
        }

        if !self.wait_ready().await {
            return;
        }

        if msg.method == "workspace/didChangeWorkspaceFolders"
            && !self.sync_workspace_folders(&msg.params).await
        {
            return;
        }

        let trip = RoundTrip {
            src: self.client.as_ref(),
            dest: self.server.as_ref(),
            outbound: self.client_to_server(),
            inbound: self.server_to_client(),
            id_policy: self.settings.jsonrpc2_id_rewrite,
            request_ids: &self.request_ids,
            synthetic_open: self.open_tracker.as_ref(),
        };
        if let Err(e) = trip.run(msg).await {
            warn!("[{}] client round trip failed: {e:#}", self.trace_id);
        }
    }

    async fn handle_server_message(self: Arc<Self>, msg: InboundMessage) {
        if !self.wait_ready().await {
            return;
        }

        let trip = RoundTrip {
            src: self.server.as_ref(),
            dest: self.client.as_ref(),
            outbound: self.server_to_client(),
            inbound: self.client_to_server(),
            id_policy: self.settings.jsonrpc2_id_rewrite,
            request_ids: &self.request_ids,
            synthetic_open: None,
        };
        if let Err(e) = trip.run(msg).await {
            warn!("[{}] server round trip failed: {e:#}", self.trace_id);
        }
    }

    /// Provisions the workspace for an `initialize` request. On success the
    /// readiness barrier opens and every blocked handler proceeds.
    async fn prepare_workspace(&self, params: &Value) -> bool {
        if let Some(root) = client_root_from_initialize(params) {
            debug!("[{}] client workspace root: {root}", self.trace_id);
            let _ = self.client_root.set(root);
        }

        let globs = self.settings.globs();
        if let Err(e) =
            WorkspaceProvisioner::clone_into(&*self.provisioner, &self.cache_dir, &globs).await
        {
            warn!(
                "[{}] provisioning workspace during initialize failed: {e:#}",
                self.trace_id
            );
            return false;
        }

        // Hook failures are logged but do not block the session.
        if let Some(hook) = &self.settings.before_initialize_hook
            && let Err(e) = self.hooks.run(hook, &self.cache_dir).await
        {
            warn!("[{}] beforeInitializeHook failed: {e:#}", self.trace_id);
        }

        self.ready.send_replace(true);
        true
    }

    /// Reacts to `workspace/didChangeWorkspaceFolders`: per-name removal for
    /// each removed folder, one re-clone when anything was added. Returns
    /// whether the notification should still be forwarded.
    async fn sync_workspace_folders(&self, params: &Value) -> bool {
        let event = match serde_json::from_value::<DidChangeWorkspaceFoldersParams>(params.clone())
        {
            Ok(parsed) => parsed.event,
            Err(e) => {
                // Undecodable payloads skip provisioning but are still
                // forwarded; the server may understand more than we do.
                warn!(
                    "[{}] undecodable didChangeWorkspaceFolders payload: {e}",
                    self.trace_id
                );
                return true;
            }
        };

        for folder in &event.removed {
            if let Err(e) = self.provisioner.remove(&self.cache_dir, &folder.name).await {
                warn!(
                    "[{}] removing workspace {} failed: {e:#}",
                    self.trace_id, folder.name
                );
            }
        }

        if !event.added.is_empty()
            && let Err(e) = WorkspaceProvisioner::clone_into(
                &*self.provisioner,
                &self.cache_dir,
                &self.settings.globs(),
            )
            .await
        {
            warn!(
                "[{}] re-provisioning for added workspace folders failed: {e:#}",
                self.trace_id
            );
            return false;
        }

        true
    }

    /// Blocks until provisioning has completed. Returns `false` when the
    /// session was torn down first.
    async fn wait_ready(&self) -> bool {
        let mut ready = self.ready.subscribe();
        tokio::select! {
            changed = ready.wait_for(|ready| *ready) => changed.is_ok(),
            () = self.cancel.cancelled() => false,
        }
    }

    fn client_root(&self) -> &str {
        self.client_root.get().map_or("/", String::as_str)
    }

    fn client_to_server(&self) -> UriTranslator {
        UriTranslator::new(self.client_root(), self.cache_dir.to_string_lossy())
    }

    fn server_to_client(&self) -> UriTranslator {
        self.client_to_server().inverse()
    }
}
