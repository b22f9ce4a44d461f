// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Accept loop and per-session lifecycle.
//!
//! Each accepted client connection gets its own language server child
//! process and its own cache directory under the configured root. When
//! either side disconnects (or shutdown is requested), the supervisor closes
//! the other side, reaps the child, and deletes the cache directory. All
//! sessions are joined before [`Supervisor::run`] returns.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::rpc::Connection;
use crate::workspace::{HookRunner, WorkspaceProvisioner};

use super::session::Session;

/// Accepts client connections and runs one [`Session`] per connection.
pub struct Supervisor {
    settings: Arc<Config>,
    provisioner: Arc<dyn WorkspaceProvisioner>,
    hooks: Arc<dyn HookRunner>,
    /// Language server command and argument vector.
    server_command: Arc<Vec<String>>,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Creates a supervisor.
    ///
    /// # Errors
    ///
    /// Returns an error if `server_command` is empty.
    pub fn new(
        settings: Arc<Config>,
        provisioner: Arc<dyn WorkspaceProvisioner>,
        hooks: Arc<dyn HookRunner>,
        server_command: Vec<String>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        if server_command.is_empty() {
            bail!("a language server command is required");
        }
        Ok(Self {
            settings,
            provisioner,
            hooks,
            server_command: Arc::new(server_command),
            shutdown,
        })
    }

    /// Runs the accept loop until shutdown or a non-temporary accept
    /// failure, then drains active sessions.
    pub async fn run(&self, listener: TcpListener) {
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!("accepted client connection from {peer}");
                        sessions.spawn(serve_connection(
                            self.settings.clone(),
                            self.provisioner.clone(),
                            self.hooks.clone(),
                            self.server_command.clone(),
                            stream,
                            self.shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        if self.shutdown.is_cancelled() {
                            break;
                        }
                        if !is_temporary_accept_error(&e) {
                            error!("fatal error accepting client connections: {e}");
                            break;
                        }
                        // Aborted handshakes and the like; keep listening,
                        // with a pause so a tight failure can't spin.
                        warn!("error accepting client connection: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
            }
        }

        if !sessions.is_empty() {
            info!("draining {} active session(s)", sessions.len());
        }
        while sessions.join_next().await.is_some() {}
    }
}

/// Whether an accept failure is worth retrying. Per-connection conditions
/// (the peer hung up mid-handshake, an interrupted syscall) clear on their
/// own; anything else (exhausted descriptors, a dead listener) will not, and
/// retrying would spin forever.
fn is_temporary_accept_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::TimedOut
    )
}

/// Runs one session from accept to teardown. Failures are logged here; the
/// accept loop never sees them.
async fn serve_connection(
    settings: Arc<Config>,
    provisioner: Arc<dyn WorkspaceProvisioner>,
    hooks: Arc<dyn HookRunner>,
    server_command: Arc<Vec<String>>,
    stream: TcpStream,
    shutdown: CancellationToken,
) {
    let trace_id = Uuid::new_v4();

    let cache_dir = match create_cache_dir(&settings.cache_directory, trace_id).await {
        Ok(dir) => dir,
        Err(e) => {
            warn!("[{trace_id}] preparing cache directory failed: {e:#}");
            return;
        }
    };

    let mut child = match spawn_language_server(&server_command) {
        Ok(child) => child,
        Err(e) => {
            warn!("[{trace_id}] starting language server failed: {e:#}");
            remove_cache_dir(trace_id, &cache_dir).await;
            return;
        }
    };

    // Stdio handles exist because we requested pipes above.
    let server_stdin = child.stdin.take().expect("stdin not captured");
    let server_stdout = child.stdout.take().expect("stdout not captured");

    let trace = settings.trace.then(|| trace_id.to_string());
    let (client_read, client_write) = stream.into_split();
    let (client_conn, client_rx) =
        Connection::spawn(client_read, client_write, "client", trace.clone());
    let (server_conn, server_rx) = Connection::spawn(server_stdout, server_stdin, "server", trace);

    let session = Session::new(
        trace_id,
        client_conn.clone(),
        server_conn.clone(),
        cache_dir.clone(),
        settings,
        provisioner,
        hooks,
    );
    info!("[{trace_id}] session started ({})", cache_dir.display());

    tokio::select! {
        () = session.run(client_rx, server_rx) => {}
        () = shutdown.cancelled() => {
            client_conn.close();
            server_conn.close();
        }
    }

    // The child may already have exited with its stdin; reap either way.
    let _ = child.start_kill();
    let _ = child.wait().await;

    remove_cache_dir(trace_id, &cache_dir).await;
    info!("[{trace_id}] session closed");
}

/// Creates the per-session cache directory and resolves its symlinks, so the
/// prefix the session translates against matches what the language server
/// sees after its own resolution.
async fn create_cache_dir(root: &Path, trace_id: Uuid) -> Result<PathBuf> {
    let dir = root.join(trace_id.to_string());
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    tokio::fs::canonicalize(&dir)
        .await
        .with_context(|| format!("resolving {}", dir.display()))
}

async fn remove_cache_dir(trace_id: Uuid, dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        warn!(
            "[{trace_id}] removing cache directory {} failed: {e}",
            dir.display()
        );
    }
}

fn spawn_language_server(command: &[String]) -> Result<tokio::process::Child> {
    Command::new(&command[0])
        .args(&command[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| format!("Failed to spawn language server: {}", command[0]))
}
