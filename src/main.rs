// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Gangway CLI entry point.
//!
//! Binds the TCP listener, prepares the cache root, and hands accepted
//! connections to the session supervisor. The language server command is
//! given as trailing positional arguments:
//!
//! ```text
//! gangway --proxy-address 127.0.0.1:8080 --did-open-language python -- pylsp
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gangway::config::{Config, IdRewrite};
use gangway::proxy::Supervisor;
use gangway::workspace::{CommandHookRunner, MirrorProvisioner};

/// Command-line arguments. Every option overrides its config-file and
/// environment counterpart.
#[derive(Parser, Debug)]
#[command(name = "gangway")]
#[command(version = env!("GANGWAY_VERSION"))]
#[command(about = "Transparent LSP proxy that materializes a private workspace per session")]
struct Args {
    /// Proxy listen address (tcp).
    #[arg(long)]
    proxy_address: Option<String>,

    /// Cache directory location; per-session workspaces are created below it.
    #[arg(long)]
    cache_directory: Option<PathBuf>,

    /// Source tree mirrored into each session's workspace.
    #[arg(long)]
    workspace_source: Option<PathBuf>,

    /// If non-empty, send a synthetic 'textDocument/didOpen' notification
    /// with this language id (e.g. 'python') for every file the client
    /// touches. For language servers that refuse requests on unopened files.
    #[arg(long)]
    did_open_language: Option<String>,

    /// Rewrite outbound JSON-RPC ids, for language servers that only accept
    /// one id form. Breaks '$/cancelRequest' and '$/partialResult'.
    #[arg(long, value_enum)]
    jsonrpc2_id_rewrite: Option<IdRewrite>,

    /// Colon-separated basename globs selecting which files to materialize.
    /// Empty means every file.
    #[arg(long)]
    glob: Option<String>,

    /// Program run after provisioning, before 'initialize' is forwarded;
    /// its cwd and single argument are the session cache directory.
    #[arg(long)]
    before_initialize_hook: Option<PathBuf>,

    /// Log every frame on both connections.
    #[arg(long)]
    trace: bool,

    /// Path to configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Language server command and arguments.
    #[arg(trailing_var_arg = true, required = true)]
    server_command: Vec<String>,
}

impl Args {
    /// Folds CLI values over the loaded configuration.
    fn apply_to(self, config: &mut Config) -> Vec<String> {
        if let Some(proxy_address) = self.proxy_address {
            config.proxy_address = proxy_address;
        }
        if let Some(cache_directory) = self.cache_directory {
            config.cache_directory = cache_directory;
        }
        if let Some(workspace_source) = self.workspace_source {
            config.workspace_source = workspace_source;
        }
        if let Some(did_open_language) = self.did_open_language {
            config.did_open_language = did_open_language;
        }
        if let Some(id_rewrite) = self.jsonrpc2_id_rewrite {
            config.jsonrpc2_id_rewrite = id_rewrite;
        }
        if let Some(glob) = self.glob {
            config.glob = glob;
        }
        if let Some(hook) = self.before_initialize_hook {
            config.before_initialize_hook = Some(hook);
        }
        if self.trace {
            config.trace = true;
        }
        self.server_command
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("gangway=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(args.config.clone())?;
    let server_command = args.apply_to(&mut config);

    // Fatal configuration problems (an unresolvable cache root among them)
    // abort before we accept anything.
    config.ensure_cache_root()?;
    let cache_root = config.cache_directory.clone();

    let listener = TcpListener::bind(&config.proxy_address)
        .await
        .context("setting up proxy listener failed")?;
    info!(
        "gangway: accepting connections at {}",
        listener.local_addr()?
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(trap_signals(shutdown.clone()));

    let provisioner = Arc::new(MirrorProvisioner::new(config.workspace_source.clone()));
    let supervisor = Supervisor::new(
        Arc::new(config),
        provisioner,
        Arc::new(CommandHookRunner),
        server_command,
        shutdown,
    )?;

    supervisor.run(listener).await;

    // Sessions each removed their own directory; now drop the root itself.
    if let Err(e) = tokio::fs::remove_dir_all(&cache_root).await {
        warn!("removing cache root {} failed: {e}", cache_root.display());
    }

    Ok(())
}

/// First SIGINT/SIGHUP starts a graceful shutdown; a second one exits
/// immediately.
#[cfg(unix)]
async fn trap_signals(shutdown: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut interrupt), Ok(mut hangup)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::hangup()),
    ) else {
        warn!("installing signal handlers failed; running without them");
        return;
    };

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = hangup.recv() => {}
    }
    info!("shutdown signal received; draining sessions (send again to exit immediately)");
    shutdown.cancel();

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = hangup.recv() => {}
    }
    std::process::exit(0);
}

#[cfg(not(unix))]
async fn trap_signals(shutdown: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received; draining sessions (send again to exit immediately)");
        shutdown.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(0);
        }
    }
}
