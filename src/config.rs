/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// How outbound JSON-RPC ids are chosen for forwarded requests.
///
/// `string` and `number` exist for language servers whose JSON-RPC layer
/// only accepts one id form. Both replace the inbound id with a fresh
/// counter value, which breaks `$/cancelRequest` and `$/partialResult`
/// correlation; that trade-off is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IdRewrite {
    /// Outbound id equals the inbound id.
    #[default]
    None,
    /// Outbound id is the decimal string form of the session counter.
    String,
    /// Outbound id is the session counter as an integer.
    Number,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// TCP address the proxy listens on.
    #[serde(default = "default_proxy_address")]
    pub proxy_address: String,

    /// Root under which per-session cache directories are created.
    #[serde(default = "default_cache_directory")]
    pub cache_directory: PathBuf,

    /// Source tree the default provisioner mirrors into each session.
    #[serde(default = "default_workspace_source")]
    pub workspace_source: PathBuf,

    /// Empty disables the hack; non-empty injects synthetic
    /// `textDocument/didOpen` notifications carrying this language id.
    #[serde(default)]
    pub did_open_language: String,

    /// Outbound id policy for forwarded requests.
    #[serde(default)]
    pub jsonrpc2_id_rewrite: IdRewrite,

    /// Colon-separated basename globs limiting which files are provisioned.
    #[serde(default)]
    pub glob: String,

    /// Program run after provisioning, before `initialize` is forwarded.
    #[serde(default)]
    pub before_initialize_hook: Option<PathBuf>,

    /// Log every frame on both connections.
    #[serde(default)]
    pub trace: bool,
}

fn default_proxy_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_cache_directory() -> PathBuf {
    std::env::temp_dir().join("gangway-cache")
}

fn default_workspace_source() -> PathBuf {
    PathBuf::from(".")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy_address: default_proxy_address(),
            cache_directory: default_cache_directory(),
            workspace_source: default_workspace_source(),
            did_open_language: String::new(),
            jsonrpc2_id_rewrite: IdRewrite::None,
            glob: String::new(),
            before_initialize_hook: None,
            trace: false,
        }
    }
}

impl Config {
    /// Load configuration from standard paths or a specific file.
    pub fn load(explicit_file: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // 1. Load from user config directory (~/.config/gangway/config.toml)
        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join("gangway").join("config.toml");
            if config_path.exists() {
                builder = builder.add_source(config::File::from(config_path));
            }
        }

        // 2. Load from explicit file if provided
        if let Some(path) = explicit_file {
            builder = builder.add_source(config::File::from(path));
        }

        // 3. Load from environment variables (GANGWAY_PROXY_ADDRESS, etc.)
        builder = builder.add_source(config::Environment::with_prefix("GANGWAY"));

        let config = builder.build().context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Creates the cache root if absent and resolves its symlinks, so the
    /// prefix handed to sessions matches what a symlink-resolving language
    /// server reports back. Failure here aborts startup.
    pub fn ensure_cache_root(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.cache_directory).with_context(|| {
            format!(
                "cache directory {} could not be created",
                self.cache_directory.display()
            )
        })?;
        self.cache_directory = std::fs::canonicalize(&self.cache_directory).with_context(|| {
            format!(
                "cache directory {} could not be resolved",
                self.cache_directory.display()
            )
        })?;
        Ok(())
    }

    /// The glob option split into individual basename globs. An empty or
    /// all-separator value means "no filter".
    #[must_use]
    pub fn globs(&self) -> Vec<String> {
        self.glob
            .split(':')
            .filter(|glob| !glob.is_empty())
            .map(str::to_string)
            .collect()
    }
}
