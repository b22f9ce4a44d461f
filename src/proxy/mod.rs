// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

/// URI translation between client and cache namespaces.
pub mod rewrite;
/// Forwarding of a single message and its response.
mod round_trip;
/// Per-connection session state and handlers.
pub mod session;
/// Accept loop and session lifecycle.
pub mod supervisor;

pub use rewrite::{UriTranslator, rewrite_tree};
pub use session::Session;
pub use supervisor::Supervisor;
