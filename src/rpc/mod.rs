// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

/// Per-connection dispatcher: reader task, writer, in-flight request table.
pub mod connection;
/// JSON-RPC message types and `Content-Length` framing.
pub mod protocol;

pub use connection::{CallError, Connection, InboundMessage};
pub use protocol::{
    INTERNAL_ERROR, NotificationMessage, RequestId, RequestMessage, ResponseError, ResponseMessage,
};
