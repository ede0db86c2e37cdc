//! Wire protocol for crawl daemon communication.
//!
//! Uses MessagePack for efficient serialization over Unix sockets.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Request from the engine to the crawl daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    /// Files changed or removed under a root since a checkpoint.
    ///
    /// With `since = None` the daemon answers with a full listing and a
    /// set fresh-instance flag.
    Query {
        root: PathBuf,
        since: Option<String>,
        extensions: Vec<String>,
        #[serde(default)]
        compute_hash: bool,
    },

    /// Get daemon status
    Status,

    /// Graceful shutdown
    Shutdown,

    /// Ping for health check
    Ping,
}

/// One file observation inside a query answer.
///
/// Paths are relative to the queried root. `exists = false` reports a
/// deletion since the checkpoint; the remaining stat fields are zeroed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDelta {
    pub path: PathBuf,
    pub exists: bool,
    #[serde(default)]
    pub mtime: u64,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Answer to a [`Request::Query`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Opaque checkpoint token to hand back on the next query
    pub clock: String,
    /// The listing is complete, not a delta against `since`
    pub is_fresh: bool,
    pub files: Vec<FileDelta>,
}

/// Response from daemon to the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// Success with optional data
    Ok {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<ResponseData>,
    },

    /// Acknowledgment for fire-and-forget requests
    Ack,

    /// Error response
    Error { code: ErrorCode, message: String },
}

impl Response {
    /// Create a success response with no data
    pub fn ok() -> Self {
        Response::Ok { data: None }
    }

    /// Create a success response with data
    pub fn ok_with(data: ResponseData) -> Self {
        Response::Ok { data: Some(data) }
    }

    /// Create an acknowledgment response
    pub fn ack() -> Self {
        Response::Ack
    }

    /// Create an error response
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
        }
    }
}

/// Response data variants
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseData {
    /// Query answer
    Query { result: QueryResult },

    /// Daemon status
    Status {
        version: String,
        uptime_secs: u64,
        roots_watched: usize,
        #[serde(default)]
        requests_total: u64,
    },

    /// Pong response
    Pong { timestamp: i64 },
}

/// Error codes for error responses
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Request format is invalid
    InvalidRequest,
    /// The queried root is not watched by the daemon
    UnknownRoot,
    /// Internal daemon error
    InternalError,
    /// Operation timed out
    Timeout,
    /// Daemon is shutting down
    ShuttingDown,
}
