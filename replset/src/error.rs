// Copyright 2020 Replset Developers

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::protocol::Document;

// Server error codes that mean the node we talked to is no longer (or not
// yet) the primary.
const NOT_MASTER_CODES: [i64; 6] = [10009, 10054, 10056, 10058, 13435, 13436];

// Server error codes that mean the request was rejected for lack of
// authorization.
const UNAUTHORIZED_CODES: [i64; 3] = [13, 10057, 16550];

/// The error type for all fallible operations in this crate.
///
/// The variants fall into three groups that callers usually want to treat
/// differently: *could not reach a node* (`ConnectionFailure`,
/// `SocketError`, `Unavailable`), *a node rejected the request*
/// (`OperationFailure`, `QueryFailure`, `ReplicaSetReconfigured`,
/// `AuthenticationFailure`, `CursorNotFound`), and *the pool is exhausted or
/// misused* (`PoolTimeout`, `PoolSaturated`, `ConnectionInUse`).
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Transport level failure: refused, reset, or timed out.
    #[error("connection failure: {0}")]
    ConnectionFailure(String),
    /// A transport failure of unknown origin after which the node was
    /// disconnected.
    #[error("socket error: {0}")]
    SocketError(String),
    /// The server answered a command but rejected it.
    #[error("operation failed: {}", error_message(.details))]
    OperationFailure { command: Document, details: Document },
    /// The server answered a query with the query failure flag set.
    #[error("query failed: {}", error_message(.details))]
    QueryFailure { details: Document },
    /// The server signalled that the replica set changed shape under us.
    #[error("replica set reconfigured: {}", error_message(.details))]
    ReplicaSetReconfigured { details: Document },
    #[error("authentication failed for database {database}: {}", error_message(.details))]
    AuthenticationFailure { database: String, details: Document },
    #[error("cursor {cursor_id} not found")]
    CursorNotFound { cursor_id: i64 },
    #[error("timed out after {timeout:?} waiting for a connection to {address}")]
    PoolTimeout { address: String, timeout: Duration },
    #[error("no idle connections available for {address}")]
    PoolSaturated { address: String },
    #[error("connection to {address} is already in use by thread {thread}")]
    ConnectionInUse { address: String, thread: String },
    /// No node satisfies the requested read preference.
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// A reply could not be framed or decoded.
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl Error {
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Error::ConnectionFailure(_))
    }

    /// Exhaustion or misuse of a node's connection pool. These are never
    /// failed over or retried.
    pub fn is_pool_error(&self) -> bool {
        matches!(
            self,
            Error::PoolTimeout { .. }
                | Error::PoolSaturated { .. }
                | Error::ConnectionInUse { .. }
        )
    }

    /// The server supplied document attached to the error, if any.
    pub fn details(&self) -> Option<&Document> {
        match self {
            Error::OperationFailure { details, .. }
            | Error::QueryFailure { details }
            | Error::ReplicaSetReconfigured { details }
            | Error::AuthenticationFailure { details, .. } => Some(details),
            _ => None,
        }
    }

    /// Returns true if the error carries a signature of a replica set
    /// reconfiguration, i.e. a "not master" style error code or message.
    pub fn reconfiguring_replica_set(&self) -> bool {
        match self {
            Error::ReplicaSetReconfigured { .. } => true,
            Error::OperationFailure { details, .. }
            | Error::QueryFailure { details } => not_master(details),
            _ => false,
        }
    }

    /// Returns true if refreshing the topology and trying again could
    /// plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        self.is_connection_failure() || self.reconfiguring_replica_set()
    }
}

/// Extracts the server's error message from a reply document. Servers have
/// used `$err`, `err`, and `errmsg` for this over time.
pub fn error_message(details: &Document) -> String {
    ["$err", "err", "errmsg"]
        .iter()
        .filter_map(|key| details.get(*key))
        .find_map(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| Value::Object(details.clone()).to_string())
}

/// Extracts the server's numeric error code from a reply document.
pub fn error_code(details: &Document) -> Option<i64> {
    ["code", "assertionCode"]
        .iter()
        .filter_map(|key| details.get(*key))
        .find_map(Value::as_i64)
}

pub(crate) fn not_master(details: &Document) -> bool {
    if let Some(code) = error_code(details) {
        if NOT_MASTER_CODES.contains(&code) {
            return true;
        }
    }
    let message = error_message(details).to_lowercase();
    message.contains("not master") || message.contains("not primary")
}

pub(crate) fn unauthorized(details: &Document) -> bool {
    if let Some(code) = error_code(details) {
        if UNAUTHORIZED_CODES.contains(&code) {
            return true;
        }
    }
    let message = error_message(details).to_lowercase();
    message.contains("unauthorized") || message.contains("not authorized")
}
