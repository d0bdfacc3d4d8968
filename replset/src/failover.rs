// Copyright 2020 Replset Developers

//! How a node reacts to a failed operation.

use derive_more::Display;
use slog::{debug, warn};

use crate::connection::{Connection, Transport};
use crate::error::Error;
use crate::node::Node;

/// The failover strategies. Each error kind maps to exactly one.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum Failover {
    /// Return the error unchanged.
    Ignore,
    /// Reconnect and run the operation once more. If that fails too, mark
    /// the node down.
    Retry,
    /// Translate replica set reconfiguration signatures into
    /// `ReplicaSetReconfigured`.
    Reconfigure,
    /// Drop the node's sockets and report a socket error.
    Disconnect,
}

impl Failover {
    pub fn classify(error: &Error) -> Failover {
        match error {
            Error::ConnectionFailure(_) => Failover::Retry,
            Error::OperationFailure { .. } | Error::QueryFailure { .. } => {
                Failover::Reconfigure
            }
            Error::ProtocolError(_) => Failover::Disconnect,
            _ => Failover::Ignore,
        }
    }

    /// Apply the strategy to `error`, which `op` just returned when run on
    /// `conn` against `node`.
    pub fn execute<T, R>(
        self,
        error: Error,
        node: &Node<T>,
        conn: &mut Connection<T>,
        op: &mut dyn FnMut(&mut Connection<T>) -> Result<R, Error>,
    ) -> Result<R, Error>
    where
        T: Transport,
    {
        match self {
            Failover::Ignore => Err(error),
            Failover::Retry => {
                conn.disconnect();
                match node.attempt(conn, op) {
                    Ok(r) => Ok(r),
                    Err(e) if e.is_connection_failure() => {
                        node.down();
                        conn.disconnect();
                        node.disconnect();
                        Err(e)
                    }
                    Err(e) => Err(e),
                }
            }
            Failover::Reconfigure => {
                if error.reconfiguring_replica_set() {
                    debug!(node.log(), "replica set reconfigured";
                        "error" => error.to_string());
                    node.invalidate();
                    Err(Error::ReplicaSetReconfigured {
                        details: error.details().cloned().unwrap_or_default(),
                    })
                } else {
                    Err(error)
                }
            }
            Failover::Disconnect => {
                warn!(node.log(), "disconnecting after socket error";
                    "error" => error.to_string());
                conn.disconnect();
                node.disconnect();
                Err(Error::SocketError(error.to_string()))
            }
        }
    }
}
