// Copyright 2020 Replset Developers

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::Value;
use slog::{debug, o, warn, Logger};

use crate::address::{NodeAddress, NodeKey};
use crate::auth::{Authenticator, SharedCredentials};
use crate::connection::{Connection, Transport, TransportFactory};
use crate::connection_pool::types::ConnectionPoolOptions;
use crate::connection_pool::ConnectionPool;
use crate::error::Error;
use crate::failover::Failover;
use crate::protocol::{
    Document, Operation, QueryOptions, Reply, UpdateFlags, WireCodec,
    WriteConcern,
};
use crate::resolver::AddressResolver;

/// Tags a node advertises, e.g. `{"dc": "east"}`.
pub type Tags = HashMap<String, String>;

// Weight of the newest sample in the latency average.
const LATENCY_WEIGHT: f64 = 0.2;

/// The role a node last reported.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Unknown,
    Primary,
    Secondary,
}

impl Default for Role {
    fn default() -> Self {
        Role::Unknown
    }
}

impl fmt::Display for Role {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Role::Unknown => String::from("unknown").fmt(fmt),
            Role::Primary => String::from("primary").fmt(fmt),
            Role::Secondary => String::from("secondary").fmt(fmt),
        }
    }
}

/// What the node knows about itself from its last probe.
#[derive(Clone, Debug, Default)]
pub struct NodeState {
    pub role: Role,
    /// Set when the node was found unreachable; cleared by a successful
    /// refresh.
    pub down_at: Option<Instant>,
    pub refreshed_at: Option<Instant>,
    /// Weighted average of probe round trips.
    pub latency: Option<Duration>,
    pub tags: Tags,
    pub set_name: Option<String>,
    pub arbiter: bool,
    pub passive: bool,
    pub hidden: bool,
    pub peers: Vec<String>,
}

// The reply to the topology probe.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IsMaster {
    #[serde(default)]
    ismaster: bool,
    #[serde(default)]
    secondary: bool,
    primary: Option<String>,
    #[serde(default)]
    hosts: Vec<String>,
    #[serde(default)]
    passives: Vec<String>,
    #[serde(default)]
    arbiters: Vec<String>,
    #[serde(default)]
    tags: Tags,
    set_name: Option<String>,
    #[serde(default)]
    arbiter_only: bool,
    #[serde(default)]
    passive: bool,
    #[serde(default)]
    hidden: bool,
}

impl IsMaster {
    fn role(&self) -> Role {
        if self.ismaster {
            Role::Primary
        } else if self.secondary {
            Role::Secondary
        } else {
            Role::Unknown
        }
    }

    fn peers(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.primary
            .iter()
            .chain(self.hosts.iter())
            .chain(self.passives.iter())
            .chain(self.arbiters.iter())
            .filter(|peer| seen.insert(peer.to_lowercase()))
            .cloned()
            .collect()
    }
}

fn ismaster_command() -> Document {
    let mut command = Document::new();
    command.insert(String::from("ismaster"), Value::from(1));
    command
}

/// One server process in the replica set.
pub struct Node<T: Transport> {
    address: NodeAddress,
    key: NodeKey,
    pool: ConnectionPool<T>,
    state: RwLock<NodeState>,
    codec: Arc<dyn WireCodec>,
    credentials: SharedCredentials,
    authenticator: Option<Arc<dyn Authenticator>>,
    warned_no_authenticator: AtomicBool,
    log: Logger,
}

impl<T: Transport> fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.address.to_string())
            .field("state", &*self.state_read())
            .field("pool", &self.pool)
            .finish()
    }
}

impl<T: Transport> fmt::Display for Node<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.address.fmt(fmt)
    }
}

impl<T: Transport> PartialEq for Node<T> {
    fn eq(&self, other: &Node<T>) -> bool {
        self.address == other.address
    }
}

impl<T: Transport> Eq for Node<T> {}

impl<T: Transport> Node<T> {
    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    pub fn pool(&self) -> &ConnectionPool<T> {
        &self.pool
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    /// A copy of the node's current state.
    pub fn state(&self) -> NodeState {
        self.state_read().clone()
    }

    pub fn role(&self) -> Role {
        self.state_read().role
    }

    pub fn is_primary(&self) -> bool {
        self.role() == Role::Primary
    }

    pub fn is_secondary(&self) -> bool {
        self.role() == Role::Secondary
    }

    pub fn is_arbiter(&self) -> bool {
        self.state_read().arbiter
    }

    pub fn is_down(&self) -> bool {
        self.state_read().down_at.is_some()
    }

    pub fn down_at(&self) -> Option<Instant> {
        self.state_read().down_at
    }

    pub fn refreshed_at(&self) -> Option<Instant> {
        self.state_read().refreshed_at
    }

    pub fn latency(&self) -> Option<Duration> {
        self.state_read().latency
    }

    pub fn tags(&self) -> Tags {
        self.state_read().tags.clone()
    }

    pub fn set_name(&self) -> Option<String> {
        self.state_read().set_name.clone()
    }

    /// The peer list from the last successful probe.
    pub fn peers(&self) -> Vec<String> {
        self.state_read().peers.clone()
    }

    /// True if the node has never been refreshed or was last refreshed
    /// before `boundary`.
    pub fn needs_refresh(&self, boundary: Instant) -> bool {
        match self.state_read().refreshed_at {
            Some(refreshed_at) => refreshed_at < boundary,
            None => true,
        }
    }

    /// True if the node's tags satisfy any of `tag_sets`. An empty list
    /// matches every node.
    pub fn matches_tags(&self, tag_sets: &[Tags]) -> bool {
        if tag_sets.is_empty() {
            return true;
        }
        let state = self.state_read();
        tag_sets.iter().any(|set| {
            set.iter().all(|(k, v)| state.tags.get(k) == Some(v))
        })
    }

    /// Mark the node unreachable as of now.
    pub fn down(&self) {
        warn!(self.log, "marking node down");
        self.state_write().down_at = Some(Instant::now());
    }

    /// Forget when the node was last refreshed so that the next selection
    /// re-probes it.
    pub fn invalidate(&self) {
        self.state_write().refreshed_at = None;
    }

    /// Close the node's idle sockets.
    pub fn disconnect(&self) {
        self.pool.disconnect_idle();
    }

    /// Probe the node for its role and peers. On success the node's state is
    /// replaced and the peer list is returned. Failure is returned to the
    /// caller; the node is not marked down here.
    pub fn refresh(&self) -> Result<Vec<String>, Error> {
        let mut conn = self.pool.checkout()?;
        let probe = self.prepare(&mut conn).and_then(|_| {
            let start = Instant::now();
            let reply = conn.run_command(
                &*self.codec,
                "admin",
                ismaster_command(),
            )?;
            Ok((reply, start.elapsed()))
        });

        let (reply, elapsed) = match probe {
            Ok(probe) => probe,
            Err(e) => {
                conn.disconnect();
                debug!(self.log, "refresh failed"; "error" => e.to_string());
                return Err(e);
            }
        };

        let ismaster: IsMaster = serde_json::from_value(Value::Object(reply))
            .map_err(|e| {
                Error::ProtocolError(format!("invalid ismaster reply: {}", e))
            })?;
        let peers = ismaster.peers();

        let mut state = self.state_write();
        state.role = ismaster.role();
        state.down_at = None;
        state.refreshed_at = Some(Instant::now());
        state.latency = Some(match state.latency {
            Some(average) => average
                .mul_f64(1.0 - LATENCY_WEIGHT)
                .checked_add(elapsed.mul_f64(LATENCY_WEIGHT))
                .unwrap_or(elapsed),
            None => elapsed,
        });
        state.tags = ismaster.tags;
        state.set_name = ismaster.set_name;
        state.arbiter = ismaster.arbiter_only;
        state.passive = ismaster.passive;
        state.hidden = ismaster.hidden;
        state.peers = peers.clone();

        debug!(self.log, "refreshed";
            "role" => state.role.to_string(),
            "peers" => peers.len(),
            "latency_us" => elapsed.as_micros() as u64);
        Ok(peers)
    }

    /// Run `op` on a pooled connection, failing over according to the kind
    /// of error it returns. Pool errors are returned before any failover.
    pub fn ensure_connected<R, F>(&self, mut op: F) -> Result<R, Error>
    where
        F: FnMut(&mut Connection<T>) -> Result<R, Error>,
    {
        let mut conn = self.pool.checkout()?;
        match self.attempt(&mut conn, &mut op) {
            Ok(r) => Ok(r),
            Err(err) => {
                let failover = Failover::classify(&err);
                debug!(self.log, "operation failed";
                    "error" => err.to_string(),
                    "failover" => failover.to_string());
                failover.execute(err, self, &mut conn, &mut op)
            }
        }
    }

    /// Run a command and return its result document.
    pub fn command(
        &self,
        database: &str,
        command: Document,
    ) -> Result<Document, Error> {
        self.ensure_connected(|conn| {
            conn.run_command(&*self.codec, database, command.clone())
        })
    }

    pub fn query(
        &self,
        database: &str,
        collection: &str,
        selector: Document,
        options: QueryOptions,
    ) -> Result<Reply, Error> {
        let operation = Operation::Query {
            database: database.to_string(),
            collection: collection.to_string(),
            selector,
            options,
        };
        self.ensure_connected(|conn| {
            conn.round_trip(&*self.codec, &operation)?.query_result(0)
        })
    }

    pub fn get_more(
        &self,
        database: &str,
        collection: &str,
        cursor_id: i64,
        limit: i32,
    ) -> Result<Reply, Error> {
        let operation = Operation::GetMore {
            database: database.to_string(),
            collection: collection.to_string(),
            cursor_id,
            limit,
        };
        self.ensure_connected(|conn| {
            conn.round_trip(&*self.codec, &operation)?
                .query_result(cursor_id)
        })
    }

    /// Insert documents. Returns the last-error result when `concern`
    /// acknowledges writes.
    pub fn insert(
        &self,
        database: &str,
        collection: &str,
        documents: Vec<Document>,
        continue_on_error: bool,
        concern: &dyn WriteConcern,
    ) -> Result<Option<Document>, Error> {
        self.write(
            Operation::Insert {
                database: database.to_string(),
                collection: collection.to_string(),
                documents,
                continue_on_error,
            },
            concern,
        )
    }

    pub fn update(
        &self,
        database: &str,
        collection: &str,
        selector: Document,
        update: Document,
        flags: UpdateFlags,
        concern: &dyn WriteConcern,
    ) -> Result<Option<Document>, Error> {
        self.write(
            Operation::Update {
                database: database.to_string(),
                collection: collection.to_string(),
                selector,
                update,
                flags,
            },
            concern,
        )
    }

    pub fn remove(
        &self,
        database: &str,
        collection: &str,
        selector: Document,
        single: bool,
        concern: &dyn WriteConcern,
    ) -> Result<Option<Document>, Error> {
        self.write(
            Operation::Delete {
                database: database.to_string(),
                collection: collection.to_string(),
                selector,
                single,
            },
            concern,
        )
    }

    pub fn kill_cursors(&self, cursor_ids: Vec<i64>) -> Result<(), Error> {
        let operation = Operation::KillCursors { cursor_ids };
        self.ensure_connected(|conn| {
            conn.write(&*self.codec, std::slice::from_ref(&operation))
        })
    }

    fn write(
        &self,
        operation: Operation,
        concern: &dyn WriteConcern,
    ) -> Result<Option<Document>, Error> {
        let database = operation.database().unwrap_or("admin").to_string();
        match concern.last_error_command() {
            Some(last_error) => {
                let operations = [
                    operation,
                    Operation::command(&database, last_error.clone()),
                ];
                self.ensure_connected(|conn| {
                    conn.write(&*self.codec, &operations)?;
                    conn.read(&*self.codec)?
                        .last_error_result(&database, &last_error)
                        .map(Some)
                })
            }
            None => self.ensure_connected(|conn| {
                conn.write(&*self.codec, std::slice::from_ref(&operation))
                    .map(|_| None)
            }),
        }
    }

    /// Connect if needed, bring the socket's logins up to date, then run
    /// `op` once.
    pub(crate) fn attempt<R>(
        &self,
        conn: &mut Connection<T>,
        op: &mut dyn FnMut(&mut Connection<T>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        self.prepare(conn)?;
        op(conn)
    }

    fn prepare(&self, conn: &mut Connection<T>) -> Result<(), Error> {
        if !conn.is_alive() {
            conn.disconnect();
            conn.connect()?;
        }

        let wanted = self
            .credentials
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        match self.authenticator.as_ref() {
            Some(authenticator) => conn.apply_credentials(
                &*self.codec,
                &wanted,
                authenticator.as_ref(),
                &self.log,
            ),
            None => {
                if !wanted.is_empty()
                    && !self.warned_no_authenticator.swap(true, Ordering::Relaxed)
                {
                    debug!(
                        self.log,
                        "credentials are set but no authenticator is \
                         configured, not applying them"
                    );
                }
                Ok(())
            }
        }
    }

    fn state_read(&self) -> RwLockReadGuard<NodeState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn state_write(&self) -> RwLockWriteGuard<NodeState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Everything needed to create a node from an address string. The ring uses
/// it to add peers as they are discovered.
pub struct NodeFactory<T: Transport> {
    pub codec: Arc<dyn WireCodec>,
    pub create_transport: TransportFactory<T>,
    pub resolver: Arc<dyn AddressResolver>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub credentials: SharedCredentials,
    pub pool_options: ConnectionPoolOptions,
    pub log: Logger,
}

impl<T: Transport> Clone for NodeFactory<T> {
    fn clone(&self) -> Self {
        NodeFactory {
            codec: Arc::clone(&self.codec),
            create_transport: Arc::clone(&self.create_transport),
            resolver: Arc::clone(&self.resolver),
            authenticator: self.authenticator.clone(),
            credentials: Arc::clone(&self.credentials),
            pool_options: self.pool_options.clone(),
            log: self.log.clone(),
        }
    }
}

impl<T: Transport> NodeFactory<T> {
    pub fn resolve(&self, address: &str) -> Result<NodeAddress, Error> {
        NodeAddress::resolve(address, self.resolver.as_ref())
    }

    pub fn build(&self, address: &str) -> Result<Node<T>, Error> {
        self.resolve(address).map(|address| self.build_resolved(address))
    }

    pub fn build_resolved(&self, address: NodeAddress) -> Node<T> {
        let log = self.log.new(o!("node" => address.to_string()));
        let mut pool_options = self.pool_options.clone();
        pool_options.log = Some(self.log.clone());
        let pool = ConnectionPool::new(
            address.clone(),
            pool_options,
            Arc::clone(&self.create_transport),
        );
        Node {
            key: address.key(),
            address,
            pool,
            state: RwLock::new(NodeState::default()),
            codec: Arc::clone(&self.codec),
            credentials: Arc::clone(&self.credentials),
            authenticator: self.authenticator.clone(),
            warned_no_authenticator: AtomicBool::new(false),
            log,
        }
    }
}
