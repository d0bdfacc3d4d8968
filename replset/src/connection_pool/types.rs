// Copyright 2020 Replset Developers

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use derive_more::{Add, AddAssign, Display, From, Into, Sub, SubAssign};
use slog::Logger;

use crate::connection::{Connection, Transport};

/// The connection counts for a node's connection pool
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ConnectionPoolStats {
    /// The total number of connections owned by the pool, leased or not
    pub total_connections: ConnectionCount,
    /// The count of connections in the idle queue
    pub idle_connections: ConnectionCount,
    /// The count of connections pinned to a thread, leased or expired
    pub pinned_connections: ConnectionCount,
}

impl ConnectionPoolStats {
    pub fn new() -> Self {
        ConnectionPoolStats {
            total_connections: ConnectionCount::from(0),
            idle_connections: ConnectionCount::from(0),
            pinned_connections: ConnectionCount::from(0),
        }
    }
}

impl Default for ConnectionPoolStats {
    fn default() -> Self {
        Self::new()
    }
}

/// The configuration options for a node's connection pool.
#[derive(Clone, Debug, Default)]
pub struct ConnectionPoolOptions {
    /// An optional maximum number of connections for the node. If not
    /// specified the default is 5.
    pub max_connections: Option<u32>,
    /// An optional timeout in milliseconds for `checkout` to wait for a
    /// connection when the pool is saturated. The default is 250
    /// milliseconds.
    pub checkout_timeout: Option<u64>,
    /// Optional reaper interval in milliseconds. This is the period of the
    /// task that moves connections pinned to terminated threads back to the
    /// idle queue. The default is 5000 milliseconds.
    pub reaper_interval: Option<u64>,
    /// Optional socket timeout in milliseconds handed to the transport on
    /// connect. The default is 5000 milliseconds.
    pub socket_timeout: Option<u64>,
    /// An optional `slog` logger instance. If none is provided then the logging
    /// will fall back to using the [`slog-stdlog`](https://docs.rs/slog-stdlog)
    /// drain which is essentially the same as using the rust standard
    /// [`log`](https://docs.rs/log) crate.
    pub log: Option<Logger>,
}

/// A newtype wrapper around u32 used for counts of connections maintained by
/// the connection pool.
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
    Sub,
    SubAssign,
)]
pub struct ConnectionCount(u32);

// A connection pinned to one thread. `connection` is `None` while the
// connection is leased to its thread and `Some` once it has been checked in
// and is eligible for reuse or reaping.
#[doc(hidden)]
pub struct Pin<T: Transport> {
    pub connection: Option<Connection<T>>,
    pub owner: Weak<()>,
    pub thread_name: String,
}

impl<T: Transport> Pin<T> {
    pub fn owner_alive(&self) -> bool {
        self.owner.upgrade().is_some()
    }
}

// The internal data structures used to manage the connection pool.
#[doc(hidden)]
pub struct ConnectionData<T: Transport> {
    pub pinned: HashMap<ThreadId, Pin<T>>,
    pub unpinned: VecDeque<Connection<T>>,
    pub stats: ConnectionPoolStats,
}

impl<T: Transport> ConnectionData<T> {
    #[doc(hidden)]
    pub fn new(max_size: usize) -> Self {
        ConnectionData {
            pinned: HashMap::with_capacity(max_size),
            unpinned: VecDeque::with_capacity(max_size),
            stats: ConnectionPoolStats::new(),
        }
    }

    // Keep the derived counts in step with the maps.
    pub fn sync_stats(&mut self) {
        self.stats.idle_connections = (self.unpinned.len() as u32).into();
        self.stats.pinned_connections = (self.pinned.len() as u32).into();
    }
}

// Protected access to the internal connection pool data structures
#[doc(hidden)]
pub struct ProtectedData<T: Transport>(Arc<(Mutex<ConnectionData<T>>, Condvar)>);

impl<T: Transport> ProtectedData<T> {
    pub fn new(connection_data: ConnectionData<T>) -> Self {
        ProtectedData(Arc::new((Mutex::new(connection_data), Condvar::new())))
    }

    pub fn connection_data_lock(&self) -> MutexGuard<ConnectionData<T>> {
        (self.0).0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn condvar_wait<'a>(
        &self,
        g: MutexGuard<'a, ConnectionData<T>>,
        timeout: Duration,
    ) -> (MutexGuard<'a, ConnectionData<T>>, bool) {
        let (g, wait_result) = (self.0)
            .1
            .wait_timeout(g, timeout)
            .unwrap_or_else(|e| e.into_inner());
        (g, wait_result.timed_out())
    }

    pub fn condvar_notify(&self) {
        (self.0).1.notify_one()
    }

    pub fn condvar_notify_all(&self) {
        (self.0).1.notify_all()
    }
}

impl<T: Transport> Clone for ProtectedData<T> {
    fn clone(&self) -> ProtectedData<T> {
        ProtectedData(Arc::clone(&self.0))
    }
}
