// Copyright 2020 Replset Developers

//! A per-node connection pool with thread pinning.
//!
//! A connection checked out by a thread stays pinned to that thread after it
//! is checked back in, so the next checkout from the same thread gets the
//! same socket without touching the idle queue. Pins left behind by threads
//! that have exited are reaped back into the idle queue, both inline when the
//! pool runs dry and periodically by a [`Reaper`] timer.

pub mod types;

use std::collections::HashSet;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use chrono::Duration as ChronoDuration;
use slog::{debug, o, trace, warn, Drain, Logger};
use timer::Guard;

use crate::address::NodeAddress;
use crate::connection::{Connection, Transport, TransportFactory};
use crate::connection_pool::types::{
    ConnectionCount, ConnectionData, ConnectionPoolOptions,
    ConnectionPoolStats, Pin, ProtectedData,
};
use crate::error::Error;

// Default number of connections per node
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
// Checkout timeout in milliseconds
pub const DEFAULT_CHECKOUT_TIMEOUT: u64 = 250;
// Reaper interval in milliseconds
pub const DEFAULT_REAPER_INTERVAL: u64 = 5000;
// Socket timeout in milliseconds
pub const DEFAULT_SOCKET_TIMEOUT: u64 = 5000;

thread_local! {
    // Dropped when the thread exits. Pins hold a weak reference to it.
    static THREAD_TOKEN: Arc<()> = Arc::new(());
}

/// A bounded pool of connections to one node
pub struct ConnectionPool<T: Transport> {
    address: NodeAddress,
    protected_data: ProtectedData<T>,
    create_transport: TransportFactory<T>,
    max_connections: u32,
    checkout_timeout: Duration,
    socket_timeout: Duration,
    reaper: Arc<Reaper>,
    log: Logger,
}

impl<T: Transport> fmt::Debug for ConnectionPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("address", &self.address.to_string())
            .field("max_connections", &self.max_connections)
            .field("checkout_timeout", &self.checkout_timeout)
            .field("socket_timeout", &self.socket_timeout)
            .field("stats", &self.get_stats())
            .finish()
    }
}

impl<T: Transport> Clone for ConnectionPool<T> {
    fn clone(&self) -> ConnectionPool<T> {
        ConnectionPool {
            address: self.address.clone(),
            protected_data: self.protected_data.clone(),
            create_transport: Arc::clone(&self.create_transport),
            max_connections: self.max_connections,
            checkout_timeout: self.checkout_timeout,
            socket_timeout: self.socket_timeout,
            reaper: Arc::clone(&self.reaper),
            log: self.log.clone(),
        }
    }
}

impl<T: Transport> ConnectionPool<T> {
    /// Create a pool for `address`. The idle queue is filled with
    /// unconnected connections up to the maximum; sockets are opened on
    /// first use.
    pub fn new(
        address: NodeAddress,
        cpo: ConnectionPoolOptions,
        create_transport: TransportFactory<T>,
    ) -> Self {
        let max_connections =
            cpo.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);
        let checkout_timeout = Duration::from_millis(
            cpo.checkout_timeout.unwrap_or(DEFAULT_CHECKOUT_TIMEOUT),
        );
        let socket_timeout = Duration::from_millis(
            cpo.socket_timeout.unwrap_or(DEFAULT_SOCKET_TIMEOUT),
        );
        let reaper_interval =
            cpo.reaper_interval.unwrap_or(DEFAULT_REAPER_INTERVAL);

        let logger = cpo
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()))
            .new(o!("pool" => address.to_string()));

        let mut connection_data = ConnectionData::new(max_connections as usize);
        for _ in 0..max_connections {
            connection_data.unpinned.push_back(Connection::new(
                address.clone(),
                create_transport(&address),
                socket_timeout,
            ));
        }
        connection_data.stats.total_connections = max_connections.into();
        connection_data.sync_stats();

        let protected_data = ProtectedData::new(connection_data);
        let reaper =
            Reaper::start(reaper_interval, protected_data.clone(), &logger);

        ConnectionPool {
            address,
            protected_data,
            create_transport,
            max_connections,
            checkout_timeout,
            socket_timeout,
            reaper: Arc::new(reaper),
            log: logger,
        }
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    /// Check out a connection for the calling thread, waiting up to the
    /// pool's checkout timeout when the pool is saturated.
    pub fn checkout(&self) -> Result<PoolConnection<T>, Error> {
        self.acquire(Some(self.checkout_timeout))
    }

    pub fn checkout_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<PoolConnection<T>, Error> {
        self.acquire(Some(timeout))
    }

    /// Check out a connection without waiting. Returns `PoolSaturated` if
    /// none is available.
    pub fn try_checkout(&self) -> Result<PoolConnection<T>, Error> {
        self.acquire(None)
    }

    /// Move every pin whose thread is not in `active` back to the idle
    /// queue. Returns the number of pins reaped.
    pub fn reap(&self, active: &HashSet<ThreadId>) -> usize {
        let mut connection_data = self.protected_data.connection_data_lock();
        let reaped = reap_pins(
            &mut connection_data,
            |thread_id, _| !active.contains(thread_id),
            &self.log,
        );
        drop(connection_data);
        if reaped > 0 {
            self.protected_data.condvar_notify_all();
        }
        reaped
    }

    /// Reap the pins of threads that have exited.
    pub fn reap_dead_threads(&self) -> usize {
        reap_dead_threads(&self.protected_data, &self.log)
    }

    pub fn unpinned_size(&self) -> usize {
        self.protected_data.connection_data_lock().unpinned.len()
    }

    pub fn pinned_size(&self) -> usize {
        self.protected_data.connection_data_lock().pinned.len()
    }

    pub fn get_stats(&self) -> ConnectionPoolStats {
        self.protected_data.connection_data_lock().stats
    }

    /// Close the sockets of every connection not currently leased. The
    /// connections stay in the pool and reconnect on next use.
    pub fn disconnect_idle(&self) {
        let mut connection_data = self.protected_data.connection_data_lock();
        let mut closed = 0;
        for conn in connection_data.unpinned.iter_mut() {
            if conn.is_connected() {
                conn.disconnect();
                closed += 1;
            }
        }
        for pin in connection_data.pinned.values_mut() {
            if let Some(conn) = pin.connection.as_mut() {
                if conn.is_connected() {
                    conn.disconnect();
                    closed += 1;
                }
            }
        }
        debug!(self.log, "closed {} idle connections", closed);
    }

    fn acquire(
        &self,
        wait: Option<Duration>,
    ) -> Result<PoolConnection<T>, Error> {
        let current = thread::current();
        let thread_id = current.id();
        let thread_name = current
            .name()
            .map(String::from)
            .unwrap_or_else(|| format!("{:?}", thread_id));

        let mut connection_data = self.protected_data.connection_data_lock();

        if let Some(pin) = connection_data.pinned.get_mut(&thread_id) {
            return match pin.connection.take() {
                Some(conn) => {
                    trace!(self.log, "re-leasing pinned connection";
                        "connection" => conn.id());
                    Ok(self.lease(thread_id, conn))
                }
                None => Err(Error::ConnectionInUse {
                    address: self.address.to_string(),
                    thread: pin.thread_name.clone(),
                }),
            };
        }

        let deadline = wait.map(|w| Instant::now() + w);
        loop {
            if let Some(conn) = self.next_connection(&mut connection_data) {
                pin_to_thread(&mut connection_data, thread_id, thread_name);
                trace!(self.log, "leasing connection";
                    "connection" => conn.id());
                return Ok(self.lease(thread_id, conn));
            }

            // Saturated. Reclaim what dead threads left behind, then wait
            // for a checkin or a reap to refill the idle queue. Pins of
            // live threads are never taken.
            let reaped = reap_pins(
                &mut connection_data,
                |_, pin| !pin.owner_alive(),
                &self.log,
            );
            if reaped > 0 {
                if reaped > 1 {
                    self.protected_data.condvar_notify_all();
                }
                continue;
            }

            let (deadline, timeout) = match (deadline, wait) {
                (Some(deadline), Some(timeout)) => (deadline, timeout),
                _ => {
                    return Err(Error::PoolSaturated {
                        address: self.address.to_string(),
                    })
                }
            };

            let now = Instant::now();
            if now >= deadline {
                warn!(self.log, "timed out waiting for a connection";
                    "timeout_ms" => timeout.as_millis() as u64);
                return Err(Error::PoolTimeout {
                    address: self.address.to_string(),
                    timeout,
                });
            }

            let (guard, _) = self
                .protected_data
                .condvar_wait(connection_data, deadline - now);
            connection_data = guard;
        }
    }

    // Pop an idle connection, or create one if the pool has room.
    fn next_connection(
        &self,
        connection_data: &mut ConnectionData<T>,
    ) -> Option<Connection<T>> {
        if let Some(conn) = connection_data.unpinned.pop_front() {
            return Some(conn);
        }
        if connection_data.stats.total_connections
            < ConnectionCount::from(self.max_connections)
        {
            connection_data.stats.total_connections += ConnectionCount::from(1);
            debug!(self.log, "creating connection";
                "total" => connection_data.stats.total_connections.to_string());
            return Some(Connection::new(
                self.address.clone(),
                (self.create_transport)(&self.address),
                self.socket_timeout,
            ));
        }
        None
    }

    fn lease(
        &self,
        thread_id: ThreadId,
        conn: Connection<T>,
    ) -> PoolConnection<T> {
        PoolConnection {
            connection_pool: self.clone(),
            thread_id,
            connection: Some(conn),
        }
    }

    // Return a connection. It stays pinned to the thread, expired, so the
    // same thread gets it back on its next checkout.
    fn checkin(&self, thread_id: ThreadId, mut conn: Connection<T>) {
        let mut connection_data = self.protected_data.connection_data_lock();
        if conn.is_broken() {
            warn!(self.log, "found a broken connection, not returning it to the pool";
                "connection" => conn.id());
            conn.disconnect();
            connection_data.pinned.remove(&thread_id);
            connection_data.stats.total_connections -= ConnectionCount::from(1);
        } else if let Some(pin) = connection_data.pinned.get_mut(&thread_id) {
            pin.connection = Some(conn);
        } else {
            // The pin was reaped while the connection was out.
            connection_data.unpinned.push_back(conn);
        }
        connection_data.sync_stats();
        drop(connection_data);
        self.protected_data.condvar_notify();
    }
}

/// A connection checked out of the pool. Returned to the pool on drop.
pub struct PoolConnection<T: Transport> {
    connection_pool: ConnectionPool<T>,
    thread_id: ThreadId,
    connection: Option<Connection<T>>,
}

impl<T: Transport> fmt::Debug for PoolConnection<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PoolConnection")
            .field("thread_id", &self.thread_id)
            .field("connection", &self.connection)
            .finish()
    }
}

impl<T: Transport> Drop for PoolConnection<T> {
    fn drop(&mut self) {
        match self.connection.take() {
            Some(conn) => self.connection_pool.checkin(self.thread_id, conn),
            None => warn!(
                self.connection_pool.log,
                "connection is no longer available, cannot return it to the pool"
            ),
        }
    }
}

impl<T: Transport> Deref for PoolConnection<T> {
    type Target = Connection<T>;

    fn deref(&self) -> &Connection<T> {
        self.connection
            .as_ref()
            .expect("pooled connection is present until drop")
    }
}

impl<T: Transport> DerefMut for PoolConnection<T> {
    fn deref_mut(&mut self) -> &mut Connection<T> {
        self.connection
            .as_mut()
            .expect("pooled connection is present until drop")
    }
}

/// Periodically reaps the pins of exited threads.
pub struct Reaper {
    // Declared first so the schedule is cancelled before the timer thread
    // is joined.
    _guard: Guard,
    _timer: Mutex<timer::Timer>,
}

impl Reaper {
    fn start<T: Transport>(
        interval_ms: u64,
        protected_data: ProtectedData<T>,
        log: &Logger,
    ) -> Self {
        debug!(log, "starting reaper task, interval {} ms", interval_ms);
        let timer = timer::Timer::new();
        let log = log.clone();
        let guard = timer.schedule_repeating(
            ChronoDuration::milliseconds(interval_ms as i64),
            move || {
                reap_dead_threads(&protected_data, &log);
            },
        );
        Reaper {
            _guard: guard,
            _timer: Mutex::new(timer),
        }
    }
}

fn reap_dead_threads<T: Transport>(
    protected_data: &ProtectedData<T>,
    log: &Logger,
) -> usize {
    let mut connection_data = protected_data.connection_data_lock();
    let reaped =
        reap_pins(&mut connection_data, |_, pin| !pin.owner_alive(), log);
    drop(connection_data);
    if reaped > 0 {
        protected_data.condvar_notify_all();
    }
    reaped
}

// Remove the selected pins. Expired connections go back to the idle queue
// unless broken; leased ones come back through checkin.
fn reap_pins<T, P>(
    connection_data: &mut ConnectionData<T>,
    mut should_reap: P,
    log: &Logger,
) -> usize
where
    T: Transport,
    P: FnMut(&ThreadId, &Pin<T>) -> bool,
{
    let reaped: Vec<ThreadId> = connection_data
        .pinned
        .iter()
        .filter(|(thread_id, pin)| should_reap(*thread_id, *pin))
        .map(|(thread_id, _)| *thread_id)
        .collect();

    for thread_id in reaped.iter() {
        match connection_data.pinned.remove(thread_id) {
            Some(Pin {
                connection: Some(mut conn),
                ..
            }) => {
                if conn.is_broken() {
                    debug!(log, "discarding broken connection";
                        "connection" => conn.id());
                    conn.disconnect();
                    connection_data.stats.total_connections -=
                        ConnectionCount::from(1);
                } else {
                    connection_data.unpinned.push_back(conn);
                }
            }
            Some(Pin { thread_name, .. }) => {
                debug!(log, "reaped pin of leased connection";
                    "thread" => thread_name);
            }
            None => (),
        }
    }

    if !reaped.is_empty() {
        debug!(log, "reaped {} pinned connections", reaped.len());
    }
    connection_data.sync_stats();
    reaped.len()
}

fn pin_to_thread<T: Transport>(
    connection_data: &mut ConnectionData<T>,
    thread_id: ThreadId,
    thread_name: String,
) {
    let owner = THREAD_TOKEN.try_with(Arc::downgrade).unwrap_or_default();
    connection_data.pinned.insert(
        thread_id,
        Pin {
            connection: None,
            owner,
            thread_name,
        },
    );
    connection_data.sync_stats();
}
