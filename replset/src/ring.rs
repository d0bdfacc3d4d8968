// Copyright 2020 Replset Developers

//! The ordered set of known nodes.
//!
//! Membership is an immutable snapshot that is replaced wholesale when nodes
//! are added, so selection never waits on topology changes. Round-robin
//! rotation is a single atomic cursor shared by every selector.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};
use std::time::{Duration, Instant};

use rand::Rng;
use slog::{debug, info, warn, Logger};

use crate::address::NodeAddress;
use crate::connection::Transport;
use crate::node::{Node, NodeFactory, Tags};

// Nodes whose latency is within this window of the fastest are equally
// near.
pub const NEAREST_WINDOW: Duration = Duration::from_millis(15);

type Snapshot<T> = Arc<Vec<Arc<Node<T>>>>;

pub struct Ring<T: Transport> {
    nodes: RwLock<Snapshot<T>>,
    cursor: AtomicUsize,
    down_interval: Duration,
    refresh_interval: Duration,
    factory: Arc<NodeFactory<T>>,
    refresh_lock: Mutex<()>,
    log: Logger,
}

impl<T: Transport> Ring<T> {
    pub fn new(
        down_interval: Duration,
        refresh_interval: Duration,
        factory: Arc<NodeFactory<T>>,
        log: Logger,
    ) -> Self {
        Ring {
            nodes: RwLock::new(Arc::new(Vec::new())),
            cursor: AtomicUsize::new(0),
            down_interval,
            refresh_interval,
            factory,
            refresh_lock: Mutex::new(()),
            log,
        }
    }

    pub fn down_interval(&self) -> Duration {
        self.down_interval
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn contains(&self, address: &NodeAddress) -> bool {
        let key = address.key();
        self.snapshot().iter().any(|n| *n.key() == key)
    }

    /// Append the nodes whose key is not already present. Returns the nodes
    /// that were added.
    pub fn add<I>(&self, nodes: I) -> Vec<Arc<Node<T>>>
    where
        I: IntoIterator<Item = Arc<Node<T>>>,
    {
        let mut guard = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        let mut next: Vec<Arc<Node<T>>> = (**guard).clone();
        let mut added = Vec::new();
        for node in nodes {
            if !next.iter().any(|n| n.key() == node.key()) {
                next.push(Arc::clone(&node));
                added.push(node);
            }
        }
        if !added.is_empty() {
            *guard = Arc::new(next);
        }
        added
    }

    /// Resolve and add peer addresses not yet in the ring. Addresses that
    /// fail to resolve are skipped.
    pub fn add_addresses(&self, addresses: &[String]) -> Vec<Arc<Node<T>>> {
        let mut added = Vec::new();
        for address in addresses {
            let resolved = match self.factory.resolve(address) {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!(self.log, "could not resolve peer";
                        "peer" => address, "error" => e.to_string());
                    continue;
                }
            };
            if self.contains(&resolved) {
                continue;
            }
            let node = Arc::new(self.factory.build_resolved(resolved));
            for node in self.add(vec![node]) {
                info!(self.log, "discovered peer";
                    "peer" => node.address().original.clone(),
                    "address" => node.address().to_string());
                added.push(node);
            }
        }
        added
    }

    /// Every node, in rotation order.
    pub fn all_nodes(&self) -> Vec<Arc<Node<T>>> {
        self.snapshot().to_vec()
    }

    /// The nodes not currently marked down.
    pub fn nodes(&self) -> Vec<Arc<Node<T>>> {
        self.snapshot()
            .iter()
            .filter(|n| !n.is_down())
            .cloned()
            .collect()
    }

    /// A down node is refreshable once its down interval has passed; any
    /// other node once its information is older than the refresh interval.
    pub fn refreshable(&self, node: &Node<T>) -> bool {
        let now = Instant::now();
        match node.down_at() {
            Some(down_at) => now
                .checked_sub(self.down_interval)
                .map_or(false, |boundary| down_at < boundary),
            None => match now.checked_sub(self.refresh_interval) {
                Some(boundary) => node.needs_refresh(boundary),
                None => node.refreshed_at().is_none(),
            },
        }
    }

    pub fn next_primary(&self) -> Option<Arc<Node<T>>> {
        self.refresh_stale();
        self.rotated()
            .into_iter()
            .find(|n| n.is_primary() && !n.is_down())
    }

    pub fn next_secondary(&self) -> Option<Arc<Node<T>>> {
        self.next_secondary_tagged(&[])
    }

    pub fn next_secondary_tagged(
        &self,
        tags: &[Tags],
    ) -> Option<Arc<Node<T>>> {
        self.refresh_stale();
        self.rotated()
            .into_iter()
            .find(|n| n.is_secondary() && !n.is_down() && n.matches_tags(tags))
    }

    /// Every usable secondary, starting from the next in rotation.
    pub fn secondaries(&self) -> Vec<Arc<Node<T>>> {
        self.refresh_stale();
        self.rotated()
            .into_iter()
            .filter(|n| n.is_secondary() && !n.is_down())
            .collect()
    }

    /// Pick among the primary and secondaries matching `tags` the one with
    /// the lowest latency. Nodes within `NEAREST_WINDOW` of the fastest are
    /// chosen between at random. Nodes never measured sort last.
    pub fn nearest(&self, tags: &[Tags]) -> Option<Arc<Node<T>>> {
        self.refresh_stale();
        let candidates: Vec<Arc<Node<T>>> = self
            .rotated()
            .into_iter()
            .filter(|n| {
                (n.is_primary() || n.is_secondary())
                    && !n.is_down()
                    && n.matches_tags(tags)
            })
            .collect();

        let measured: Vec<(Duration, &Arc<Node<T>>)> = candidates
            .iter()
            .filter_map(|n| n.latency().map(|latency| (latency, n)))
            .collect();

        let fastest = match measured.iter().map(|(l, _)| *l).min() {
            Some(fastest) => fastest,
            None => return candidates.into_iter().next(),
        };
        let near: Vec<&Arc<Node<T>>> = measured
            .iter()
            .filter(|(l, _)| *l <= fastest + NEAREST_WINDOW)
            .map(|(_, n)| *n)
            .collect();

        let pick = rand::thread_rng().gen_range(0, near.len());
        near.get(pick).map(|n| Arc::clone(n))
    }

    /// Refresh the nodes that are due. A caller that finds another refresh
    /// in progress skips it, unless some node has never been probed, in
    /// which case it waits so that the first selection sees real roles.
    pub fn refresh_stale(&self) {
        let due: Vec<Arc<Node<T>>> = self
            .snapshot()
            .iter()
            .filter(|n| self.refreshable(n))
            .cloned()
            .collect();
        if due.is_empty() {
            return;
        }

        let bootstrapping =
            due.iter().any(|n| n.refreshed_at().is_none() && !n.is_down());
        let _guard = if bootstrapping {
            self.refresh_lock_wait()
        } else {
            match self.refresh_lock.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(e)) => e.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    debug!(self.log, "refresh in progress, skipping");
                    return;
                }
            }
        };

        // Another thread may have refreshed them while we waited.
        let due = due.into_iter().filter(|n| self.refreshable(n)).collect();
        self.refresh_nodes(due);
    }

    /// Refresh every node, adding any peers they report.
    pub fn refresh_all(&self) {
        let _guard = self.refresh_lock_wait();
        self.refresh_nodes(self.all_nodes());
    }

    fn refresh_nodes(&self, nodes: Vec<Arc<Node<T>>>) {
        let mut pending: VecDeque<Arc<Node<T>>> = nodes.into();
        while let Some(node) = pending.pop_front() {
            match node.refresh() {
                Ok(peers) => pending.extend(self.add_addresses(&peers)),
                Err(e) if e.is_pool_error() => {
                    debug!(self.log, "skipping refresh of busy node";
                        "node" => node.to_string(), "error" => e.to_string());
                }
                Err(e) => {
                    warn!(self.log, "refresh failed";
                        "node" => node.to_string(), "error" => e.to_string());
                    node.down();
                }
            }
        }
    }

    fn refresh_lock_wait(&self) -> MutexGuard<()> {
        self.refresh_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self) -> Snapshot<T> {
        let guard = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&*guard)
    }

    // Advance the cursor, then return the snapshot starting at it. The
    // first call starts at the second node.
    fn rotated(&self) -> Vec<Arc<Node<T>>> {
        let snapshot = self.snapshot();
        let len = snapshot.len();
        if len == 0 {
            return Vec::new();
        }
        let start = self
            .cursor
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
            % len;
        snapshot
            .iter()
            .cycle()
            .skip(start)
            .take(len)
            .cloned()
            .collect()
    }
}
