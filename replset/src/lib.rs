// Copyright 2020 Replset Developers

//! Topology, pooling and failover for a replica set client
//!
//! `replset` is the part of a replica set client that sits between the
//! operations an application issues and the sockets those operations travel
//! over. It knows which members of the replica set exist, which of them is
//! the primary, which connection a thread should use, and what to do when a
//! member goes away. The byte-level encoding of messages and the socket
//! itself are supplied by the user through two traits: the
//! [`WireCodec`](protocol/trait.WireCodec.html) trait and the
//! [`Transport`](connection/trait.Transport.html) trait.
//!
//! ## Nodes and the ring
//!
//! Each replica set member is a [`Node`](node/struct.Node.html): a resolved
//! address, a connection pool, and the last role and latency the member
//! reported. The nodes of a cluster are kept in a
//! [`Ring`](ring/struct.Ring.html) that hands them out in rotation, so that
//! repeated reads spread across secondaries. Peers reported by a member are
//! added to the ring as they are discovered.
//!
//! A node that cannot be reached is marked *down*. It is skipped by selection
//! until the down interval (30 seconds by default) has passed, after which it
//! is probed again. The topology information of healthy nodes is refreshed
//! every refresh interval (300 seconds by default).
//!
//! ## Thread pinning
//!
//! A node's [`ConnectionPool`](connection_pool/struct.ConnectionPool.html)
//! gives each thread its own connection and keeps giving it the same one.
//! A thread that runs a write followed by a read observes its own write,
//! because both travel over the same socket. When every connection is pinned
//! to a live thread, checkout waits for the checkout timeout and then fails.
//! Connections pinned to threads that have exited are returned to the pool by
//! a periodic reaper.
//!
//! ## Failover
//!
//! When an operation on a node fails the error is classified into a
//! [`Failover`](failover/enum.Failover.html) strategy. A dropped socket is
//! retried once on a fresh socket. A "not master" reply is turned into a
//! [`ReplicaSetReconfigured`](error/enum.Error.html) error that tells the
//! caller to select again. A protocol error disconnects the node.
//! [`Cluster::with_retry`](cluster/struct.Cluster.html#method.with_retry)
//! retries whole operations across those errors, refreshing the topology in
//! between.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::{Arc, Mutex};
//!
//! use slog::{Drain, Logger, o};
//!
//! use replset::cluster::Cluster;
//! use replset::config::ClusterOptions;
//! use replset::protocol::Document;
//! use replset::read_preference::ReadPreference;
//! use replset_tcp_transport::TcpTransport;
//!
//! let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
//! let log = Logger::root(
//!     Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
//!     o!("build-id" => "0.1.0"),
//! );
//!
//! let options = ClusterOptions {
//!     pool_size: Some(10),
//!     log: Some(log),
//!     ..Default::default()
//! };
//!
//! let cluster = Cluster::new(
//!     vec!["db1:27017", "db2:27017", "db3:27017"],
//!     options,
//!     Arc::new(MyCodec),
//!     Arc::new(TcpTransport::new),
//! );
//!
//! let mut ping = Document::new();
//! ping.insert("ping".into(), 1.into());
//!
//! let reply = cluster.with_retry(|| {
//!     cluster.with_read_preference(ReadPreference::Nearest, &[], |node| {
//!         node.command("admin", ping.clone())
//!     })
//! })?;
//! ```

#![allow(missing_docs)]

pub mod address;
pub mod auth;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod connection_pool;
pub mod error;
pub mod failover;
pub mod node;
pub mod protocol;
pub mod read_preference;
pub mod resolver;
pub mod retryable;
pub mod ring;
