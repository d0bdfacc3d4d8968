// Copyright 2020 Replset Developers

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slog::{debug, info, o, warn, Logger};

use crate::auth::{self, Authenticator, SharedCredentials};
use crate::config::{ClusterOptions, ConnectionString};
use crate::connection::{Transport, TransportFactory};
use crate::error::Error;
use crate::node::{Node, NodeFactory, Tags};
use crate::protocol::WireCodec;
use crate::read_preference::ReadPreference;
use crate::resolver::{AddressResolver, SystemResolver};
use crate::retryable::{self, Topology};
use crate::ring::Ring;

/// The entry point for running operations against a replica set.
///
/// A cluster owns the ring of known nodes built from its seed list, the
/// credentials shared by every node, and the retry policy.
pub struct Cluster<T: Transport> {
    seeds: Vec<String>,
    options: ClusterOptions,
    factory: Arc<NodeFactory<T>>,
    ring: Ring<T>,
    unresolved: Mutex<Vec<String>>,
    max_retries: u32,
    retry_interval: Duration,
    log: Logger,
}

impl<T: Transport> fmt::Debug for Cluster<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("seeds", &self.seeds)
            .field("nodes", &self.ring.all_nodes())
            .field("max_retries", &self.max_retries)
            .field("retry_interval", &self.retry_interval)
            .finish()
    }
}

impl<T: Transport> Cluster<T> {
    /// Create a cluster from a seed list. Seeds are resolved with the
    /// system resolver on first use.
    pub fn new<I, S>(
        seeds: I,
        options: ClusterOptions,
        codec: Arc<dyn WireCodec>,
        create_transport: TransportFactory<T>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let log = options.logger().new(o!("component" => "replset"));
        let factory = NodeFactory {
            codec,
            create_transport,
            resolver: Arc::new(SystemResolver),
            authenticator: None,
            credentials: auth::shared_credentials(),
            pool_options: options.pool_options(),
            log: log.clone(),
        };
        let seeds = seeds.into_iter().map(|s| s.as_ref().to_string()).collect();
        Cluster::build(seeds, options, factory, log)
    }

    /// Create a cluster from a connection string. Credentials in the string
    /// are registered for its database, or `admin` when none is named.
    pub fn from_connection_string(
        uri: &str,
        codec: Arc<dyn WireCodec>,
        create_transport: TransportFactory<T>,
    ) -> Result<Self, Error> {
        let cs: ConnectionString = uri.parse()?;
        let cluster =
            Cluster::new(&cs.seeds, cs.options.clone(), codec, create_transport);
        if let (Some(username), Some(password)) = (&cs.username, &cs.password)
        {
            cluster.login(cs.auth_database(), username, password);
        }
        Ok(cluster)
    }

    /// Use `resolver` for seeds and discovered peers.
    pub fn with_resolver<R>(self, resolver: R) -> Self
    where
        R: AddressResolver + 'static,
    {
        let mut factory = (*self.factory).clone();
        factory.resolver = Arc::new(resolver);
        self.rebuild(factory)
    }

    /// Apply logins through `authenticator`. Without one, credentials are
    /// recorded but never sent.
    pub fn with_authenticator<A>(self, authenticator: A) -> Self
    where
        A: Authenticator + 'static,
    {
        let mut factory = (*self.factory).clone();
        factory.authenticator = Some(Arc::new(authenticator));
        self.rebuild(factory)
    }

    fn rebuild(self, factory: NodeFactory<T>) -> Self {
        let Cluster {
            seeds,
            options,
            log,
            ..
        } = self;
        Cluster::build(seeds, options, factory, log)
    }

    fn build(
        seeds: Vec<String>,
        options: ClusterOptions,
        factory: NodeFactory<T>,
        log: Logger,
    ) -> Self {
        let factory = Arc::new(factory);
        let ring = Ring::new(
            options.down_interval(),
            options.refresh_interval(),
            Arc::clone(&factory),
            log.clone(),
        );

        Cluster {
            max_retries: options.max_retries(),
            retry_interval: options.retry_interval(),
            unresolved: Mutex::new(seeds.clone()),
            seeds,
            options,
            factory,
            ring,
            log,
        }
    }

    pub fn seeds(&self) -> &[String] {
        &self.seeds
    }

    pub fn options(&self) -> &ClusterOptions {
        &self.options
    }

    pub fn ring(&self) -> &Ring<T> {
        &self.ring
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// The read preference `with_default_preference` selects with.
    pub fn read_preference(&self) -> ReadPreference {
        self.options.read_preference()
    }

    /// The nodes not currently marked down.
    pub fn nodes(&self) -> Vec<Arc<Node<T>>> {
        self.ring.nodes()
    }

    pub fn all_nodes(&self) -> Vec<Arc<Node<T>>> {
        self.ring.all_nodes()
    }

    /// The credentials shared with every node.
    pub fn credentials(&self) -> SharedCredentials {
        Arc::clone(&self.factory.credentials)
    }

    /// Record a login for `database`. Each connection applies it before its
    /// next operation.
    pub fn login(&self, database: &str, username: &str, password: &str) {
        debug!(self.log, "registering login"; "database" => database);
        self.factory
            .credentials
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                database.to_string(),
                (username.to_string(), password.to_string()),
            );
    }

    /// Forget the login for `database`. Connections log out before their
    /// next operation.
    pub fn logout(&self, database: &str) {
        debug!(self.log, "removing login"; "database" => database);
        self.factory
            .credentials
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(database);
    }

    /// Re-probe every node, adding the peers they report. Seeds that could
    /// not be resolved before are tried again. A node that cannot be
    /// reached is marked down without stopping the rest.
    pub fn refresh(&self) {
        self.resolve_seeds();
        self.ring.refresh_all();
        info!(self.log, "refreshed cluster";
            "nodes" => self.ring.len(),
            "available" => self.ring.nodes().len());
    }

    /// Close every node's idle sockets.
    pub fn disconnect(&self) {
        for node in self.ring.all_nodes() {
            node.disconnect();
        }
    }

    /// Run `f` against the primary.
    pub fn with_primary<R, F>(&self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&Node<T>) -> Result<R, Error>,
    {
        self.with_read_preference(ReadPreference::Primary, &[], f)
    }

    /// Run `f` against a secondary. Secondaries are tried in rotation order;
    /// one that cannot be reached or has changed role is skipped.
    pub fn with_secondary<R, F>(&self, mut f: F) -> Result<R, Error>
    where
        F: FnMut(&Node<T>) -> Result<R, Error>,
    {
        self.bootstrap();
        let mut last_error = None;
        for node in self.ring.secondaries() {
            match f(node.as_ref()) {
                Ok(r) => return Ok(r),
                Err(e)
                    if e.is_connection_failure()
                        || matches!(e, Error::ReplicaSetReconfigured { .. }) =>
                {
                    debug!(self.log, "secondary failed, trying the next";
                        "node" => node.to_string(), "error" => e.to_string());
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            self.no_node(Error::Unavailable(String::from(
                "no secondary available",
            )))
        }))
    }

    /// Run `f` against a node chosen by `preference`.
    pub fn with_read_preference<R, F>(
        &self,
        preference: ReadPreference,
        tags: &[Tags],
        f: F,
    ) -> Result<R, Error>
    where
        F: FnOnce(&Node<T>) -> Result<R, Error>,
    {
        self.bootstrap();
        let node = preference
            .select(&self.ring, tags)
            .map_err(|e| self.no_node(e))?;
        f(node.as_ref())
    }

    /// Run `f` against a node chosen by the cluster's configured read
    /// preference.
    pub fn with_default_preference<R, F>(&self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&Node<T>) -> Result<R, Error>,
    {
        self.with_read_preference(self.read_preference(), &[], f)
    }

    /// Run `f` with up to `max_retries` retries, refreshing the topology
    /// between attempts.
    pub fn with_retry<R, F>(&self, f: F) -> Result<R, Error>
    where
        F: FnMut() -> Result<R, Error>,
    {
        retryable::with_retry(self, self.max_retries, f)
    }

    // Until a seed resolves there is nothing to select from.
    fn bootstrap(&self) {
        if self.ring.is_empty() {
            self.refresh();
        }
    }

    fn no_node(&self, error: Error) -> Error {
        match error {
            Error::Unavailable(msg) => Error::ConnectionFailure(format!(
                "{} (seeds: {})",
                msg,
                self.seeds.join(",")
            )),
            other => other,
        }
    }

    fn resolve_seeds(&self) {
        let mut unresolved =
            self.unresolved.lock().unwrap_or_else(|e| e.into_inner());
        if unresolved.is_empty() {
            return;
        }
        let mut nodes = Vec::new();
        unresolved.retain(|seed| match self.factory.build(seed) {
            Ok(node) => {
                debug!(self.log, "resolved seed"; "seed" => seed);
                nodes.push(Arc::new(node));
                false
            }
            Err(e) => {
                warn!(self.log, "could not resolve seed";
                    "seed" => seed, "error" => e.to_string());
                true
            }
        });
        drop(unresolved);
        self.ring.add(nodes);
    }
}

impl<T: Transport> Topology for Cluster<T> {
    fn refresh(&self) {
        Cluster::refresh(self)
    }

    fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    fn log(&self) -> &Logger {
        &self.log
    }
}
