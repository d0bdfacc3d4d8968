// Copyright 2020 Replset Developers

use std::collections::HashMap;
use std::fmt::Debug;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use crate::error::Error;

/// Turns a host name and port into a socket address.
///
/// Node identity is the resolved address, so every node a cluster learns
/// about passes through a resolver exactly once, when the node is created.
pub trait AddressResolver: Debug + Send + Sync {
    fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr, Error>;
}

/// Resolves through the operating system's name service.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

impl AddressResolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr, Error> {
        (host, port)
            .to_socket_addrs()
            .map_err(|e| {
                Error::InvalidAddress(format!("{}:{}: {}", host, port, e))
            })?
            .next()
            .ok_or_else(|| {
                Error::InvalidAddress(format!(
                    "{}:{}: no addresses found",
                    host, port
                ))
            })
    }
}

/// Resolves from a fixed table of host names. IP literals resolve to
/// themselves.
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, IpAddr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        StaticResolver::default()
    }

    pub fn with_host(mut self, host: &str, ip: IpAddr) -> Self {
        self.hosts.insert(host.to_lowercase(), ip);
        self
    }
}

impl AddressResolver for StaticResolver {
    fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr, Error> {
        if let Some(ip) = self.hosts.get(&host.to_lowercase()) {
            return Ok(SocketAddr::new(*ip, port));
        }
        host.parse::<IpAddr>()
            .map(|ip| SocketAddr::new(ip, port))
            .map_err(|_| {
                Error::InvalidAddress(format!("unknown host {}", host))
            })
    }
}
