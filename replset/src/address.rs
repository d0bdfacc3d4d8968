// Copyright 2020 Replset Developers

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

use base64;
use sha1::Sha1;

use derive_more::{Display, From, Into};

use crate::error::Error;
use crate::resolver::AddressResolver;

/// The port used when an address does not name one.
pub const DEFAULT_PORT: u16 = 27017;

/// A base64 encoded identifier derived from a node's resolved address.
#[derive(
    Clone, Debug, Display, Eq, From, Hash, Into, Ord, PartialOrd, PartialEq,
)]
pub struct NodeKey(String);

/// The address of one node in the replica set.
///
/// Two addresses are equal when they resolve to the same socket address,
/// whatever spelling they were given in.
#[derive(Clone, Debug)]
pub struct NodeAddress {
    /// The address exactly as it was supplied by a seed list or a peer list.
    pub original: String,
    pub host: String,
    pub port: u16,
    pub resolved: SocketAddr,
}

impl NodeAddress {
    /// Parse and resolve an address of the form `host`, `host:port`,
    /// `[v6]` or `[v6]:port`.
    pub fn resolve(
        original: &str,
        resolver: &dyn AddressResolver,
    ) -> Result<Self, Error> {
        let (host, port) = parse(original)?;
        let resolved = resolver.resolve(&host, port)?;
        Ok(NodeAddress {
            original: original.to_string(),
            host,
            port,
            resolved,
        })
    }

    pub fn key(&self) -> NodeKey {
        node_key(&self.resolved)
    }
}

impl PartialEq for NodeAddress {
    fn eq(&self, other: &NodeAddress) -> bool {
        self.resolved == other.resolved
    }
}

impl Eq for NodeAddress {}

impl Hash for NodeAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.resolved.hash(state)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.resolved.fmt(fmt)
    }
}

/// Split an address string into host and port.
pub fn parse(address: &str) -> Result<(String, u16), Error> {
    let address = address.trim();
    let invalid = || Error::InvalidAddress(address.to_string());

    if address.is_empty() {
        return Err(invalid());
    }

    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(invalid)?;
        let host = &rest[..end];
        let tail = &rest[end + 1..];
        let port = match tail {
            "" => None,
            _ => Some(tail.strip_prefix(':').ok_or_else(invalid)?),
        };
        (host, port)
    } else {
        match address.rfind(':') {
            Some(idx) if address[..idx].contains(':') => {
                // Bare IPv6 literal without a port.
                (address, None)
            }
            Some(idx) => (&address[..idx], Some(&address[idx + 1..])),
            None => (address, None),
        }
    };

    if host.is_empty() {
        return Err(invalid());
    }

    let port = match port {
        Some(p) => p.parse::<u16>().map_err(|_| invalid())?,
        None => DEFAULT_PORT,
    };

    Ok((host.to_lowercase(), port))
}

/// Return a base64 encoded identifier based on the resolved address.
pub fn node_key(resolved: &SocketAddr) -> NodeKey {
    let mut sha1 = Sha1::new();
    sha1.update(resolved.ip().to_string().as_bytes());
    sha1.update(b"||");
    sha1.update(resolved.port().to_string().as_bytes());

    base64::encode(&sha1.digest().bytes()).into()
}
