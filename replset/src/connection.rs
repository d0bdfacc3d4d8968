// Copyright 2020 Replset Developers

use std::convert::TryFrom;
use std::error;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use slog::{debug, Logger};

use crate::address::NodeAddress;
use crate::auth::{self, Authenticator, CommandRunner, Credentials};
use crate::error::Error;
use crate::protocol::{Document, Operation, Reply, WireCodec};

// Replies larger than this are treated as a corrupt stream.
const MAX_MESSAGE_SIZE: usize = 48 * 1024 * 1024;
const HEADER_SIZE: usize = 4;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Returns the next request id, unique across the process until it wraps.
pub fn next_request_id() -> i32 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// A byte stream to one node.
///
/// The `Transport` trait is the only thing a caller must implement to carry
/// replica set traffic over a particular kind of socket. A transport is
/// created unconnected by the factory handed to the cluster and is connected
/// on first use.
pub trait Transport: Send + Sized + 'static {
    /// The error type returned by the transport. Each implementation picks
    /// its own; transport errors are surfaced to callers as
    /// `Error::ConnectionFailure`.
    type Error: error::Error;
    /// Establish the socket, giving up after `timeout`.
    fn connect(&mut self, timeout: Duration) -> Result<(), Self::Error>;
    /// Write every byte of `bytes`.
    fn write(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;
    /// Read exactly `n` bytes.
    fn read(&mut self, n: usize) -> Result<Vec<u8>, Self::Error>;
    /// Whether the socket still looks usable. Must not block.
    fn is_alive(&self) -> bool;
    fn disconnect(&mut self) -> Result<(), Self::Error>;
}

/// Creates an unconnected transport for a node.
pub type TransportFactory<T> = Arc<dyn Fn(&NodeAddress) -> T + Send + Sync>;

/// One transport to one node, plus the bookkeeping the pool and the node
/// need: identity, last use, and which logins have been applied on the
/// socket.
pub struct Connection<T: Transport> {
    id: u64,
    address: NodeAddress,
    transport: T,
    connected: bool,
    timeout: Duration,
    last_use: Option<Instant>,
    logins: Credentials,
}

impl<T: Transport> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address.to_string())
            .field("connected", &self.connected)
            .field("last_use", &self.last_use)
            .finish()
    }
}

impl<T: Transport> Connection<T> {
    pub fn new(address: NodeAddress, transport: T, timeout: Duration) -> Self {
        Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            address,
            transport,
            connected: false,
            timeout,
            last_use: None,
            logins: Credentials::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn last_use(&self) -> Option<Instant> {
        self.last_use
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_alive(&self) -> bool {
        self.connected && self.transport.is_alive()
    }

    /// Connected once, and no longer alive.
    pub fn is_broken(&self) -> bool {
        self.connected && !self.transport.is_alive()
    }

    /// The logins applied on the current socket.
    pub fn logins(&self) -> &Credentials {
        &self.logins
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn connect(&mut self) -> Result<(), Error> {
        if self.connected {
            return Ok(());
        }
        let timeout = self.timeout;
        self.transport
            .connect(timeout)
            .map_err(|e| self.failure(e))?;
        self.connected = true;
        self.logins.clear();
        Ok(())
    }

    /// Close the socket. A fresh socket carries no logins, so the applied
    /// set is reset as well.
    pub fn disconnect(&mut self) {
        if self.connected {
            // The socket is gone either way.
            let _ = self.transport.disconnect();
        }
        self.connected = false;
        self.logins.clear();
    }

    /// Serialize every operation into one buffer and write it in a single
    /// call, so that a write and its last-error command travel together.
    pub fn write(
        &mut self,
        codec: &dyn WireCodec,
        operations: &[Operation],
    ) -> Result<(), Error> {
        let mut buf = Vec::new();
        for operation in operations {
            buf.extend(codec.serialize(next_request_id(), operation)?);
        }
        self.connect()?;
        self.transport.write(&buf).map_err(|e| self.failure(e))?;
        self.last_use = Some(Instant::now());
        Ok(())
    }

    /// Read one reply: the little-endian length header, then the rest of the
    /// message. The whole frame is handed to the codec.
    pub fn read(&mut self, codec: &dyn WireCodec) -> Result<Reply, Error> {
        let header = self
            .transport
            .read(HEADER_SIZE)
            .map_err(|e| self.failure(e))?;
        let length = message_length(&header)?;
        let body = self
            .transport
            .read(length - HEADER_SIZE)
            .map_err(|e| self.failure(e))?;
        self.last_use = Some(Instant::now());

        let mut frame = header;
        frame.extend(body);
        codec.deserialize_reply(&frame)
    }

    /// Write one operation and read its reply.
    pub fn round_trip(
        &mut self,
        codec: &dyn WireCodec,
        operation: &Operation,
    ) -> Result<Reply, Error> {
        self.write(codec, std::slice::from_ref(operation))?;
        self.read(codec)
    }

    pub fn run_command(
        &mut self,
        codec: &dyn WireCodec,
        database: &str,
        command: Document,
    ) -> Result<Document, Error> {
        let operation = Operation::command(database, command.clone());
        self.round_trip(codec, &operation)?
            .command_result(database, &command)
    }

    /// Bring the logins applied on this socket in line with `wanted`:
    /// log out of databases that were dropped and log in where the login is
    /// new or has changed.
    pub fn apply_credentials(
        &mut self,
        codec: &dyn WireCodec,
        wanted: &Credentials,
        authenticator: &dyn Authenticator,
        log: &Logger,
    ) -> Result<(), Error> {
        let delta = auth::login_delta(&self.logins, wanted);
        if delta.is_empty() {
            return Ok(());
        }

        for database in delta.logout {
            debug!(log, "logging out"; "database" => &database,
                "connection" => self.id);
            authenticator.logout(&mut Runner::new(self, codec), &database)?;
            self.logins.remove(&database);
        }

        for (database, (username, password)) in delta.login {
            debug!(log, "logging in"; "database" => &database,
                "connection" => self.id);
            authenticator.login(
                &mut Runner::new(self, codec),
                &database,
                &username,
                &password,
            )?;
            self.logins.insert(database, (username, password));
        }
        Ok(())
    }

    fn failure(&self, err: T::Error) -> Error {
        Error::ConnectionFailure(format!("{}: {}", self.address, err))
    }
}

fn message_length(header: &[u8]) -> Result<usize, Error> {
    let bytes = <[u8; HEADER_SIZE]>::try_from(header).map_err(|_| {
        Error::ProtocolError(format!(
            "short message header: {} bytes",
            header.len()
        ))
    })?;
    let length = i32::from_le_bytes(bytes);
    match usize::try_from(length) {
        Ok(len) if len >= HEADER_SIZE && len <= MAX_MESSAGE_SIZE => Ok(len),
        _ => Err(Error::ProtocolError(format!(
            "invalid message length {}",
            length
        ))),
    }
}

// Lets an authenticator drive commands over one connection.
struct Runner<'a, T: Transport> {
    connection: &'a mut Connection<T>,
    codec: &'a dyn WireCodec,
}

impl<'a, T: Transport> Runner<'a, T> {
    fn new(connection: &'a mut Connection<T>, codec: &'a dyn WireCodec) -> Self {
        Runner { connection, codec }
    }
}

impl<'a, T: Transport> CommandRunner for Runner<'a, T> {
    fn run_command(
        &mut self,
        database: &str,
        command: Document,
    ) -> Result<Document, Error> {
        self.connection.run_command(self.codec, database, command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lengths() {
        assert_eq!(message_length(&[16, 0, 0, 0]).unwrap(), 16);
        assert_eq!(message_length(&[4, 0, 0, 0]).unwrap(), 4);
        assert!(message_length(&[3, 0, 0, 0]).is_err());
        assert!(message_length(&[0xff, 0xff, 0xff, 0xff]).is_err());
        assert!(message_length(&[16, 0]).is_err());
    }

    #[test]
    fn request_ids_increase() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(b > a);
    }
}
