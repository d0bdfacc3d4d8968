// Copyright 2020 Replset Developers

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::convert::TryFrom;
use std::io::{Error as IOError, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use slog::{o, Drain, Logger};

use replset::address::NodeAddress;
use replset::auth::{Authenticator, CommandRunner};
use replset::cluster::Cluster;
use replset::config::ClusterOptions;
use replset::connection::{Transport, TransportFactory};
use replset::error::Error;
use replset::node::Tags;
use replset::protocol::{
    Document, Operation, QueryFlags, Reply, ReplyFlags, WireCodec,
};

pub fn logger() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    )
}

pub fn doc(v: Value) -> Document {
    match v {
        Value::Object(map) => map,
        other => panic!("not a document: {}", other),
    }
}

/// Options with short intervals so tests do not wait on the defaults.
pub fn options() -> ClusterOptions {
    ClusterOptions {
        pool_size: Some(2),
        pool_timeout: Some(100),
        timeout: Some(1000),
        retry_interval: Some(10),
        log: Some(logger()),
        ..Default::default()
    }
}

pub fn cluster(
    network: &FakeNetwork,
    seeds: &[&str],
    options: ClusterOptions,
) -> Cluster<FakeTransport> {
    Cluster::new(
        seeds,
        options,
        Arc::new(JsonCodec),
        network.transport_factory(),
    )
}

pub const A: &str = "127.0.0.1:27017";
pub const B: &str = "127.0.0.2:27017";
pub const C: &str = "127.0.0.3:27017";

/// A primary at `A` and secondaries at `B` and `C`.
pub fn replica_set() -> FakeNetwork {
    let network = FakeNetwork::new();
    network.add(A, FakeServer::primary(&[A, B, C]));
    network.add(B, FakeServer::secondary(&[A, B, C]));
    network.add(C, FakeServer::secondary(&[A, B, C]));
    network
}

/// A misbehavior injected into the next operation a server handles.
/// Probes are never affected.
#[derive(Clone, Debug)]
pub enum Fault {
    /// The socket is reset.
    Drop,
    /// The server answers "not master".
    NotMaster,
    /// The server answers with an invalid frame.
    Garbage,
    /// The server answers with an ordinary error.
    Fail(String),
}

#[derive(Clone, Debug, Default)]
pub struct FakeServer {
    pub primary: bool,
    pub secondary: bool,
    pub arbiter: bool,
    pub reachable: bool,
    pub hosts: Vec<String>,
    pub tags: Tags,
    pub faults: VecDeque<Fault>,
    /// database -> (username, password)
    pub users: HashMap<String, (String, String)>,
    pub connects: usize,
    pub probes: usize,
    pub operations: usize,
    pub writes: usize,
}

impl FakeServer {
    pub fn primary(hosts: &[&str]) -> Self {
        FakeServer {
            primary: true,
            reachable: true,
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn secondary(hosts: &[&str]) -> Self {
        FakeServer {
            secondary: true,
            reachable: true,
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn arbiter(hosts: &[&str]) -> Self {
        FakeServer {
            arbiter: true,
            reachable: true,
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_user(mut self, database: &str, user: &str, pwd: &str) -> Self {
        self.users
            .insert(database.to_string(), (user.to_string(), pwd.to_string()));
        self
    }

    fn ismaster(&self) -> Document {
        let mut reply = doc(json!({
            "ok": 1,
            "ismaster": self.primary,
            "secondary": self.secondary,
            "arbiterOnly": self.arbiter,
            "hosts": self.hosts,
            "setName": "rs0",
        }));
        if !self.tags.is_empty() {
            reply.insert(String::from("tags"), json!(self.tags));
        }
        reply
    }
}

/// A set of in-memory servers keyed by socket address.
#[derive(Clone, Default)]
pub struct FakeNetwork {
    servers: Arc<Mutex<HashMap<SocketAddr, FakeServer>>>,
}

impl FakeNetwork {
    pub fn new() -> Self {
        FakeNetwork::default()
    }

    pub fn add(&self, addr: &str, server: FakeServer) {
        self.lock().insert(socket_addr(addr), server);
    }

    pub fn with<R, F>(&self, addr: &str, f: F) -> R
    where
        F: FnOnce(&mut FakeServer) -> R,
    {
        let mut servers = self.lock();
        let server = servers
            .get_mut(&socket_addr(addr))
            .unwrap_or_else(|| panic!("no server at {}", addr));
        f(server)
    }

    pub fn server(&self, addr: &str) -> FakeServer {
        self.with(addr, |server| server.clone())
    }

    pub fn inject(&self, addr: &str, fault: Fault) {
        self.with(addr, |server| server.faults.push_back(fault));
    }

    pub fn set_reachable(&self, addr: &str, reachable: bool) {
        self.with(addr, |server| server.reachable = reachable);
    }

    pub fn transport_factory(&self) -> TransportFactory<FakeTransport> {
        let network = self.clone();
        Arc::new(move |address: &NodeAddress| {
            FakeTransport::new(network.clone(), address.resolved)
        })
    }

    fn lock(&self) -> MutexGuard<HashMap<SocketAddr, FakeServer>> {
        self.servers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn socket_addr(addr: &str) -> SocketAddr {
    addr.parse()
        .unwrap_or_else(|_| panic!("invalid socket address {}", addr))
}

/// A socket to a `FakeServer`. Requests are handled as soon as they are
/// written and their replies are queued for reading.
pub struct FakeTransport {
    network: FakeNetwork,
    addr: SocketAddr,
    connected: bool,
    broken: bool,
    inbox: VecDeque<u8>,
    logins: HashMap<String, String>,
    last_error: Option<Document>,
}

impl FakeTransport {
    pub fn new(network: FakeNetwork, addr: SocketAddr) -> Self {
        FakeTransport {
            network,
            addr,
            connected: false,
            broken: false,
            inbox: VecDeque::new(),
            logins: HashMap::new(),
            last_error: None,
        }
    }

    pub fn logins(&self) -> &HashMap<String, String> {
        &self.logins
    }

    fn queue(&mut self, reply: &Reply) {
        let body = serde_json::to_vec(reply).unwrap();
        let length = i32::try_from(body.len() + 4).unwrap();
        self.inbox.extend(&length.to_le_bytes());
        self.inbox.extend(body);
    }

    fn queue_document(&mut self, document: Document) {
        self.queue(&Reply {
            documents: vec![document],
            ..Default::default()
        });
    }

    fn handle(
        &mut self,
        server: &mut FakeServer,
        operation: Operation,
    ) -> Result<(), IOError> {
        if let Operation::Command { command, .. } = &operation {
            if command.contains_key("ismaster") {
                server.probes += 1;
                self.queue_document(server.ismaster());
                return Ok(());
            }
        }

        server.operations += 1;
        match server.faults.pop_front() {
            Some(Fault::Drop) => {
                self.broken = true;
                return Err(reset());
            }
            Some(Fault::Garbage) => {
                self.inbox.extend(&(-1i32).to_le_bytes());
                return Ok(());
            }
            Some(fault) if !operation.expects_reply() => {
                server.faults.push_front(fault);
            }
            Some(Fault::NotMaster) => {
                self.fail(&operation, "not master", 10107);
                return Ok(());
            }
            Some(Fault::Fail(msg)) => {
                self.fail(&operation, &msg, 2);
                return Ok(());
            }
            None => (),
        }

        match operation {
            Operation::Command { database, command } => {
                let reply = self.command(server, &database, &command);
                self.queue_document(reply);
            }
            Operation::Query { options, .. } => {
                let secondary_ok = options.flags.contains(QueryFlags::SECONDARY_OK);
                if !server.primary && !secondary_ok {
                    self.fail(&operation_stub(), "not master and slaveOk=false", 13435);
                } else {
                    let served_by = self.addr.to_string();
                    self.queue(&Reply {
                        cursor_id: 42,
                        documents: vec![doc(json!({
                            "served_by": served_by,
                            "secondary_ok": secondary_ok,
                        }))],
                        ..Default::default()
                    });
                }
            }
            Operation::GetMore { cursor_id, .. } => {
                if cursor_id == 42 {
                    self.queue(&Reply {
                        starting_from: 1,
                        documents: vec![doc(json!({"n": 2}))],
                        ..Default::default()
                    });
                } else {
                    self.queue(&Reply {
                        flags: ReplyFlags::CURSOR_NOT_FOUND,
                        ..Default::default()
                    });
                }
            }
            Operation::Insert { .. }
            | Operation::Update { .. }
            | Operation::Delete { .. } => {
                if server.primary {
                    server.writes += 1;
                    self.last_error = None;
                } else {
                    self.last_error =
                        Some(doc(json!({"err": "not master", "code": 10058})));
                }
            }
            Operation::KillCursors { .. } => (),
        }
        Ok(())
    }

    fn command(
        &mut self,
        server: &FakeServer,
        database: &str,
        command: &Document,
    ) -> Document {
        let name = command.keys().next().cloned().unwrap_or_default();
        match name.as_str() {
            "authenticate" => {
                let user = command.get("user").and_then(Value::as_str);
                let pwd = command.get("pwd").and_then(Value::as_str);
                match (server.users.get(database), user, pwd) {
                    (Some((u, p)), Some(user), Some(pwd))
                        if u == user && p == pwd =>
                    {
                        self.logins
                            .insert(database.to_string(), user.to_string());
                        doc(json!({"ok": 1}))
                    }
                    _ => doc(json!({"ok": 0, "errmsg": "auth failed", "code": 18})),
                }
            }
            "logout" => {
                self.logins.remove(database);
                doc(json!({"ok": 1}))
            }
            "whoami" => {
                doc(json!({"ok": 1, "user": self.logins.get(database)}))
            }
            "getlasterror" => {
                let mut reply = doc(json!({"ok": 1, "err": null, "n": 1}));
                if let Some(last_error) = self.last_error.take() {
                    reply.extend(last_error);
                }
                reply
            }
            _ => doc(json!({"ok": 1, "served_by": self.addr.to_string()})),
        }
    }

    fn fail(&mut self, operation: &Operation, msg: &str, code: i64) {
        match operation {
            Operation::Command { .. } => {
                self.queue_document(doc(json!({
                    "ok": 0,
                    "errmsg": msg,
                    "code": code,
                })))
            }
            _ => self.queue(&Reply {
                flags: ReplyFlags::QUERY_FAILURE,
                documents: vec![doc(json!({"$err": msg, "code": code}))],
                ..Default::default()
            }),
        }
    }
}

// Any non-command operation; only its kind matters to `fail`.
fn operation_stub() -> Operation {
    Operation::KillCursors { cursor_ids: vec![] }
}

fn reset() -> IOError {
    IOError::new(ErrorKind::ConnectionReset, "connection reset by peer")
}

#[derive(Serialize)]
struct OutgoingRequest<'a> {
    request_id: i32,
    operation: &'a Operation,
}

#[derive(Deserialize)]
struct IncomingRequest {
    #[allow(dead_code)]
    request_id: i32,
    operation: Operation,
}

impl Transport for FakeTransport {
    type Error = IOError;

    fn connect(&mut self, _timeout: Duration) -> Result<(), Self::Error> {
        let mut servers = self.network.lock();
        let server = servers.get_mut(&self.addr).ok_or_else(|| {
            IOError::new(ErrorKind::ConnectionRefused, "no such server")
        })?;
        if !server.reachable {
            return Err(IOError::new(
                ErrorKind::ConnectionRefused,
                "connection refused",
            ));
        }
        server.connects += 1;
        self.connected = true;
        self.broken = false;
        self.inbox.clear();
        self.logins.clear();
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        if !self.connected || self.broken {
            return Err(IOError::new(ErrorKind::NotConnected, "not connected"));
        }
        let network = self.network.clone();
        let mut servers = network.lock();
        let server = match servers.get_mut(&self.addr) {
            Some(server) if server.reachable => server,
            _ => {
                self.broken = true;
                return Err(reset());
            }
        };

        let mut rest = bytes;
        while rest.len() >= 4 {
            let mut header = [0; 4];
            header.copy_from_slice(&rest[..4]);
            let length = usize::try_from(i32::from_le_bytes(header)).unwrap();
            let request: IncomingRequest =
                serde_json::from_slice(&rest[4..length]).unwrap();
            rest = &rest[length..];
            self.handle(server, request.operation)?;
        }
        Ok(())
    }

    fn read(&mut self, n: usize) -> Result<Vec<u8>, Self::Error> {
        if !self.connected || self.broken {
            return Err(IOError::new(ErrorKind::NotConnected, "not connected"));
        }
        if self.inbox.len() < n {
            return Err(IOError::new(ErrorKind::UnexpectedEof, "no reply"));
        }
        Ok(self.inbox.drain(..n).collect())
    }

    fn is_alive(&self) -> bool {
        self.connected
            && !self.broken
            && self
                .network
                .lock()
                .get(&self.addr)
                .map_or(false, |server| server.reachable)
    }

    fn disconnect(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        self.broken = false;
        self.inbox.clear();
        self.logins.clear();
        self.last_error = None;
        Ok(())
    }
}

/// Frames each message as a little-endian length followed by JSON.
pub struct JsonCodec;

impl WireCodec for JsonCodec {
    fn serialize(
        &self,
        request_id: i32,
        operation: &Operation,
    ) -> Result<Vec<u8>, Error> {
        let body = serde_json::to_vec(&OutgoingRequest {
            request_id,
            operation,
        })
        .map_err(|e| Error::ProtocolError(e.to_string()))?;
        let length = i32::try_from(body.len() + 4)
            .map_err(|e| Error::ProtocolError(e.to_string()))?;
        let mut message = length.to_le_bytes().to_vec();
        message.extend(body);
        Ok(message)
    }

    fn deserialize_reply(&self, message: &[u8]) -> Result<Reply, Error> {
        let body = message
            .get(4..)
            .ok_or_else(|| Error::ProtocolError(String::from("short reply")))?;
        serde_json::from_slice(body)
            .map_err(|e| Error::ProtocolError(e.to_string()))
    }
}

/// Logs in with a plain `authenticate` command and counts the attempts.
#[derive(Clone, Default)]
pub struct FakeAuthenticator {
    pub logins: Arc<AtomicUsize>,
}

impl Authenticator for FakeAuthenticator {
    fn login(
        &self,
        runner: &mut dyn CommandRunner,
        database: &str,
        username: &str,
        password: &str,
    ) -> Result<(), Error> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        runner
            .run_command(
                database,
                doc(json!({
                    "authenticate": 1,
                    "user": username,
                    "pwd": password,
                })),
            )
            .map(|_| ())
    }
}
