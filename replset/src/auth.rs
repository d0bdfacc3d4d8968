// Copyright 2020 Replset Developers

//! Credential propagation.
//!
//! The login handshake itself is not implemented here. An [`Authenticator`]
//! is handed a [`CommandRunner`] bound to one connection and drives whatever
//! command exchange the mechanism requires.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::error::Error;
use crate::protocol::Document;

/// The username and password used for one database.
pub type Login = (String, String);

/// Map from database name to the login used for it.
pub type Credentials = HashMap<String, Login>;

/// Credentials shared between a cluster and all of its nodes.
pub type SharedCredentials = Arc<RwLock<Credentials>>;

pub fn shared_credentials() -> SharedCredentials {
    Arc::new(RwLock::new(Credentials::new()))
}

/// Runs a command over a single, already connected socket.
pub trait CommandRunner {
    fn run_command(
        &mut self,
        database: &str,
        command: Document,
    ) -> Result<Document, Error>;
}

/// Performs the login and logout exchanges for one database on one socket.
pub trait Authenticator: Send + Sync {
    fn login(
        &self,
        runner: &mut dyn CommandRunner,
        database: &str,
        username: &str,
        password: &str,
    ) -> Result<(), Error>;

    fn logout(
        &self,
        runner: &mut dyn CommandRunner,
        database: &str,
    ) -> Result<(), Error> {
        let mut command = Document::new();
        command.insert(String::from("logout"), Value::from(1));
        runner.run_command(database, command).map(|_| ())
    }
}

/// The changes needed to bring a socket's applied logins in line with the
/// shared credentials.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct LoginDelta {
    pub login: Vec<(String, Login)>,
    pub logout: Vec<String>,
}

impl LoginDelta {
    pub fn is_empty(&self) -> bool {
        self.login.is_empty() && self.logout.is_empty()
    }
}

pub(crate) fn login_delta(
    applied: &Credentials,
    wanted: &Credentials,
) -> LoginDelta {
    let mut login: Vec<(String, Login)> = wanted
        .iter()
        .filter(|(db, creds)| applied.get(*db) != Some(*creds))
        .map(|(db, creds)| (db.clone(), creds.clone()))
        .collect();
    let mut logout: Vec<String> = applied
        .keys()
        .filter(|db| !wanted.contains_key(*db))
        .cloned()
        .collect();
    login.sort();
    logout.sort();
    LoginDelta { login, logout }
}
