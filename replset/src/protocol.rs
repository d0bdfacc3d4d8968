// Copyright 2020 Replset Developers

//! The narrow interfaces this crate consumes from the wire codec.
//!
//! Operations are built here as plain values and handed to a [`WireCodec`]
//! to be turned into bytes; replies come back through the same codec. The
//! binary document format and the per-operation message layout live behind
//! that trait and are not part of this crate.

use derive_more::{BitAnd, BitOr, BitOrAssign, Display, From, Into};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{self, Error};

/// A key-ordered document, as sent to and received from a node.
pub type Document = Map<String, Value>;

/// Flags attached to an outgoing query.
#[derive(
    BitAnd,
    BitOr,
    BitOrAssign,
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Display,
    Eq,
    From,
    Into,
    PartialEq,
    Serialize,
)]
#[serde(transparent)]
pub struct QueryFlags(u32);

impl QueryFlags {
    pub const NONE: QueryFlags = QueryFlags(0);
    pub const TAILABLE: QueryFlags = QueryFlags(1 << 1);
    /// The query may be answered by a node that is not the primary.
    pub const SECONDARY_OK: QueryFlags = QueryFlags(1 << 2);
    pub const NO_CURSOR_TIMEOUT: QueryFlags = QueryFlags(1 << 4);
    pub const AWAIT_DATA: QueryFlags = QueryFlags(1 << 5);
    pub const EXHAUST: QueryFlags = QueryFlags(1 << 6);
    pub const PARTIAL: QueryFlags = QueryFlags(1 << 7);

    pub fn contains(self, other: QueryFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Flags set by a node on a reply.
#[derive(
    BitOr,
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Display,
    Eq,
    From,
    Into,
    PartialEq,
    Serialize,
)]
#[serde(transparent)]
pub struct ReplyFlags(u32);

impl ReplyFlags {
    pub const NONE: ReplyFlags = ReplyFlags(0);
    pub const CURSOR_NOT_FOUND: ReplyFlags = ReplyFlags(1);
    pub const QUERY_FAILURE: ReplyFlags = ReplyFlags(1 << 1);
    pub const AWAIT_CAPABLE: ReplyFlags = ReplyFlags(1 << 3);

    pub fn contains(self, other: ReplyFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct QueryOptions {
    pub flags: QueryFlags,
    pub skip: i32,
    pub limit: i32,
    pub fields: Option<Document>,
}

/// Options for an update.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct UpdateFlags {
    /// Insert the update document when nothing matches the selector.
    pub upsert: bool,
    /// Update every matching document instead of the first.
    pub multi: bool,
}

/// A single wire operation, prior to serialization.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum Operation {
    Command {
        database: String,
        command: Document,
    },
    Query {
        database: String,
        collection: String,
        selector: Document,
        options: QueryOptions,
    },
    Insert {
        database: String,
        collection: String,
        documents: Vec<Document>,
        continue_on_error: bool,
    },
    Update {
        database: String,
        collection: String,
        selector: Document,
        update: Document,
        flags: UpdateFlags,
    },
    Delete {
        database: String,
        collection: String,
        selector: Document,
        single: bool,
    },
    GetMore {
        database: String,
        collection: String,
        cursor_id: i64,
        limit: i32,
    },
    KillCursors {
        cursor_ids: Vec<i64>,
    },
}

impl Operation {
    pub fn command(database: &str, command: Document) -> Self {
        Operation::Command {
            database: database.to_string(),
            command,
        }
    }

    /// The database the operation targets. Killing cursors is not scoped to
    /// a database.
    pub fn database(&self) -> Option<&str> {
        match self {
            Operation::Command { database, .. }
            | Operation::Query { database, .. }
            | Operation::Insert { database, .. }
            | Operation::Update { database, .. }
            | Operation::Delete { database, .. }
            | Operation::GetMore { database, .. } => Some(database),
            Operation::KillCursors { .. } => None,
        }
    }

    /// Whether the node answers this operation with a reply message.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            Operation::Command { .. }
                | Operation::Query { .. }
                | Operation::GetMore { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::Command { .. } => "command",
            Operation::Query { .. } => "query",
            Operation::Insert { .. } => "insert",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
            Operation::GetMore { .. } => "get_more",
            Operation::KillCursors { .. } => "kill_cursors",
        }
    }
}

/// A decoded reply message.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Reply {
    pub cursor_id: i64,
    pub flags: ReplyFlags,
    pub starting_from: i32,
    pub documents: Vec<Document>,
}

impl Reply {
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    /// Interprets the reply to a command. The first document is the result;
    /// it must carry a truthy `ok` field.
    pub fn command_result(
        mut self,
        database: &str,
        command: &Document,
    ) -> Result<Document, Error> {
        if self.flags.contains(ReplyFlags::QUERY_FAILURE) {
            let details = self.documents.pop().unwrap_or_default();
            return Err(failure(database, command, details));
        }
        if self.documents.is_empty() {
            return Err(Error::ProtocolError(String::from(
                "command reply contained no documents",
            )));
        }
        let result = self.documents.swap_remove(0);
        if is_ok(&result) {
            Ok(result)
        } else {
            Err(failure(database, command, result))
        }
    }

    /// Interprets the reply to a query or get-more.
    pub fn query_result(self, cursor_id: i64) -> Result<Reply, Error> {
        if self.flags.contains(ReplyFlags::CURSOR_NOT_FOUND) {
            return Err(Error::CursorNotFound { cursor_id });
        }
        if self.flags.contains(ReplyFlags::QUERY_FAILURE) {
            let details =
                self.documents.into_iter().next().unwrap_or_default();
            if error::unauthorized(&details) {
                return Err(Error::AuthenticationFailure {
                    database: String::new(),
                    details,
                });
            }
            return Err(Error::QueryFailure { details });
        }
        Ok(self)
    }

    /// Interprets the reply to a last-error command pipelined after a write.
    /// A write error is reported in `err` even when `ok` is set.
    pub fn last_error_result(
        self,
        database: &str,
        command: &Document,
    ) -> Result<Document, Error> {
        let result = self.command_result(database, command)?;
        match result.get("err") {
            None | Some(Value::Null) => Ok(result),
            Some(_) => Err(failure(database, command, result)),
        }
    }
}

fn failure(database: &str, command: &Document, details: Document) -> Error {
    if error::unauthorized(&details) {
        Error::AuthenticationFailure {
            database: database.to_string(),
            details,
        }
    } else {
        Error::OperationFailure {
            command: command.clone(),
            details,
        }
    }
}

/// Servers report success as `1`, `1.0`, or `true`.
pub fn is_ok(document: &Document) -> bool {
    match document.get("ok") {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map_or(false, |f| f == 1.0),
        _ => false,
    }
}

/// Serializes operations and deserializes replies. Implemented outside this
/// crate.
pub trait WireCodec: Send + Sync {
    /// Serialize one operation into a complete, length-prefixed message.
    fn serialize(
        &self,
        request_id: i32,
        operation: &Operation,
    ) -> Result<Vec<u8>, Error>;

    /// Decode a complete reply message, including its length prefix.
    fn deserialize_reply(&self, message: &[u8]) -> Result<Reply, Error>;
}

/// An opaque write concern. When it produces a last-error command, that
/// command is sent on the same connection directly after the write and its
/// result is returned to the caller.
pub trait WriteConcern: Send + Sync {
    fn last_error_command(&self) -> Option<Document>;
}

/// Fire and forget.
#[derive(Clone, Copy, Debug, Default)]
pub struct Unacknowledged;

impl WriteConcern for Unacknowledged {
    fn last_error_command(&self) -> Option<Document> {
        None
    }
}

/// Acknowledge every write with the given last-error command, e.g.
/// `{"getlasterror": 1, "w": "majority"}`.
#[derive(Clone, Debug)]
pub struct Acknowledged(pub Document);

impl Default for Acknowledged {
    fn default() -> Self {
        let mut command = Document::new();
        command.insert(String::from("getlasterror"), Value::from(1));
        Acknowledged(command)
    }
}

impl WriteConcern for Acknowledged {
    fn last_error_command(&self) -> Option<Document> {
        Some(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn ok_values() {
        assert!(is_ok(&doc(json!({"ok": 1}))));
        assert!(is_ok(&doc(json!({"ok": 1.0}))));
        assert!(is_ok(&doc(json!({"ok": true}))));
        assert!(!is_ok(&doc(json!({"ok": 0}))));
        assert!(!is_ok(&doc(json!({}))));
    }

    #[test]
    fn command_result_classifies_failures() {
        let command = doc(json!({"count": "users"}));
        let reply = Reply {
            documents: vec![doc(json!({"ok": 0, "errmsg": "ns missing"}))],
            ..Default::default()
        };
        match reply.command_result("test", &command) {
            Err(Error::OperationFailure { details, .. }) => {
                assert_eq!(details["errmsg"], "ns missing")
            }
            other => panic!("unexpected result {:?}", other),
        }

        let reply = Reply {
            documents: vec![doc(json!({"ok": 0, "code": 13}))],
            ..Default::default()
        };
        assert!(matches!(
            reply.command_result("test", &command),
            Err(Error::AuthenticationFailure { .. })
        ));
    }

    #[test]
    fn query_result_flags() {
        let reply = Reply {
            flags: ReplyFlags::CURSOR_NOT_FOUND,
            ..Default::default()
        };
        assert!(matches!(
            reply.query_result(7),
            Err(Error::CursorNotFound { cursor_id: 7 })
        ));

        let reply = Reply {
            flags: ReplyFlags::QUERY_FAILURE,
            documents: vec![doc(json!({"$err": "bad query"}))],
            ..Default::default()
        };
        assert!(matches!(
            reply.query_result(0),
            Err(Error::QueryFailure { .. })
        ));
    }

    #[test]
    fn last_error_reports_write_errors() {
        let command = doc(json!({"getlasterror": 1}));
        let reply = Reply {
            documents: vec![doc(json!({"ok": 1, "err": "E11000 duplicate key"}))],
            ..Default::default()
        };
        assert!(matches!(
            reply.last_error_result("test", &command),
            Err(Error::OperationFailure { .. })
        ));

        let reply = Reply {
            documents: vec![doc(json!({"ok": 1, "err": null, "n": 1}))],
            ..Default::default()
        };
        assert_eq!(
            reply.last_error_result("test", &command).unwrap()["n"],
            1
        );
    }

    #[test]
    fn flags_combine() {
        let flags = QueryFlags::TAILABLE | QueryFlags::SECONDARY_OK;
        assert!(flags.contains(QueryFlags::SECONDARY_OK));
        assert!(!flags.contains(QueryFlags::EXHAUST));
    }
}
