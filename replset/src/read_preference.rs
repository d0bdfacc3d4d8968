// Copyright 2020 Replset Developers

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::connection::Transport;
use crate::error::Error;
use crate::node::{Node, Tags};
use crate::protocol::{QueryFlags, QueryOptions};
use crate::ring::Ring;

/// Which nodes may serve a read.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadPreference {
    /// Only the primary.
    Primary,
    /// The primary, or a secondary when there is no primary.
    PrimaryPreferred,
    /// Only secondaries.
    Secondary,
    /// A secondary, or the primary when there is no secondary.
    SecondaryPreferred,
    /// The lowest latency node, primary or secondary.
    Nearest,
}

impl Default for ReadPreference {
    fn default() -> Self {
        ReadPreference::Primary
    }
}

impl ReadPreference {
    /// Pick a node from `ring`. `tags` narrows secondaries and nearest
    /// candidates; the primary is never filtered by tags.
    pub fn select<T: Transport>(
        self,
        ring: &Ring<T>,
        tags: &[Tags],
    ) -> Result<Arc<Node<T>>, Error> {
        let node = match self {
            ReadPreference::Primary => ring.next_primary(),
            ReadPreference::PrimaryPreferred => ring
                .next_primary()
                .or_else(|| ring.next_secondary_tagged(tags)),
            ReadPreference::Secondary => ring.next_secondary_tagged(tags),
            ReadPreference::SecondaryPreferred => ring
                .next_secondary_tagged(tags)
                .or_else(|| ring.next_primary()),
            ReadPreference::Nearest => ring.nearest(tags),
        };
        node.ok_or_else(|| Error::Unavailable(self.unavailable_message()))
    }

    /// Whether the preference can be served by a non-primary node.
    pub fn allows_secondary(self) -> bool {
        self != ReadPreference::Primary
    }

    /// Add the secondary-ok flag to `options` when the preference may
    /// target a non-primary node.
    pub fn query_options(self, mut options: QueryOptions) -> QueryOptions {
        if self.allows_secondary() {
            options.flags |= QueryFlags::SECONDARY_OK;
        }
        options
    }

    fn unavailable_message(self) -> String {
        match self {
            ReadPreference::Primary => String::from("no primary available"),
            ReadPreference::Secondary => {
                String::from("no secondary available")
            }
            ReadPreference::PrimaryPreferred
            | ReadPreference::SecondaryPreferred => {
                String::from("no primary or secondary available")
            }
            ReadPreference::Nearest => String::from("no node available"),
        }
    }
}

impl fmt::Display for ReadPreference {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ReadPreference::Primary => "primary",
            ReadPreference::PrimaryPreferred => "primaryPreferred",
            ReadPreference::Secondary => "secondary",
            ReadPreference::SecondaryPreferred => "secondaryPreferred",
            ReadPreference::Nearest => "nearest",
        };
        name.fmt(fmt)
    }
}

impl FromStr for ReadPreference {
    type Err = Error;

    /// Accepts the camel case names as well as their snake case spelling.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('_', "").to_lowercase().as_str() {
            "primary" => Ok(ReadPreference::Primary),
            "primarypreferred" => Ok(ReadPreference::PrimaryPreferred),
            "secondary" => Ok(ReadPreference::Secondary),
            "secondarypreferred" => Ok(ReadPreference::SecondaryPreferred),
            "nearest" => Ok(ReadPreference::Nearest),
            _ => Err(Error::InvalidConfiguration(format!(
                "unknown read preference {}",
                s
            ))),
        }
    }
}
