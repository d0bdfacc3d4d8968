// Copyright 2020 Replset Developers

//! Bounded retry with topology refresh.

use std::thread;
use std::time::Duration;

use slog::{warn, Logger};

use crate::error::Error;

/// Something whose view of the replica set can be refreshed between
/// attempts.
pub trait Topology {
    fn refresh(&self);
    fn retry_interval(&self) -> Duration;
    fn log(&self) -> &Logger;
}

/// Run `f`. When it fails with a connection failure or a replica set
/// reconfiguration, wait the retry interval, refresh the topology and try
/// again, up to `retries` more times. The last error is returned once the
/// retries are used up; any other error is returned at once.
pub fn with_retry<C, R, F>(
    topology: &C,
    retries: u32,
    mut f: F,
) -> Result<R, Error>
where
    C: Topology + ?Sized,
    F: FnMut() -> Result<R, Error>,
{
    let mut remaining = retries;
    loop {
        match f() {
            Ok(r) => return Ok(r),
            Err(e) if remaining > 0 && e.is_retryable() => {
                remaining -= 1;
                warn!(topology.log(), "operation failed, retrying";
                    "error" => e.to_string(),
                    "retries_left" => remaining);
                thread::sleep(topology.retry_interval());
                topology.refresh();
            }
            Err(e) => return Err(e),
        }
    }
}
