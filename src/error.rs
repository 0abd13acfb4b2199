//! Error types for the echo server.
//!
//! Failures fall into three classes with different blast radius:
//! - `ServerError::Bind` is fatal to startup; no partial shard set runs.
//! - `ServerError::Accept` is fatal to one shard; it stops taking connections.
//! - `ConnectionError` ends a single connection and never leaves its task.

use std::io;
use thiserror::Error;

/// Shard and coordinator level failures.
#[derive(Error, Debug)]
pub enum ServerError {
    /// A shard could not open its listening socket.
    #[error("shard {shard} failed to bind port {port}")]
    Bind {
        shard: usize,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The accept call itself failed; the shard no longer accepts connections.
    #[error("shard {shard} accept loop failed")]
    Accept {
        shard: usize,
        #[source]
        source: io::Error,
    },

    /// The shard thread or its runtime could not be created.
    #[error("shard {shard} could not be started")]
    ShardSpawn {
        shard: usize,
        #[source]
        source: io::Error,
    },

    /// The shard thread went away without reporting a result.
    #[error("shard {shard} terminated unexpectedly")]
    ShardExited { shard: usize },
}

impl ServerError {
    /// Shard the error originated on.
    pub fn shard(&self) -> usize {
        match self {
            Self::Bind { shard, .. }
            | Self::Accept { shard, .. }
            | Self::ShardSpawn { shard, .. }
            | Self::ShardExited { shard } => *shard,
        }
    }
}

/// Read, write or flush failure on one connection.
#[derive(Error, Debug)]
#[error("connection {conn_id} I/O failed")]
pub struct ConnectionError {
    pub conn_id: usize,
    #[source]
    pub source: io::Error,
}
