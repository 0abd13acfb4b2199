//! Connection state machine for echoing a single TCP stream.
//!
//! A connection is owned by exactly one task on exactly one shard. The task
//! loops `Reading -> Echoing -> Reading` until the peer closes its send side
//! or an I/O error occurs, then runs the close step exactly once.

use crate::error::ConnectionError;
use bytes::BytesMut;
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the next chunk from the peer.
    Reading,
    /// Writing the last chunk back and flushing it.
    Echoing,
    /// Flushing and shutting down the write side.
    Closing,
    /// Nothing more will be read or written.
    Closed,
}

/// What a finished connection task reports back to its shard.
#[derive(Debug)]
pub struct ConnectionReport {
    pub conn_id: usize,
    pub peer: SocketAddr,
    pub bytes_echoed: u64,
    pub result: Result<(), ConnectionError>,
}

/// A single client connection.
pub struct Connection<S> {
    id: usize,
    peer: SocketAddr,
    stream: S,
    buffer: BytesMut,
    state: ConnState,
    /// Set once a read returns zero bytes.
    peer_closed: bool,
    bytes_echoed: u64,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a new connection in initial reading state.
    pub fn new(id: usize, stream: S, peer: SocketAddr) -> Self {
        Self {
            id,
            peer,
            stream,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
            state: ConnState::Reading,
            peer_closed: false,
            bytes_echoed: 0,
        }
    }

    #[allow(dead_code)]
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// The single termination predicate for the echo loop.
    fn ended(&self) -> bool {
        self.peer_closed || matches!(self.state, ConnState::Closing | ConnState::Closed)
    }

    /// Drive the connection to completion and report how it ended.
    pub async fn run(mut self) -> ConnectionReport {
        let result = self.process().await.map_err(|source| ConnectionError {
            conn_id: self.id,
            source,
        });
        self.close().await;

        ConnectionReport {
            conn_id: self.id,
            peer: self.peer,
            bytes_echoed: self.bytes_echoed,
            result,
        }
    }

    async fn process(&mut self) -> io::Result<()> {
        while !self.ended() {
            self.echo_once().await?;
        }
        Ok(())
    }

    /// One read, and if it produced data, one write plus flush.
    async fn echo_once(&mut self) -> io::Result<()> {
        self.state = ConnState::Reading;
        self.buffer.clear();

        let n = self.stream.read_buf(&mut self.buffer).await?;
        if n == 0 {
            trace!(conn_id = self.id, "Connection closed by client");
            self.peer_closed = true;
            return Ok(());
        }

        self.state = ConnState::Echoing;
        self.stream.write_all(&self.buffer).await?;
        self.stream.flush().await?;
        self.bytes_echoed += n as u64;
        trace!(conn_id = self.id, bytes = n, "Echoed chunk");

        Ok(())
    }

    /// Best-effort flush and shutdown of the write side. Runs at most once;
    /// its own errors are swallowed.
    async fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        self.state = ConnState::Closing;

        if let Err(e) = self.stream.flush().await {
            trace!(conn_id = self.id, error = %e, "Flush on close failed");
        }
        if let Err(e) = self.stream.shutdown().await {
            trace!(conn_id = self.id, error = %e, "Shutdown on close failed");
        }

        self.state = ConnState::Closed;
    }
}

/// Bookkeeping for one live connection task.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionEntry {
    pub peer: SocketAddr,
}

/// Registry of a shard's live connection tasks using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations. Unbounded: the shard
/// never refuses a connection because of the registry.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Slab<ConnectionEntry>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and return its id.
    pub fn insert(&mut self, peer: SocketAddr) -> usize {
        self.connections.insert(ConnectionEntry { peer })
    }

    #[allow(dead_code)]
    pub fn get(&self, id: usize) -> Option<&ConnectionEntry> {
        self.connections.get(id)
    }

    /// Remove a finished connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<ConnectionEntry> {
        self.connections.try_remove(id)
    }

    #[allow(dead_code)]
    pub fn contains(&self, id: usize) -> bool {
        self.connections.contains(id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
