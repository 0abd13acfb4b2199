//! Thread-per-core runtime for the echo server.
//!
//! Each shard is an OS thread running a current-thread tokio runtime inside
//! a `LocalSet`, with its own SO_REUSEPORT listener on the shared port. The
//! kernel spreads incoming connections across the shard sockets; a connection
//! lives and dies on the shard that accepted it.
//!
//! - `Coordinator`: starts and stops the whole shard set
//! - `shard`: per-shard thread, accept loop and task registry
//! - `connection`: per-connection echo state machine
//! - `listener`: socket setup and the `Acceptor` seam

mod affinity;
mod connection;
mod listener;
mod shard;

pub use shard::ShardState;

use crate::config::{Config, ShutdownMode};
use crate::error::ServerError;
use shard::{ShardHandle, ShardOptions};
use tracing::{error, info, warn};

/// Owns every shard and exposes a single `start` / `stop` surface.
pub struct Coordinator {
    config: Config,
    shards: Vec<ShardHandle>,
    port: Option<u16>,
}

impl Coordinator {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shards: Vec::new(),
            port: None,
        }
    }

    /// Start one shard per configured core and return once all of them are
    /// listening on `port`.
    ///
    /// If any shard fails to come up, the shards that did start are stopped
    /// and joined and the first failure is returned; no partial set runs.
    /// Port 0 is resolved by shard 0 and the others join the port it got.
    /// A fixed port already held by anything else, including another
    /// instance of this server, is a bind error.
    pub fn start(&mut self, port: u16) -> Result<u16, ServerError> {
        if let Some(bound) = self.port {
            warn!(port = bound, "Coordinator already started");
            return Ok(bound);
        }
        // Handles left over from a drained run are already joined.
        self.shards.clear();

        if port != 0 {
            if let Err(source) = listener::ensure_port_free(port) {
                error!(port, error = %source, "Port already in use");
                return Err(ServerError::Bind {
                    shard: 0,
                    port,
                    source,
                });
            }
        }

        let options = ShardOptions {
            on_accept_error: self.config.on_accept_error,
            pin: self.config.pin_shards,
        };
        info!(shards = self.config.shards, port, "Starting shards");

        let mut port = port;
        let mut failure = None;

        for id in 0..self.config.shards {
            let mut shard = match ShardHandle::spawn(id, port, options, listener::bind) {
                Ok(shard) => shard,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            if port == 0 {
                match shard.wait_ready() {
                    Ok(bound) => port = bound,
                    Err(e) => failure = Some(e),
                }
            }
            self.shards.push(shard);
            if failure.is_some() {
                break;
            }
        }

        if failure.is_none() {
            for shard in &mut self.shards {
                if let Err(e) = shard.wait_ready() {
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            error!(shard = e.shard(), error = %e, "Startup failed, stopping all shards");
            for shard in &mut self.shards {
                shard.signal_stop();
            }
            for mut shard in self.shards.drain(..) {
                let _ = shard.join();
            }
            return Err(e);
        }

        self.port = Some(port);
        info!(shards = self.shards.len(), port, "All shards listening");
        Ok(port)
    }

    /// Stop every shard according to the configured `ShutdownMode`.
    ///
    /// `Detach` returns immediately and leaves listeners and connections
    /// alone. `Drain` closes every listener and waits for every connection to
    /// finish; the first shard error seen while joining is returned.
    pub fn stop(&mut self) -> Result<(), ServerError> {
        match self.config.shutdown {
            ShutdownMode::Detach => {
                info!("Stop requested, shards left running");
                Ok(())
            }
            ShutdownMode::Drain => {
                info!(shards = self.shards.len(), "Draining shards");
                for shard in &mut self.shards {
                    shard.signal_stop();
                }

                self.port = None;
                let mut first_error = None;
                for shard in &mut self.shards {
                    if let Err(e) = shard.join() {
                        warn!(shard = shard.id(), error = %e, "Shard exited with error");
                        first_error.get_or_insert(e);
                    }
                }
                first_error.map_or(Ok(()), Err)
            }
        }
    }

    /// Current state of each shard, indexed by shard id.
    pub fn shard_states(&self) -> Vec<ShardState> {
        self.shards.iter().map(ShardHandle::state).collect()
    }

    /// Port all shards are bound to, once started.
    #[allow(dead_code)]
    pub fn bound_port(&self) -> Option<u16> {
        self.port
    }
}
