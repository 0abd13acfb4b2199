//! One shard: a dedicated thread with its own single-threaded runtime,
//! its own listening socket, and the connections it accepted.
//!
//! Nothing inside a shard is shared with another shard. The coordinator
//! talks to a shard only through channels: a startup ack carrying the bound
//! port, a watch channel publishing `ShardState`, and a stop signal.

use crate::config::AcceptErrorPolicy;
use crate::error::ServerError;
use crate::runtime::affinity;
use crate::runtime::connection::{Connection, ConnectionRegistry, ConnectionReport};
use crate::runtime::listener::Acceptor;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread;
use tokio::sync::{oneshot, watch};
use tokio::task::{self, JoinError, JoinSet, LocalSet};
use tracing::{debug, error, info, warn};

/// Lifecycle of a shard as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    /// Thread spawned, listener not open yet.
    Starting,
    /// Accepting connections on `port`.
    Listening { port: u16 },
    /// Accept or bind failed; the shard takes no new connections.
    Failed,
    /// Stopped on request; the listener is closed.
    Stopped,
}

/// Per-shard settings copied into each shard thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShardOptions {
    pub on_accept_error: AcceptErrorPolicy,
    pub pin: bool,
}

/// Accept loop and connection bookkeeping for one shard.
pub struct ShardServer {
    id: usize,
    on_accept_error: AcceptErrorPolicy,
    registry: ConnectionRegistry,
    tasks: JoinSet<ConnectionReport>,
    /// Registry id of each connection task, so a task that panics still
    /// gives back its slot.
    task_ids: HashMap<task::Id, usize>,
    state: watch::Sender<ShardState>,
}

impl ShardServer {
    pub fn new(id: usize, options: ShardOptions, state: watch::Sender<ShardState>) -> Self {
        Self {
            id,
            on_accept_error: options.on_accept_error,
            registry: ConnectionRegistry::new(),
            tasks: JoinSet::new(),
            task_ids: HashMap::new(),
            state,
        }
    }

    /// Run the accept loop until accept fails or a stop is sent on `stop`.
    ///
    /// Dropping the sender without sending detaches the shard: it keeps
    /// accepting for as long as the process lives.
    ///
    /// Must run inside a `LocalSet`: connection tasks are spawned locally so
    /// they never leave this shard. Once the loop ends the listener is
    /// dropped and the connections already accepted are served to completion.
    pub async fn serve<A: Acceptor>(
        mut self,
        mut acceptor: A,
        stop: oneshot::Receiver<()>,
    ) -> Result<(), ServerError> {
        let stop = async move {
            if stop.await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        tokio::pin!(stop);

        let result = loop {
            tokio::select! {
                accepted = acceptor.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer),
                    Err(source) => {
                        error!(
                            shard = self.id,
                            live = self.registry.len(),
                            error = %source,
                            "Accept failed, shard no longer accepts connections"
                        );
                        if self.on_accept_error == AcceptErrorPolicy::Abort {
                            std::process::abort();
                        }
                        break Err(ServerError::Accept { shard: self.id, source });
                    }
                },
                Some(joined) = self.tasks.join_next_with_id() => self.reap(joined),
                _ = &mut stop => {
                    info!(shard = self.id, live = self.registry.len(), "Shard stopping");
                    break Ok(());
                }
            }
        };

        // Close the listener before publishing the terminal state.
        drop(acceptor);
        self.state.send_replace(if result.is_ok() {
            ShardState::Stopped
        } else {
            ShardState::Failed
        });

        self.drain().await;
        result
    }

    fn spawn_connection<S>(&mut self, stream: S, peer: SocketAddr)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + 'static,
    {
        let conn_id = self.registry.insert(peer);
        debug!(shard = self.id, conn_id, peer = %peer, "Accepted connection");
        let handle = self
            .tasks
            .spawn_local(Connection::new(conn_id, stream, peer).run());
        self.task_ids.insert(handle.id(), conn_id);
    }

    fn reap(&mut self, joined: Result<(task::Id, ConnectionReport), JoinError>) {
        let task_id = match &joined {
            Ok((id, _)) => *id,
            Err(e) => e.id(),
        };
        if let Some(conn_id) = self.task_ids.remove(&task_id) {
            self.registry.remove(conn_id);
        }

        match joined {
            Ok((_, report)) => {
                match report.result {
                    Ok(()) => debug!(
                        shard = self.id,
                        conn_id = report.conn_id,
                        peer = %report.peer,
                        bytes = report.bytes_echoed,
                        "Connection closed by peer"
                    ),
                    Err(e) => debug!(
                        shard = self.id,
                        conn_id = report.conn_id,
                        peer = %report.peer,
                        bytes = report.bytes_echoed,
                        error = %e.source,
                        "Connection error"
                    ),
                }
            }
            Err(e) => warn!(
                shard = self.id,
                live = self.registry.len(),
                error = %e,
                "Connection task failed"
            ),
        }
    }

    /// Wait for every tracked connection task to finish.
    async fn drain(&mut self) {
        if !self.registry.is_empty() {
            debug!(shard = self.id, live = self.registry.len(), "Draining connections");
        }
        while let Some(joined) = self.tasks.join_next_with_id().await {
            self.reap(joined);
        }
    }
}

/// Coordinator-side handle to a running shard thread.
pub struct ShardHandle {
    id: usize,
    state: watch::Receiver<ShardState>,
    ready: Option<mpsc::Receiver<u16>>,
    port: Option<u16>,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<thread::JoinHandle<Result<(), ServerError>>>,
}

impl ShardHandle {
    /// Spawn the shard thread. `make_acceptor` runs on that thread, inside
    /// its runtime, and opens the shard's listener on `port`.
    pub fn spawn<A, F>(
        id: usize,
        port: u16,
        options: ShardOptions,
        make_acceptor: F,
    ) -> Result<Self, ServerError>
    where
        A: Acceptor + 'static,
        F: FnOnce(u16) -> io::Result<A> + Send + 'static,
    {
        let (state_tx, state_rx) = watch::channel(ShardState::Starting);
        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = oneshot::channel();

        let thread = thread::Builder::new()
            .name(format!("shard-{id}"))
            .spawn(move || {
                run_shard(id, port, options, make_acceptor, state_tx, ready_tx, stop_rx)
            })
            .map_err(|source| ServerError::ShardSpawn { shard: id, source })?;

        Ok(Self {
            id,
            state: state_rx,
            ready: Some(ready_rx),
            port: None,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> ShardState {
        *self.state.borrow()
    }

    /// Block until the shard is listening and return the bound port.
    ///
    /// If the shard exits before that, its thread is joined and its error
    /// returned.
    pub fn wait_ready(&mut self) -> Result<u16, ServerError> {
        if let Some(port) = self.port {
            return Ok(port);
        }
        let ready = self
            .ready
            .take()
            .ok_or(ServerError::ShardExited { shard: self.id })?;

        match ready.recv() {
            Ok(port) => {
                self.port = Some(port);
                Ok(port)
            }
            Err(_) => match self.join() {
                Err(e) => Err(e),
                Ok(()) => Err(ServerError::ShardExited { shard: self.id }),
            },
        }
    }

    /// Ask the shard to close its listener and drain. Idempotent.
    pub fn signal_stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }

    /// Wait for the shard thread to exit.
    pub fn join(&mut self) -> Result<(), ServerError> {
        match self.thread.take() {
            Some(handle) => handle
                .join()
                .unwrap_or(Err(ServerError::ShardExited { shard: self.id })),
            None => Ok(()),
        }
    }
}

/// Body of a shard thread.
fn run_shard<A, F>(
    id: usize,
    port: u16,
    options: ShardOptions,
    make_acceptor: F,
    state: watch::Sender<ShardState>,
    ready: mpsc::Sender<u16>,
    stop: oneshot::Receiver<()>,
) -> Result<(), ServerError>
where
    A: Acceptor,
    F: FnOnce(u16) -> io::Result<A>,
{
    if options.pin {
        match affinity::pin_current_thread(id) {
            Ok(cpu) => debug!(shard = id, cpu, "Pinned shard thread"),
            Err(e) => warn!(shard = id, error = %e, "Failed to pin shard thread"),
        }
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|source| ServerError::ShardSpawn { shard: id, source })?;
    let local = LocalSet::new();

    local.block_on(&runtime, async move {
        let acceptor = match make_acceptor(port) {
            Ok(acceptor) => acceptor,
            Err(source) => {
                error!(shard = id, port, error = %source, "Failed to bind");
                state.send_replace(ShardState::Failed);
                return Err(ServerError::Bind { shard: id, port, source });
            }
        };
        let bound = match acceptor.local_port() {
            Ok(bound) => bound,
            Err(source) => {
                state.send_replace(ShardState::Failed);
                return Err(ServerError::Bind { shard: id, port, source });
            }
        };

        state.send_replace(ShardState::Listening { port: bound });
        info!(shard = id, port = bound, "Shard listening");
        let _ = ready.send(bound);

        ShardServer::new(id, options, state).serve(acceptor, stop).await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::listener;
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream};
    use std::pin::Pin;
    use std::process::{Command, Stdio};
    use std::task::{Context, Poll};
    use std::time::{Duration, Instant};
    use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
    use tokio::net::TcpListener;

    /// Set in the child process that runs `test_abort_policy_child`.
    const ABORT_CHILD_ENV: &str = "SHARD_ECHO_ABORT_CHILD";

    /// Accepts `remaining` real connections, then fails.
    struct FlakyAcceptor {
        inner: TcpListener,
        remaining: usize,
    }

    impl Acceptor for FlakyAcceptor {
        type Stream = tokio::net::TcpStream;

        async fn accept(&mut self) -> io::Result<(Self::Stream, SocketAddr)> {
            if self.remaining == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "injected accept failure"));
            }
            self.remaining -= 1;
            self.inner.accept().await
        }

        fn local_port(&self) -> io::Result<u16> {
            Ok(self.inner.local_addr()?.port())
        }
    }

    /// Stream whose first read panics.
    struct PanickingStream;

    impl AsyncRead for PanickingStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            panic!("stream exploded");
        }
    }

    impl AsyncWrite for PanickingStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn echo_roundtrip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
        stream.write_all(payload).unwrap();
        let mut buf = vec![0u8; payload.len()];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    fn wait_for_state(handle: &ShardHandle, expected: ShardState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.state() != expected {
            assert!(Instant::now() < deadline, "shard never reached {expected:?}");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_shard_echoes_and_stops() {
        let mut shard = ShardHandle::spawn(0, 0, ShardOptions::default(), listener::bind).unwrap();
        let port = shard.wait_ready().unwrap();
        assert_eq!(shard.state(), ShardState::Listening { port });

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        assert_eq!(echo_roundtrip(&mut client, b"ping"), b"ping");
        client.shutdown(Shutdown::Write).unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());

        shard.signal_stop();
        shard.join().unwrap();
        assert_eq!(shard.state(), ShardState::Stopped);
    }

    #[test]
    fn test_bind_failure_is_reported() {
        let taken = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut shard = ShardHandle::spawn(3, port, ShardOptions::default(), listener::bind).unwrap();
        match shard.wait_ready() {
            Err(ServerError::Bind { shard: 3, port: p, .. }) => assert_eq!(p, port),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(shard.state(), ShardState::Failed);
    }

    #[test]
    fn test_accept_failure_keeps_live_connections() {
        let make = |port: u16| -> io::Result<FlakyAcceptor> {
            Ok(FlakyAcceptor {
                inner: listener::bind(port)?,
                remaining: 1,
            })
        };
        let mut shard = ShardHandle::spawn(1, 0, ShardOptions::default(), make).unwrap();
        let port = shard.wait_ready().unwrap();

        // The first connection is accepted, then the next accept fails.
        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        wait_for_state(&shard, ShardState::Failed);

        // The connection accepted before the failure is still served.
        assert_eq!(echo_roundtrip(&mut client, b"still here"), b"still here");
        client.shutdown(Shutdown::Write).unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();

        match shard.join() {
            Err(ServerError::Accept { shard: 1, .. }) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_failed_shard_does_not_affect_sibling() {
        let failing = |port: u16| -> io::Result<FlakyAcceptor> {
            Ok(FlakyAcceptor {
                inner: listener::bind(port)?,
                remaining: 0,
            })
        };
        let mut broken = ShardHandle::spawn(0, 0, ShardOptions::default(), failing).unwrap();
        let mut healthy =
            ShardHandle::spawn(1, 0, ShardOptions::default(), listener::bind).unwrap();

        broken.wait_ready().unwrap();
        let port = healthy.wait_ready().unwrap();
        wait_for_state(&broken, ShardState::Failed);

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        assert_eq!(echo_roundtrip(&mut client, b"hello"), b"hello");
        assert!(matches!(healthy.state(), ShardState::Listening { .. }));

        drop(client);
        healthy.signal_stop();
        healthy.join().unwrap();
        assert!(broken.join().is_err());
    }

    #[test]
    fn test_stop_drains_in_flight_connection() {
        let mut shard = ShardHandle::spawn(2, 0, ShardOptions::default(), listener::bind).unwrap();
        let port = shard.wait_ready().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        assert_eq!(echo_roundtrip(&mut client, b"one"), b"one");

        shard.signal_stop();
        wait_for_state(&shard, ShardState::Stopped);

        // Listener is gone but the accepted connection keeps echoing.
        assert!(TcpStream::connect(("127.0.0.1", port)).is_err());
        assert_eq!(echo_roundtrip(&mut client, b"two"), b"two");

        client.shutdown(Shutdown::Write).unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).unwrap();
        shard.join().unwrap();
    }

    #[test]
    fn test_dropped_handle_detaches_shard() {
        let mut shard = ShardHandle::spawn(4, 0, ShardOptions::default(), listener::bind).unwrap();
        let port = shard.wait_ready().unwrap();
        drop(shard);

        // Give a wrongly stopping shard time to close its listener.
        thread::sleep(Duration::from_millis(50));
        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        assert_eq!(echo_roundtrip(&mut client, b"detached"), b"detached");
    }

    #[tokio::test]
    async fn test_panicked_task_releases_registry_slot() {
        let (state, _state_rx) = watch::channel(ShardState::Starting);
        let mut server = ShardServer::new(5, ShardOptions::default(), state);

        LocalSet::new()
            .run_until(async {
                let mock = tokio_test::io::Builder::new().read(b"ok").write(b"ok").build();
                server.spawn_connection(mock, "127.0.0.1:40001".parse().unwrap());
                server.spawn_connection(PanickingStream, "127.0.0.1:40002".parse().unwrap());
                assert_eq!(server.registry.len(), 2);

                server.drain().await;
            })
            .await;

        assert!(server.registry.is_empty());
        assert!(server.task_ids.is_empty());
    }

    #[test]
    fn test_abort_policy_aborts_process() {
        let exe = std::env::current_exe().unwrap();
        let status = Command::new(exe)
            .args([
                "--exact",
                "runtime::shard::tests::test_abort_policy_child",
                "--ignored",
                "--test-threads=1",
            ])
            .env(ABORT_CHILD_ENV, "1")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .unwrap();

        assert!(!status.success());
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            assert_eq!(status.signal(), Some(libc::SIGABRT));
        }
    }

    /// Runs only inside the child spawned by `test_abort_policy_aborts_process`.
    #[test]
    #[ignore = "spawned as a child process"]
    fn test_abort_policy_child() {
        if std::env::var_os(ABORT_CHILD_ENV).is_none() {
            return;
        }
        let options = ShardOptions {
            on_accept_error: AcceptErrorPolicy::Abort,
            pin: false,
        };
        let failing = |port: u16| -> io::Result<FlakyAcceptor> {
            Ok(FlakyAcceptor {
                inner: listener::bind(port)?,
                remaining: 0,
            })
        };
        let mut shard = ShardHandle::spawn(0, 0, options, failing).unwrap();
        // Only reached if the failed accept did not abort.
        let _ = shard.join();
    }
}
