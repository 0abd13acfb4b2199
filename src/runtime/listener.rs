//! Listening socket setup and the accept seam used by shards.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// Listen backlog passed to `listen(2)`.
const BACKLOG: i32 = 1024;

/// Source of accepted connections for a shard's accept loop.
#[allow(async_fn_in_trait)]
pub trait Acceptor {
    type Stream: AsyncRead + AsyncWrite + Unpin + 'static;

    /// Wait for the next connection.
    async fn accept(&mut self) -> io::Result<(Self::Stream, SocketAddr)>;

    /// Port the listener is bound to.
    fn local_port(&self) -> io::Result<u16>;
}

impl Acceptor for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_port(&self) -> io::Result<u16> {
        Ok(self.local_addr()?.port())
    }
}

/// Bind an IPv4 listener on all interfaces for one shard.
///
/// Must be called from within a tokio runtime.
pub fn bind(port: u16) -> io::Result<TcpListener> {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    TcpListener::from_std(create_listener_with_reuseport(addr)?)
}

/// Fail if `port` is already held by another process.
///
/// Shard listeners use SO_REUSEPORT, so they would silently share a port
/// with any other SO_REUSEPORT listener, including another copy of this
/// server. A socket without SO_REUSEPORT cannot join such a group, so
/// binding one briefly tells whether the port is free.
pub fn ensure_port_free(port: u16) -> io::Result<()> {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    Ok(())
}

/// Create a TCP listener with SO_REUSEPORT for kernel load balancing.
///
/// Every shard binds the same port; the kernel spreads new connections
/// across the shard sockets.
fn create_listener_with_reuseport(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}
