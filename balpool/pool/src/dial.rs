use crate::error::UnsupportedNetwork;
use pin_project::pin_project;
use std::{
    fmt,
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpStream, UnixStream},
};
use tracing::{debug, warn};

pub type DialFuture<C> = Pin<Box<dyn Future<Output = io::Result<C>> + Send + 'static>>;

/// An endpoint to connect to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Target {
    pub network: String,
    pub address: String,
}

/// Establishes new connections for a service.
pub trait Dial<C>: Send + Sync + 'static {
    fn dial(&self, target: &Target) -> DialFuture<C>;
}

/// Reports whether an idle connection was closed by its peer.
///
/// Checked before an idle connection is handed out again. Implementations
/// must not block.
pub trait Liveness {
    fn is_closed(&self) -> bool;
}

/// Adapts a closure into a [`Dial`].
#[derive(Clone)]
pub struct DialFn<F>(F);

/// The default dialer, for `tcp`, `tcp4`, `tcp6`, and `unix` networks.
#[derive(Copy, Clone, Debug, Default)]
pub struct ConnectTcpOrUnix(());

/// A connection established by [`ConnectTcpOrUnix`].
#[pin_project(project = IoProj)]
#[derive(Debug)]
pub enum Io {
    Tcp(#[pin] TcpStream),
    Unix(#[pin] UnixStream),
}

pub fn dial_fn<C, F, Fut>(f: F) -> DialFn<F>
where
    F: Fn(Target) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<C>> + Send + 'static,
{
    DialFn(f)
}

// === impl Target ===

impl Target {
    pub fn new(network: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.address)
    }
}

// === impl DialFn ===

impl<C, F, Fut> Dial<C> for DialFn<F>
where
    F: Fn(Target) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<C>> + Send + 'static,
{
    fn dial(&self, target: &Target) -> DialFuture<C> {
        Box::pin((self.0)(target.clone()))
    }
}

impl<F> fmt::Debug for DialFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DialFn").finish()
    }
}

// === impl ConnectTcpOrUnix ===

impl ConnectTcpOrUnix {
    pub async fn connect(target: Target) -> io::Result<Io> {
        match target.network.as_str() {
            "tcp" | "tcp4" | "tcp6" => {
                debug!(server.addr = %target.address, "Connecting");
                let io = TcpStream::connect(target.address.as_str()).await?;
                if let Err(e) = io.set_nodelay(true) {
                    warn!("failed to set nodelay: {}", e);
                }
                debug!(local.addr = ?io.local_addr().ok(), "Connected");
                Ok(Io::Tcp(io))
            }
            "unix" => {
                debug!(server.path = %target.address, "Connecting");
                let io = UnixStream::connect(&target.address).await?;
                Ok(Io::Unix(io))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                UnsupportedNetwork(target.network),
            )),
        }
    }
}

impl Dial<Io> for ConnectTcpOrUnix {
    fn dial(&self, target: &Target) -> DialFuture<Io> {
        Box::pin(Self::connect(target.clone()))
    }
}

// === impl Io ===

impl Io {
    /// The remote TCP address, if this is a TCP connection.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(io) => io.peer_addr().ok(),
            Self::Unix(_) => None,
        }
    }
}

impl Liveness for Io {
    fn is_closed(&self) -> bool {
        let mut buf = [0u8; 1];
        let res = match self {
            Self::Tcp(io) => io.try_read(&mut buf),
            Self::Unix(io) => io.try_read(&mut buf),
        };
        match res {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            // EOF, an error, or bytes nobody asked for: the connection can't
            // be reused.
            Ok(_) | Err(_) => true,
        }
    }
}

impl AsyncRead for Io {
    #[inline]
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            IoProj::Tcp(io) => io.poll_read(cx, buf),
            IoProj::Unix(io) => io.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Io {
    #[inline]
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            IoProj::Tcp(io) => io.poll_write(cx, buf),
            IoProj::Unix(io) => io.poll_write(cx, buf),
        }
    }

    #[inline]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            IoProj::Tcp(io) => io.poll_flush(cx),
            IoProj::Unix(io) => io.poll_flush(cx),
        }
    }

    #[inline]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            IoProj::Tcp(io) => io.poll_shutdown(cx),
            IoProj::Unix(io) => io.poll_shutdown(cx),
        }
    }

    #[inline]
    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            IoProj::Tcp(io) => io.poll_write_vectored(cx, bufs),
            IoProj::Unix(io) => io.poll_write_vectored(cx, bufs),
        }
    }

    #[inline]
    fn is_write_vectored(&self) -> bool {
        match self {
            Self::Tcp(io) => io.is_write_vectored(),
            Self::Unix(io) => io.is_write_vectored(),
        }
    }
}
