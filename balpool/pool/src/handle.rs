use crate::{
    connset::ConnectionSet,
    dial::{Liveness, Target},
    error::{ConnClosed, NoServiceNodes},
    node::{ServiceNode, ANY_PORT},
    service::ServiceHolder,
};
use balpool_balance::{Iter, Status};
use balpool_error::Error;
use std::{
    fmt, io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

/// A connection checked out of a [`Pool`](crate::Pool).
///
/// The handle walks the service's nodes, and each node's ports, until it
/// either reuses an idle connection or dials a new one. It keeps its place
/// in that walk, so [`ConnectionHandle::next`] moves on to the next
/// candidate after the caller observes a failure.
///
/// A handle must be finished with [`ConnectionHandle::put`], which returns
/// the connection for reuse, or [`ConnectionHandle::close`], which discards
/// it. Dropping a handle closes it.
pub struct ConnectionHandle<C> {
    holder: Arc<ServiceHolder<C>>,
    iter: Iter<Arc<ServiceNode<C>>>,
    seed: Option<Vec<u8>>,

    /// The requested port key, for errors.
    port_key: String,
    /// Port keys to try on each node, in order.
    port_keys: Vec<String>,
    cursor: usize,

    node: Option<Arc<ServiceNode<C>>>,
    connset: Option<Arc<ConnectionSet<C>>>,
    conn: Option<C>,
    last_error: Option<io::Error>,
    closed: bool,
}

impl<C> ConnectionHandle<C> {
    pub(crate) fn new(
        holder: Arc<ServiceHolder<C>>,
        port_key: &str,
        mut port_keys: Vec<String>,
        seed: Option<Vec<u8>>,
    ) -> Self {
        if !port_keys.iter().any(|k| k == ANY_PORT) {
            port_keys.push(ANY_PORT.to_string());
        }
        let iter = holder.current().iter(seed.as_deref());
        Self {
            holder,
            iter,
            seed,
            port_key: port_key.to_string(),
            port_keys,
            cursor: 0,
            node: None,
            connset: None,
            conn: None,
            last_error: None,
            closed: false,
        }
    }

    pub fn service(&self) -> &str {
        self.holder.name()
    }

    /// The connection, unless the handle is closed.
    pub fn conn(&self) -> Option<&C> {
        self.conn.as_ref()
    }

    pub fn conn_mut(&mut self) -> Option<&mut C> {
        self.conn.as_mut()
    }

    /// The key of the node the handle is attached to.
    pub fn node_key(&self) -> Option<&str> {
        self.node.as_ref().map(|n| n.key())
    }

    /// The port key of the connection set the handle is attached to.
    pub fn port_key(&self) -> Option<&str> {
        self.connset.as_ref().map(|s| s.key().port_key.as_str())
    }

    /// The network and address of the attached connection.
    pub fn peer(&self) -> Option<Target> {
        let key = self.connset.as_ref()?.key();
        Some(Target::new(key.network.clone(), key.address.clone()))
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns the connection to the pool for reuse and releases the handle.
    ///
    /// Does nothing if the handle is already closed.
    pub fn put(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let (Some(conn), Some(set)) = (self.conn.take(), self.connset.as_ref()) {
            trace!(service = %self.holder.name(), key = %set.key(), "Returning connection");
            if set.push(conn).is_err() {
                trace!("Connection set drained; dropping connection");
            }
            self.iter.close();
        }
        self.detach();
    }

    /// Discards the connection and releases the handle.
    ///
    /// Does nothing if the handle is already closed.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.conn.take().is_some() {
            self.iter.close();
        }
        self.detach();
    }

    fn release_connset(&mut self) {
        if let Some(set) = self.connset.take() {
            set.release();
        }
    }

    fn release_node(&mut self) {
        if let Some(node) = self.node.take() {
            node.release();
        }
    }

    fn detach(&mut self) {
        self.release_connset();
        self.release_node();
    }

    /// Picks and retains the next connection set to try.
    ///
    /// Must be called with the service's current snapshot locked so that a
    /// node is never retained after its snapshot has been released.
    fn select(&mut self, mut status: Status) -> Option<Arc<ConnectionSet<C>>> {
        loop {
            if let Some(node) = self.node.as_ref() {
                while let Some(key) = self.port_keys.get(self.cursor) {
                    self.cursor += 1;
                    if let Some(set) = node.connset(key) {
                        set.retain();
                        self.connset = Some(set.clone());
                        return Some(set.clone());
                    }
                }
                self.release_node();
            }

            let node = self.iter.next(status)?.clone();
            status = Status::Start;
            trace!(node = %node.key(), "Trying node");
            node.retain();
            self.node = Some(node);
            self.cursor = 0;
        }
    }
}

impl<C: Liveness + Send + 'static> ConnectionHandle<C> {
    /// Discards the current connection and moves on to the next candidate,
    /// reporting `status` for the current node.
    pub async fn next(&mut self, status: Status) -> Result<(), Error> {
        if self.closed {
            return Err(ConnClosed::new().into());
        }
        self.conn = None;
        self.release_connset();
        self.get(status).await?;
        Ok(())
    }

    pub(crate) async fn get(&mut self, mut status: Status) -> Result<(), NoServiceNodes> {
        let holder = self.holder.clone();
        loop {
            let connset = {
                let current = holder.lock_current();
                if !Arc::ptr_eq(self.iter.balancer(), &*current) {
                    debug!(service = %holder.name(), "Service reconfigured; restarting");
                    self.detach();
                    self.iter = current.iter(self.seed.as_deref());
                    self.cursor = 0;
                    status = Status::Start;
                }
                match self.select(status) {
                    Some(set) => set,
                    None => {
                        drop(current);
                        debug!(service = %holder.name(), port = %self.port_key, "No nodes left");
                        return Err(NoServiceNodes::new(
                            holder.name(),
                            self.port_key.clone(),
                            self.last_error.take(),
                        ));
                    }
                }
            };

            while let Some(conn) = connset.pop() {
                if conn.is_closed() {
                    trace!(key = %connset.key(), "Discarding closed idle connection");
                    continue;
                }
                trace!(key = %connset.key(), "Reusing idle connection");
                self.conn = Some(conn);
                return Ok(());
            }

            let key = connset.key();
            let target = Target::new(key.network.clone(), key.address.clone());
            let (dial, timeout) = holder.dial();
            let error = match tokio::time::timeout(timeout, dial.dial(&target)).await {
                Ok(Ok(conn)) => {
                    trace!(%target, "Connected");
                    self.conn = Some(conn);
                    return Ok(());
                }
                Ok(Err(error)) => error,
                Err(_) => io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", timeout),
                ),
            };
            debug!(service = %holder.name(), %target, %error, "Failed to connect");
            self.last_error = Some(error);
            self.release_connset();
            status = Status::Fail;
        }
    }
}

impl<C> Drop for ConnectionHandle<C> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<C> fmt::Debug for ConnectionHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("service", &self.holder.name())
            .field("port_key", &self.port_key)
            .field("node", &self.node_key())
            .field("peer", &self.peer())
            .field("closed", &self.closed)
            .finish()
    }
}

fn closed() -> io::Error {
    ConnClosed::new().into()
}

impl<C: AsyncRead + Unpin> AsyncRead for ConnectionHandle<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().conn.as_mut() {
            Some(conn) => Pin::new(conn).poll_read(cx, buf),
            None => Poll::Ready(Err(closed())),
        }
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for ConnectionHandle<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().conn.as_mut() {
            Some(conn) => Pin::new(conn).poll_write(cx, buf),
            None => Poll::Ready(Err(closed())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().conn.as_mut() {
            Some(conn) => Pin::new(conn).poll_flush(cx),
            None => Poll::Ready(Err(closed())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().conn.as_mut() {
            Some(conn) => Pin::new(conn).poll_shutdown(cx),
            None => Poll::Ready(Err(closed())),
        }
    }
}
