use parking_lot::Mutex;
use std::{collections::VecDeque, fmt};
use tracing::trace;

/// Identifies a shared [`ConnectionSet`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnSetKey {
    pub port_key: String,
    pub network: String,
    pub address: String,
}

/// The idle connections for one endpoint, shared by every node that refers
/// to it.
///
/// A set is retained once per node (or handle) that references it. When the
/// last reference is released the idle queue is drained, but the set itself
/// stays registered with the pool so that a later configuration naming the
/// same endpoint picks it up again.
pub struct ConnectionSet<C> {
    key: ConnSetKey,
    inner: Mutex<Inner<C>>,
}

struct Inner<C> {
    idle: VecDeque<C>,
    refs: i64,
}

// === impl ConnSetKey ===

impl ConnSetKey {
    pub fn new(
        port_key: impl Into<String>,
        network: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            port_key: port_key.into(),
            network: network.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for ConnSetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}:{}", self.port_key, self.network, self.address)
    }
}

// === impl ConnectionSet ===

impl<C> ConnectionSet<C> {
    pub(crate) fn new(key: ConnSetKey) -> Self {
        Self {
            key,
            inner: Mutex::new(Inner {
                idle: VecDeque::new(),
                refs: 0,
            }),
        }
    }

    pub fn key(&self) -> &ConnSetKey {
        &self.key
    }

    pub fn refs(&self) -> i64 {
        self.inner.lock().refs
    }

    pub fn idle_len(&self) -> usize {
        self.inner.lock().idle.len()
    }

    pub(crate) fn retain(&self) {
        let mut inner = self.inner.lock();
        inner.refs += 1;
        if inner.refs == 1 {
            trace!(key = %self.key, "Connection set in use");
        }
    }

    /// Drops one reference, closing every idle connection if it was the last.
    ///
    /// # Panics
    ///
    /// If the set has no outstanding references.
    pub(crate) fn release(&self) {
        let drained = {
            let mut inner = self.inner.lock();
            assert!(
                inner.refs > 0,
                "connection set {} released more often than retained",
                self.key
            );
            inner.refs -= 1;
            if inner.refs > 0 {
                return;
            }
            std::mem::take(&mut inner.idle)
        };
        if !drained.is_empty() {
            trace!(key = %self.key, idle = drained.len(), "Closing idle connections");
        }
        drop(drained);
    }

    /// Takes the most recently returned idle connection.
    pub(crate) fn pop(&self) -> Option<C> {
        self.inner.lock().idle.pop_back()
    }

    /// Queues an idle connection for reuse.
    ///
    /// If the set is no longer referenced, the connection is handed back to
    /// the caller instead of being queued.
    pub(crate) fn push(&self, conn: C) -> Result<(), C> {
        let mut inner = self.inner.lock();
        if inner.refs <= 0 {
            return Err(conn);
        }
        inner.idle.push_back(conn);
        Ok(())
    }
}

impl<C> fmt::Debug for ConnectionSet<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ConnectionSet")
            .field("key", &self.key)
            .field("refs", &inner.refs)
            .field("idle", &inner.idle.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    struct Counted(Arc<AtomicUsize>);

    impl Drop for Counted {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn set() -> ConnectionSet<Counted> {
        ConnectionSet::new(ConnSetKey::new("port", "tcp", "10.0.0.1:9"))
    }

    #[test]
    fn last_release_drains() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let set = set();
        set.retain();
        set.retain();
        assert!(set.push(Counted(dropped.clone())).is_ok());
        assert!(set.push(Counted(dropped.clone())).is_ok());
        assert_eq!(set.idle_len(), 2);

        set.release();
        assert_eq!(set.idle_len(), 2);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);

        set.release();
        assert_eq!(set.refs(), 0);
        assert_eq!(set.idle_len(), 0);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);

        // Reusable after being drained.
        set.retain();
        assert!(set.push(Counted(dropped.clone())).is_ok());
        assert!(set.pop().is_some());
        set.release();
    }

    #[test]
    fn push_unreferenced_is_refused() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let set = set();
        assert!(set.push(Counted(dropped)).is_err());
        assert_eq!(set.idle_len(), 0);
    }

    #[test]
    fn pop_is_lifo() {
        let set = ConnectionSet::new(ConnSetKey::new("port", "tcp", "a"));
        set.retain();
        set.push(1).unwrap();
        set.push(2).unwrap();
        assert_eq!(set.pop(), Some(2));
        assert_eq!(set.pop(), Some(1));
        assert_eq!(set.pop(), None);
    }

    #[test]
    #[should_panic(expected = "released more often than retained")]
    fn over_release_panics() {
        let set = set();
        set.retain();
        set.release();
        set.release();
    }
}
