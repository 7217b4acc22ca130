use crate::connset::ConnectionSet;
use ahash::AHashMap;
use std::{
    fmt,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};
use tracing::trace;

/// Port key matching any requested port. Used by single-address services.
pub const ANY_PORT: &str = "*";

/// One node of a service: its connection sets keyed by port key.
///
/// Nodes are rebuilt on every reconfiguration. Nodes of different
/// generations may share a key and share connection sets, so connections
/// survive a reconfiguration that keeps an endpoint.
pub struct ServiceNode<C> {
    key: String,
    connsets: AHashMap<String, Arc<ConnectionSet<C>>>,
    refs: AtomicI64,
}

impl<C> ServiceNode<C> {
    pub(crate) fn new(key: String, connsets: AHashMap<String, Arc<ConnectionSet<C>>>) -> Self {
        Self {
            key,
            connsets,
            refs: AtomicI64::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn refs(&self) -> i64 {
        self.refs.load(Ordering::Acquire)
    }

    pub fn connsets(&self) -> impl Iterator<Item = (&str, &Arc<ConnectionSet<C>>)> + '_ {
        self.connsets.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn connset(&self, port_key: &str) -> Option<&Arc<ConnectionSet<C>>> {
        self.connsets.get(port_key)
    }

    /// Takes a reference. The first reference retains every connection set.
    pub(crate) fn retain(&self) {
        if self.refs.fetch_add(1, Ordering::AcqRel) == 0 {
            trace!(node = %self.key, "Node in use");
            for set in self.connsets.values() {
                set.retain();
            }
        }
    }

    /// Drops a reference. The last reference releases every connection set.
    ///
    /// # Panics
    ///
    /// If the node has no outstanding references.
    pub(crate) fn release(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(
            prev > 0,
            "service node {} released more often than retained",
            self.key
        );
        if prev == 1 {
            trace!(node = %self.key, "Node unused");
            for set in self.connsets.values() {
                set.release();
            }
        }
    }
}

impl<C> fmt::Debug for ServiceNode<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceNode")
            .field("key", &self.key)
            .field("ports", &self.connsets.keys().collect::<Vec<_>>())
            .field("refs", &self.refs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connset::ConnSetKey;

    fn node() -> (ServiceNode<()>, Arc<ConnectionSet<()>>, Arc<ConnectionSet<()>>) {
        let a = Arc::new(ConnectionSet::new(ConnSetKey::new("port", "tcp", "a:1")));
        let b = Arc::new(ConnectionSet::new(ConnSetKey::new(ANY_PORT, "tcp", "a:2")));
        let mut sets = AHashMap::new();
        sets.insert("port".to_string(), a.clone());
        sets.insert(ANY_PORT.to_string(), b.clone());
        (ServiceNode::new("1".into(), sets), a, b)
    }

    #[test]
    fn retains_connsets_once() {
        let (node, a, b) = node();
        node.retain();
        node.retain();
        assert_eq!(node.refs(), 2);
        assert_eq!(a.refs(), 1);
        assert_eq!(b.refs(), 1);

        node.release();
        assert_eq!(a.refs(), 1);
        node.release();
        assert_eq!(node.refs(), 0);
        assert_eq!(a.refs(), 0);
        assert_eq!(b.refs(), 0);
    }

    #[test]
    fn port_lookup() {
        let (node, a, b) = node();
        assert!(Arc::ptr_eq(node.connset("port").unwrap(), &a));
        assert!(Arc::ptr_eq(node.connset(ANY_PORT).unwrap(), &b));
        assert!(node.connset("http_port").is_none());
    }

    #[test]
    #[should_panic(expected = "released more often than retained")]
    fn over_release_panics() {
        let (node, _, _) = node();
        node.release();
    }
}
