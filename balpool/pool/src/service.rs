use crate::{dial::Dial, node::ServiceNode};
use balpool_balance::{Balancer, Settings};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::{fmt, sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle};
use tracing::debug;

/// An immutable snapshot of a service's nodes.
pub(crate) type Service<C> = Balancer<Arc<ServiceNode<C>>>;

/// The registry entry for a named service.
///
/// Holds the current [`Service`] snapshot. Reconfiguration builds a new
/// snapshot and swaps it in; handles notice the swap by comparing the
/// snapshot they iterate against the current one.
pub(crate) struct ServiceHolder<C> {
    name: String,
    current: Mutex<Arc<Service<C>>>,
    params: RwLock<Params<C>>,
    watch: Mutex<Option<Watch>>,
}

/// How a service's nodes are built and dialed.
pub(crate) struct Params<C> {
    pub dial: Arc<dyn Dial<C>>,
    pub connect_timeout: Duration,
    pub net_network: String,
    pub unix_network: String,
    pub settings: Settings,
}

/// A running discovery task.
pub(crate) struct Watch {
    pub task: JoinHandle<()>,
    /// Becomes `true` once the first batch has been applied.
    pub ready: watch::Receiver<bool>,
}

/// Releases the snapshot's reference on each of its nodes.
pub(crate) fn release_nodes<C>(service: &Service<C>) {
    for node in service.nodes() {
        node.value().release();
    }
}

// === impl ServiceHolder ===

impl<C> ServiceHolder<C> {
    pub(crate) fn new(name: String, params: Params<C>) -> Self {
        let empty = Arc::new(Service::new(Vec::new(), params.settings));
        Self {
            name,
            current: Mutex::new(empty),
            params: RwLock::new(params),
            watch: Mutex::new(None),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn current(&self) -> Arc<Service<C>> {
        self.current.lock().clone()
    }

    /// Locks the current snapshot. Must not be held across an `await`.
    pub(crate) fn lock_current(&self) -> MutexGuard<'_, Arc<Service<C>>> {
        self.current.lock()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.current.lock().is_empty()
    }

    pub(crate) fn params(&self) -> Params<C> {
        self.params.read().clone()
    }

    pub(crate) fn set_params(&self, params: Params<C>) {
        *self.params.write() = params;
    }

    pub(crate) fn dial(&self) -> (Arc<dyn Dial<C>>, Duration) {
        let params = self.params.read();
        (params.dial.clone(), params.connect_timeout)
    }

    pub(crate) fn set_dial(&self, dial: Arc<dyn Dial<C>>) {
        self.params.write().dial = dial;
    }

    /// Publishes `service` and releases the snapshot it replaces.
    pub(crate) fn swap(&self, service: Arc<Service<C>>) {
        let nodes = service.len();
        let old = std::mem::replace(&mut *self.current.lock(), service);
        debug!(service = %self.name, nodes, replaced = old.len(), "Published nodes");
        release_nodes(&old);
    }

    pub(crate) fn set_watch(&self, watch: Watch) {
        if let Some(old) = self.watch.lock().replace(watch) {
            old.task.abort();
        }
    }

    pub(crate) fn ready(&self) -> Option<watch::Receiver<bool>> {
        self.watch.lock().as_ref().map(|w| w.ready.clone())
    }

    pub(crate) fn abort_watch(&self) {
        if let Some(watch) = self.watch.lock().take() {
            debug!(service = %self.name, "Stopping discovery");
            watch.task.abort();
        }
    }
}

impl<C> Drop for ServiceHolder<C> {
    fn drop(&mut self) {
        release_nodes(self.current.get_mut());
    }
}

impl<C> fmt::Debug for ServiceHolder<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHolder")
            .field("name", &self.name)
            .field("nodes", &self.current.lock().len())
            .finish()
    }
}

// === impl Params ===

impl<C> Clone for Params<C> {
    fn clone(&self) -> Self {
        Self {
            dial: self.dial.clone(),
            connect_timeout: self.connect_timeout,
            net_network: self.net_network.clone(),
            unix_network: self.unix_network.clone(),
            settings: self.settings,
        }
    }
}
