use crate::{
    config::{HostConfig, Hosts, PoolConfig, PortAddr, ServiceConfig},
    connset::{ConnSetKey, ConnectionSet},
    dial::{ConnectTcpOrUnix, Dial, Io, Liveness},
    discovery::{self, Discover},
    error::{EmptyConfig, InvalidHost, NoSuchService, NoUsableHosts},
    handle::ConnectionHandle,
    node::{ServiceNode, ANY_PORT},
    service::{release_nodes, Params, Service, ServiceHolder, Watch},
};
use ahash::AHashMap;
use balpool_balance::{BalanceNode, Status};
use balpool_dns::{Resolve, Resolver};
use balpool_error::Error;
use parking_lot::{Mutex, RwLock};
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::sync::watch;
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// A registry of balanced services sharing one set of pooled connections.
///
/// Cloning a `Pool` is cheap; clones share all state.
pub struct Pool<C> {
    pub(crate) inner: Arc<Inner<C>>,
}

pub struct Builder<C> {
    config: PoolConfig,
    dial: Arc<dyn Dial<C>>,
    resolver: Option<Arc<dyn Resolve>>,
    discovery: Option<Arc<dyn Discover>>,
}

/// One port of one node, as reported by [`Pool::get_node_ports`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodePort {
    pub node_key: String,
    pub network: String,
    pub address: String,
    pub port_key: String,
    pub cost: u64,
    pub effective_cost: u64,
    /// Idle connections currently pooled for this port.
    pub idle: usize,
}

pub(crate) struct Inner<C> {
    config: PoolConfig,
    resolver: Arc<dyn Resolve>,
    default_dial: Arc<dyn Dial<C>>,
    discovery: Option<Arc<dyn Discover>>,
    services: RwLock<AHashMap<String, Arc<ServiceHolder<C>>>>,
    /// Every connection set ever referenced, by endpoint.
    pub(crate) connsets: Mutex<AHashMap<ConnSetKey, Arc<ConnectionSet<C>>>>,
}

// === impl Builder ===

impl<C> Builder<C> {
    pub fn new<D: Dial<C>>(dial: D) -> Self {
        Self {
            config: PoolConfig::default(),
            dial: Arc::new(dial),
            resolver: None,
            discovery: None,
        }
    }

    pub fn with_config(self, config: PoolConfig) -> Self {
        Self { config, ..self }
    }

    pub fn with_resolver<R: Resolve>(self, resolver: R) -> Self {
        Self {
            resolver: Some(Arc::new(resolver)),
            ..self
        }
    }

    pub fn with_discovery<D: Discover>(self, discovery: D) -> Self {
        Self {
            discovery: Some(Arc::new(discovery)),
            ..self
        }
    }

    /// Builds the pool. Without an explicit resolver, the system DNS
    /// configuration is loaded.
    pub fn build(self) -> Result<Pool<C>, Error> {
        let resolver = match self.resolver {
            Some(resolver) => resolver,
            None => Arc::new(Resolver::from_system_config()?),
        };
        Ok(Pool {
            inner: Arc::new(Inner {
                config: self.config,
                resolver,
                default_dial: self.dial,
                discovery: self.discovery,
                services: Default::default(),
                connsets: Default::default(),
            }),
        })
    }
}

// === impl Pool ===

impl Pool<Io> {
    /// A builder for a pool that dials TCP and Unix sockets.
    pub fn builder() -> Builder<Io> {
        Builder::new(ConnectTcpOrUnix::default())
    }
}

impl<C: Liveness + Send + 'static> Pool<C> {
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Registers a service, returning its name.
    ///
    /// Registering a service that already has nodes does nothing; use
    /// [`Pool::update_hosts_config`] to change it. Hosts that fail to
    /// resolve are skipped. If no host produces a node, the service is
    /// still registered but an error is returned.
    pub async fn add_config(&self, config: ServiceConfig) -> Result<String, Error> {
        self.inner.add_config(config, None).await
    }

    /// Like [`Pool::add_config`], but the service dials with `dial`.
    pub async fn add_config_with_dial<D: Dial<C>>(
        &self,
        config: ServiceConfig,
        dial: D,
    ) -> Result<String, Error> {
        self.inner.add_config(config, Some(Arc::new(dial))).await
    }

    /// Registers a service with a single endpoint that serves every port
    /// key.
    pub fn add_single(
        &self,
        service: &str,
        network: &str,
        address: &str,
        retries: u32,
        connect_timeout: Duration,
    ) -> Result<(), Error> {
        if address.is_empty() {
            return Err(EmptyConfig::new().into());
        }
        let inner = &self.inner;
        let mut params = inner.default_params();
        params.connect_timeout = connect_timeout;
        params.settings.retries = retries;

        let key = ConnSetKey::new(ANY_PORT, network, address);
        let mut connsets = AHashMap::new();
        connsets.insert(ANY_PORT.to_string(), inner.connset(key));
        let node = Arc::new(ServiceNode::new(address.to_string(), connsets));
        node.retain();
        let service_nodes = Service::new(vec![BalanceNode::new(node, 1)], params.settings);
        inner.register(service, params, Arc::new(service_nodes));
        Ok(())
    }

    /// Checks a connection out of `service`.
    ///
    /// `port_key` is looked up in the pool's port map. A non-empty
    /// `remote_addr` seeds the hash strategy.
    pub async fn new_conn(
        &self,
        service: &str,
        port_key: &str,
        remote_addr: &str,
    ) -> Result<ConnectionHandle<C>, Error> {
        let holder = match self.inner.holder(service) {
            Some(holder) => holder,
            None => self.inner.discover(service).await?,
        };
        let port_keys = self.inner.config.port_map.lookup(port_key);
        let seed = (!remote_addr.is_empty()).then(|| remote_addr.as_bytes().to_vec());
        let mut handle = ConnectionHandle::new(holder, port_key, port_keys, seed);
        handle.get(Status::Start).await?;
        Ok(handle)
    }

    /// Replaces the hosts of a registered service, returning the number of
    /// nodes now serving it.
    ///
    /// If the new hosts produce no nodes, the current nodes are kept and
    /// zero is returned.
    pub async fn update_hosts_config(&self, service: &str, hosts: Hosts) -> Result<usize, Error> {
        self.inner.update_hosts_config(service, hosts).await
    }

    pub fn set_dial_func<D: Dial<C>>(&self, service: &str, dial: D) -> Result<(), NoSuchService> {
        let holder = self
            .inner
            .holder(service)
            .ok_or_else(|| NoSuchService::new(service))?;
        holder.set_dial(Arc::new(dial));
        Ok(())
    }

    pub fn get_node_ports(&self, service: &str) -> Result<Vec<NodePort>, NoSuchService> {
        let holder = self
            .inner
            .holder(service)
            .ok_or_else(|| NoSuchService::new(service))?;
        let current = holder.current();
        let mut ports = Vec::new();
        for balance_node in current.nodes() {
            let node = balance_node.value();
            let mut sets = node.connsets().collect::<Vec<_>>();
            sets.sort_by(|(a, _), (b, _)| a.cmp(b));
            for (port_key, set) in sets {
                ports.push(NodePort {
                    node_key: node.key().to_string(),
                    network: set.key().network.clone(),
                    address: set.key().address.clone(),
                    port_key: port_key.to_string(),
                    cost: balance_node.cost(),
                    effective_cost: balance_node.effective_cost(),
                    idle: set.idle_len(),
                });
            }
        }
        Ok(ports)
    }

    /// The names of all registered services.
    pub fn services(&self) -> Vec<String> {
        let mut names = self.inner.services.read().keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    /// Unregisters a service and stops its discovery.
    ///
    /// Outstanding handles keep their connections until they are put or
    /// closed, but cannot move to another node.
    pub fn close_service(&self, service: &str) -> bool {
        let Some(holder) = self.inner.services.write().remove(service) else {
            return false;
        };
        holder.abort_watch();
        let params = holder.params();
        holder.swap(Arc::new(Service::new(Vec::new(), params.settings)));
        info!(%service, "Closed service");
        true
    }
}

impl<C> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("services", &self.inner.services.read().len())
            .field("connsets", &self.inner.connsets.lock().len())
            .finish()
    }
}

// === impl Inner ===

impl<C> Inner<C> {
    pub(crate) fn holder(&self, service: &str) -> Option<Arc<ServiceHolder<C>>> {
        self.services.read().get(service).cloned()
    }

    fn default_params(&self) -> Params<C> {
        Params {
            dial: self.default_dial.clone(),
            connect_timeout: self.config.connect_timeout,
            net_network: self.config.net_network.clone(),
            unix_network: self.config.unix_network.clone(),
            settings: self.config.balance,
        }
    }

    fn params(&self, config: &ServiceConfig, dial: Option<Arc<dyn Dial<C>>>) -> Params<C> {
        let defaults = self.default_params();
        let or_default = |network: &str, default: String| {
            if network.is_empty() {
                default
            } else {
                network.to_string()
            }
        };
        Params {
            dial: dial.unwrap_or(defaults.dial),
            connect_timeout: config.connect_timeout.unwrap_or(defaults.connect_timeout),
            net_network: or_default(&config.net_network, defaults.net_network),
            unix_network: or_default(&config.unix_network, defaults.unix_network),
            settings: config.balance_settings(&defaults.settings),
        }
    }

    /// Returns the shared connection set for `key`, creating it if needed.
    fn connset(&self, key: ConnSetKey) -> Arc<ConnectionSet<C>> {
        self.connsets
            .lock()
            .entry(key)
            .or_insert_with_key(|key| Arc::new(ConnectionSet::new(key.clone())))
            .clone()
    }

    /// Publishes `service` under `name` unless a service with nodes is
    /// already registered there.
    fn register(&self, name: &str, params: Params<C>, service: Arc<Service<C>>) {
        let mut services = self.services.write();
        match services.get(name).cloned() {
            Some(holder) if !holder.is_empty() => {
                drop(services);
                debug!(service = %name, "Service already configured");
                release_nodes(&service);
            }
            Some(holder) => {
                holder.set_params(params);
                holder.swap(service);
            }
            None => {
                let holder = Arc::new(ServiceHolder::new(name.to_string(), params));
                holder.swap(service);
                services.insert(name.to_string(), holder);
            }
        }
    }

    async fn add_config(
        &self,
        config: ServiceConfig,
        dial: Option<Arc<dyn Dial<C>>>,
    ) -> Result<String, Error> {
        if config.hosts.is_empty() {
            return Err(EmptyConfig::new().into());
        }
        let name = config.service_name();
        if self.holder(&name).is_some_and(|h| !h.is_empty()) {
            debug!(service = %name, "Service already configured");
            return Ok(name);
        }

        let params = self.params(&config, dial);
        let (service, error) = self.build(&name, &config.hosts, &params).await;
        let nodes = service.len();
        self.register(&name, params, service);
        if nodes == 0 {
            return Err(NoUsableHosts::new(name, error).into());
        }
        info!(service = %name, nodes, "Added service");
        Ok(name)
    }

    pub(crate) async fn update_hosts_config(
        &self,
        service: &str,
        hosts: Hosts,
    ) -> Result<usize, Error> {
        let holder = self
            .holder(service)
            .ok_or_else(|| NoSuchService::new(service))?;
        let params = holder.params();
        let (next, error) = self.build(service, &hosts, &params).await;
        if next.is_empty() {
            match error {
                Some(error) => warn!(%service, %error, "No usable hosts; keeping current nodes"),
                None => warn!(%service, "No usable hosts; keeping current nodes"),
            }
            return Ok(0);
        }
        let nodes = next.len();
        holder.swap(next);
        Ok(nodes)
    }

    /// Builds a snapshot of `hosts`, retaining each of its nodes once.
    ///
    /// Hosts that can't be used are skipped; the last such error is
    /// returned alongside the snapshot.
    async fn build(
        &self,
        service: &str,
        hosts: &Hosts,
        params: &Params<C>,
    ) -> (Arc<Service<C>>, Option<Error>) {
        let mut nodes = Vec::new();
        let mut last_error = None;
        for (key, host) in hosts {
            if host.disabled {
                trace!(%service, host = %key, "Skipping disabled host");
                continue;
            }
            match self.build_host(key, host, params).await {
                Ok(built) if built.is_empty() => {
                    debug!(%service, host = %key, "Host has no ports");
                }
                Ok(built) => {
                    nodes.extend(built.into_iter().map(|node| {
                        node.retain();
                        BalanceNode::new(node, host.cost)
                    }));
                }
                Err(error) => {
                    warn!(%service, host = %key, %error, "Skipping host");
                    last_error = Some(error);
                }
            }
        }
        (Arc::new(Service::new(nodes, params.settings)), last_error)
    }

    /// One node per resolved address of `host`.
    async fn build_host(
        &self,
        key: &str,
        host: &HostConfig,
        params: &Params<C>,
    ) -> Result<Vec<Arc<ServiceNode<C>>>, Error> {
        let mut ports = Vec::new();
        let mut paths = Vec::new();
        for (port_key, addr) in host.port_addrs() {
            match addr? {
                PortAddr::Port(port) => ports.push((port_key, port)),
                PortAddr::Path(path) => paths.push((port_key, path)),
            }
        }
        if ports.is_empty() && paths.is_empty() {
            return Ok(Vec::new());
        }

        let ips: Vec<Option<IpAddr>> = if ports.is_empty() {
            vec![None]
        } else if host.name.is_empty() {
            return Err(InvalidHost::MissingName.into());
        } else {
            let ips = self.resolver.resolve_host(&host.name).await?;
            trace!(name = %host.name, ?ips, "Resolved");
            ips.into_iter().map(Some).collect()
        };

        let nodes = ips
            .into_iter()
            .map(|ip| {
                let mut connsets = AHashMap::new();
                if let Some(ip) = ip {
                    for (port_key, port) in &ports {
                        let addr = SocketAddr::new(ip, *port).to_string();
                        let key = ConnSetKey::new(*port_key, &params.net_network, addr);
                        let set = self.connset(key);
                        connsets.insert(port_key.to_string(), set);
                    }
                }
                for (port_key, path) in &paths {
                    let set = self.connset(ConnSetKey::new(*port_key, &params.unix_network, path));
                    connsets.insert(port_key.to_string(), set);
                }
                Arc::new(ServiceNode::new(key.to_string(), connsets))
            })
            .collect();
        Ok(nodes)
    }
}

impl<C: Liveness + Send + 'static> Inner<C> {
    /// Registers a service backed by discovery, waiting briefly for its
    /// first batch of hosts.
    async fn discover(self: &Arc<Self>, service: &str) -> Result<Arc<ServiceHolder<C>>, Error> {
        let Some(discovery) = self.discovery.clone() else {
            return Err(NoSuchService::new(service).into());
        };

        let holder = {
            let mut services = self.services.write();
            if let Some(holder) = services.get(service) {
                return Ok(holder.clone());
            }
            let holder = Arc::new(ServiceHolder::new(service.to_string(), self.default_params()));
            let (tx, rx) = watch::channel(false);
            let task = tokio::spawn(
                discovery::watch(
                    Arc::downgrade(self),
                    discovery,
                    service.to_string(),
                    self.config.discovery_backoff,
                    tx,
                )
                .instrument(info_span!("discovery", %service)),
            );
            holder.set_watch(Watch { task, ready: rx });
            services.insert(service.to_string(), holder.clone());
            holder
        };
        debug!(%service, "Started discovery");

        let wait = self.config.initial_wait;
        if let Some(mut ready) = holder.ready() {
            if !wait.is_zero()
                && tokio::time::timeout(wait, ready.wait_for(|ready| *ready))
                    .await
                    .is_err()
            {
                debug!(%service, ?wait, "Discovery not ready");
            }
        }
        Ok(holder)
    }
}

impl<C> Drop for Inner<C> {
    fn drop(&mut self) {
        for holder in self.services.get_mut().values() {
            holder.abort_watch();
        }
    }
}

impl Default for Builder<Io> {
    fn default() -> Self {
        Pool::builder()
    }
}
