#![deny(rust_2018_idioms, clippy::disallowed_methods, clippy::disallowed_types)]
#![forbid(unsafe_code)]

use balpool_error::Error;
use hickory_resolver::{
    config::ResolverConfig, name_server::TokioConnectionProvider, system_conf, TokioResolver,
};
pub use hickory_resolver::{config::ResolverOpts, ResolveError};
use std::{
    collections::HashMap,
    fmt,
    future::Future,
    net::{IpAddr, Ipv4Addr},
    pin::Pin,
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, trace};

pub type ResolveFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<IpAddr>, Error>> + Send + 'a>>;

/// Resolves a host name to the set of addresses it currently maps to.
pub trait Resolve: Send + Sync + 'static {
    fn resolve_host<'a>(&'a self, name: &'a str) -> ResolveFuture<'a>;
}

/// A DNS resolver backed by the system configuration.
#[derive(Clone)]
pub struct Resolver {
    dns: TokioResolver,
}

/// Resolves names from a fixed table.
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    hosts: Arc<HashMap<String, Vec<IpAddr>>>,
}

#[derive(Clone, Debug, Error)]
#[error("no addresses found for {name}")]
pub struct NoAddresses {
    name: String,
}

/// Host names that are answered without a lookup.
fn literal(name: &str) -> Option<IpAddr> {
    if name.eq_ignore_ascii_case("localhost") || name.eq_ignore_ascii_case("localhost.") {
        return Some(Ipv4Addr::LOCALHOST.into());
    }
    name.trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .ok()
}

// === impl Resolver ===

impl Resolver {
    /// Constructs a `Resolver` from the system configuration
    /// (`/etc/resolv.conf` on unix).
    pub fn from_system_config() -> Result<Self, Error> {
        let (config, opts) = system_conf::read_system_conf()?;
        trace!("DNS config: {:?}", &config);
        trace!("DNS opts: {:?}", &opts);
        Ok(Self::new(config, opts))
    }

    pub fn new(config: ResolverConfig, mut opts: ResolverOpts) -> Self {
        // Every pool reconfiguration wants fresh answers.
        opts.cache_size = 0;
        let dns =
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default())
                .with_options(opts)
                .build();
        Resolver { dns }
    }

    pub async fn resolve_ips(&self, name: &str) -> Result<Vec<IpAddr>, Error> {
        if let Some(ip) = literal(name) {
            return Ok(vec![ip]);
        }
        debug!(%name, "resolve_ip");
        let lookup = self.dns.lookup_ip(name).await?;
        let ips = lookup.iter().collect::<Vec<_>>();
        debug!(%name, ?ips);
        if ips.is_empty() {
            return Err(NoAddresses::new(name).into());
        }
        Ok(ips)
    }
}

impl Resolve for Resolver {
    fn resolve_host<'a>(&'a self, name: &'a str) -> ResolveFuture<'a> {
        Box::pin(self.resolve_ips(name))
    }
}

/// Note: `TokioResolver` does not implement `Debug`, so we must manually
///       implement this.
impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("resolver", &"...")
            .finish()
    }
}

// === impl StaticResolver ===

impl StaticResolver {
    pub fn new<N, I>(hosts: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = (N, Vec<IpAddr>)>,
    {
        let hosts = hosts.into_iter().map(|(n, ips)| (n.into(), ips)).collect();
        Self {
            hosts: Arc::new(hosts),
        }
    }
}

impl Resolve for StaticResolver {
    fn resolve_host<'a>(&'a self, name: &'a str) -> ResolveFuture<'a> {
        let res: Result<Vec<IpAddr>, Error> = match self.hosts.get(name) {
            Some(ips) if !ips.is_empty() => Ok(ips.clone()),
            _ => literal(name)
                .map(|ip| vec![ip])
                .ok_or_else(|| NoAddresses::new(name).into()),
        };
        Box::pin(std::future::ready(res))
    }
}

// === impl NoAddresses ===

impl NoAddresses {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
