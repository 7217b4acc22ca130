use crate::{error::InvalidHost, error::InvalidPort, PortMap};
use balpool_balance::{Settings, Strategy};
use balpool_exp_backoff::ExponentialBackoff;
use std::{collections::BTreeMap, hash::BuildHasher, time::Duration};

/// Hosts keyed by their configuration key. The key names the resulting
/// service nodes.
pub type Hosts = BTreeMap<String, HostConfig>;

pub const DEFAULT_NET_NETWORK: &str = "tcp";
pub const DEFAULT_UNIX_NETWORK: &str = "unix";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_INITIAL_WAIT: Duration = Duration::from_secs(1);

const DEFAULT_DISCOVERY_BACKOFF: ExponentialBackoff = ExponentialBackoff::new_unchecked(
    Duration::from_millis(100),
    Duration::from_secs(10),
    0.1,
);

/// Pool-wide settings.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub connect_timeout: Duration,
    /// How long the first connection for a discovered service waits for
    /// the first batch of hosts.
    pub initial_wait: Duration,
    pub net_network: String,
    pub unix_network: String,
    pub port_map: PortMap,
    pub discovery_backoff: ExponentialBackoff,
    /// Used for services that do not override balance settings.
    pub balance: Settings,
}

/// One host entry of a service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct HostConfig {
    /// A DNS name or IP literal. Empty if the host only has a `path` port.
    pub name: String,
    /// Port key to a numeric port (keys ending in `port`) or a filesystem
    /// path (the `path` key).
    pub ports: BTreeMap<String, String>,
    pub cost: u64,
    pub disabled: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ServiceConfig {
    /// Generated from the hosts when empty.
    pub service: String,
    pub hosts: Hosts,
    pub retries: u32,
    pub strategy: Strategy,
    /// Zero selects the pool default.
    pub fail_cost: u64,
    /// Zero selects the pool default.
    pub soft_fail_cost: u64,
    /// Network used for numeric ports. Empty selects the pool default.
    pub net_network: String,
    /// Network used for `path` ports. Empty selects the pool default.
    pub unix_network: String,
    pub connect_timeout: Option<Duration>,
}

/// How a port value is dialed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum PortAddr {
    Port(u16),
    Path(String),
}

// === impl PoolConfig ===

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            initial_wait: DEFAULT_INITIAL_WAIT,
            net_network: DEFAULT_NET_NETWORK.to_string(),
            unix_network: DEFAULT_UNIX_NETWORK.to_string(),
            port_map: PortMap::default(),
            discovery_backoff: DEFAULT_DISCOVERY_BACKOFF,
            balance: Settings::default(),
        }
    }
}

// === impl HostConfig ===

impl HostConfig {
    /// Builds a host from flat key/value pairs, as delivered by service
    /// discovery: `name`, `cost`, `disabled`, `path`, and `*port` keys.
    /// Unknown keys are ignored.
    pub fn from_pairs<K, V, I>(pairs: I) -> Result<Self, InvalidHost>
    where
        K: AsRef<str>,
        V: AsRef<str>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut host = HostConfig::default();
        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref().trim());
            match key {
                "name" => host.name = value.to_string(),
                "cost" => {
                    host.cost = value
                        .parse()
                        .map_err(|_| InvalidHost::Cost(value.to_string()))?
                }
                "disabled" => host.disabled = parse_flag(value)?,
                key if is_port_key(key) => {
                    port_addr(key, value)?;
                    host.ports.insert(key.to_string(), value.to_string());
                }
                _ => tracing::trace!(%key, "Ignoring unknown host key"),
            }
        }
        Ok(host)
    }

    pub fn with_port(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.ports.insert(key.into(), value.to_string());
        self
    }

    pub(crate) fn port_addrs(
        &self,
    ) -> impl Iterator<Item = (&str, Result<PortAddr, InvalidPort>)> + '_ {
        self.ports
            .iter()
            .filter(|(k, _)| is_port_key(k))
            .map(|(k, v)| (k.as_str(), port_addr(k, v)))
    }
}

fn is_port_key(key: &str) -> bool {
    key == "path" || key.ends_with("port")
}

fn port_addr(key: &str, value: &str) -> Result<PortAddr, InvalidPort> {
    if key == "path" {
        if value.is_empty() {
            return Err(InvalidPort::new(key, value));
        }
        return Ok(PortAddr::Path(value.to_string()));
    }
    match value.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(PortAddr::Port(port)),
        _ => Err(InvalidPort::new(key, value)),
    }
}

fn parse_flag(value: &str) -> Result<bool, InvalidHost> {
    match value {
        "" | "0" => Ok(false),
        "1" => Ok(true),
        v if v.eq_ignore_ascii_case("false") => Ok(false),
        v if v.eq_ignore_ascii_case("true") => Ok(true),
        v => Err(InvalidHost::Disabled(v.to_string())),
    }
}

// === impl ServiceConfig ===

impl ServiceConfig {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ..Self::default()
        }
    }

    pub fn with_host(mut self, key: impl Into<String>, host: HostConfig) -> Self {
        self.hosts.insert(key.into(), host);
        self
    }

    /// The configured name, or one derived from the hosts.
    pub fn service_name(&self) -> String {
        if !self.service.is_empty() {
            return self.service.clone();
        }
        // Fixed keys so that equal host lists name equal services across
        // processes running the same build.
        let state = ahash::RandomState::with_seeds(
            0x5be0_cd19_137e_2179,
            0x1f83_d9ab_fb41_bd6b,
            0x9b05_688c_2b3e_6c1f,
            0x510e_527f_ade6_82d1,
        );
        format!("hosts-{:016x}", state.hash_one(&self.hosts))
    }

    pub(crate) fn balance_settings(&self, defaults: &Settings) -> Settings {
        Settings {
            strategy: self.strategy,
            retries: self.retries,
            fail_cost: nonzero_or(self.fail_cost, defaults.fail_cost),
            soft_fail_cost: nonzero_or(self.soft_fail_cost, defaults.soft_fail_cost),
        }
    }
}

fn nonzero_or(v: u64, default: u64) -> u64 {
    if v == 0 {
        default
    } else {
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_from_pairs() {
        let host = HostConfig::from_pairs([
            ("name", "db1.example.com"),
            ("port", "8080"),
            ("controller_port", " 8081 "),
            ("path", "/run/db.sock"),
            ("cost", "3"),
            ("disabled", "false"),
            ("weight", "ignored"),
        ])
        .unwrap();
        assert_eq!(host.name, "db1.example.com");
        assert_eq!(host.cost, 3);
        assert!(!host.disabled);
        assert_eq!(host.ports.len(), 3);

        let addrs = host.port_addrs().collect::<Vec<_>>();
        assert!(addrs.contains(&("controller_port", Ok(PortAddr::Port(8081)))));
        assert!(addrs.contains(&("path", Ok(PortAddr::Path("/run/db.sock".into())))));
    }

    #[test]
    fn host_from_invalid_pairs() {
        assert_eq!(
            HostConfig::from_pairs([("port", "http")]),
            Err(InvalidHost::Port(InvalidPort::new("port", "http")))
        );
        assert_eq!(
            HostConfig::from_pairs([("port", "0")]),
            Err(InvalidHost::Port(InvalidPort::new("port", "0")))
        );
        assert_eq!(
            HostConfig::from_pairs([("cost", "-1")]),
            Err(InvalidHost::Cost("-1".into()))
        );
        assert_eq!(
            HostConfig::from_pairs([("disabled", "maybe")]),
            Err(InvalidHost::Disabled("maybe".into()))
        );
        assert!(HostConfig::from_pairs([("disabled", "1")]).unwrap().disabled);
    }

    #[test]
    fn generated_service_names_are_stable() {
        let cfg = ServiceConfig::default().with_host(
            "1",
            HostConfig {
                name: "10.0.0.1".into(),
                ..Default::default()
            }
            .with_port("port", 9),
        );
        let name = cfg.service_name();
        assert!(name.starts_with("hosts-"));
        assert_eq!(name, cfg.clone().service_name());

        let other = cfg.clone().with_host("2", HostConfig::default());
        assert_ne!(name, other.service_name());

        assert_eq!(ServiceConfig::new("search").service_name(), "search");
    }

    #[test]
    fn balance_defaults() {
        let defaults = Settings::default();
        let cfg = ServiceConfig {
            retries: 2,
            strategy: Strategy::Hash,
            soft_fail_cost: 7,
            ..Default::default()
        };
        let settings = cfg.balance_settings(&defaults);
        assert_eq!(settings.retries, 2);
        assert_eq!(settings.strategy, Strategy::Hash);
        assert_eq!(settings.fail_cost, defaults.fail_cost);
        assert_eq!(settings.soft_fail_cost, 7);
    }
}
