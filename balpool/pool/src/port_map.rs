use std::{collections::HashMap, fmt, str::FromStr, sync::Arc};
use thiserror::Error;

/// Maps numeric ports to ordered lists of named port keys, so that callers
/// that only know a port number can still select a named port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortMap(Arc<HashMap<String, Vec<String>>>);

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid port map entry: {0:?}")]
pub struct InvalidPortMap(String);

const DEFAULT_PORTS: &[(&str, &str)] = &[
    ("80", "http_port"),
    ("443", "http_port"),
    ("8080", "port"),
    ("8081", "controller_port"),
    ("8082", "keepalive_port,port"),
    ("8180", "plog_port"),
];

impl PortMap {
    pub fn empty() -> Self {
        Self(Default::default())
    }

    /// Returns the port keys to try, in order, for `port_key`.
    ///
    /// Keys that are not in the map are returned as-is.
    pub fn lookup(&self, port_key: &str) -> Vec<String> {
        match self.0.get(port_key) {
            Some(keys) => keys.clone(),
            None => vec![port_key.to_string()],
        }
    }

    /// Adds or replaces `port`'s entry. `keys` is a comma-separated list.
    pub fn insert(&mut self, port: impl Into<String>, keys: &str) {
        Arc::make_mut(&mut self.0).insert(port.into(), split_keys(keys));
    }

    /// Returns a copy of this map with `other`'s entries layered on top.
    pub fn merged(&self, other: &PortMap) -> Self {
        let mut map = (*self.0).clone();
        map.extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self(Arc::new(map))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn split_keys(keys: &str) -> Vec<String> {
    keys.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(String::from)
        .collect()
}

impl Default for PortMap {
    fn default() -> Self {
        let mut map = Self::empty();
        for (port, keys) in DEFAULT_PORTS {
            map.insert(*port, keys);
        }
        map
    }
}

/// Parses `num=key[,key...];...`.
impl FromStr for PortMap {
    type Err = InvalidPortMap;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut map = Self::empty();
        for entry in s.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (port, keys) = entry
                .split_once('=')
                .ok_or_else(|| InvalidPortMap(entry.to_string()))?;
            let port = port.trim();
            if port.parse::<u16>().is_err() || split_keys(keys).is_empty() {
                return Err(InvalidPortMap(entry.to_string()));
            }
            map.insert(port, keys);
        }
        Ok(map)
    }
}

impl fmt::Display for PortMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ports = self.0.keys().collect::<Vec<_>>();
        ports.sort();
        for (i, port) in ports.into_iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{}={}", port, self.0[port].join(","))?;
        }
        Ok(())
    }
}
