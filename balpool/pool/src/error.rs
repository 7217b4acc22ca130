use balpool_error::Error;
use std::io;
use thiserror::Error;

/// A service was configured without any hosts.
#[derive(Clone, Debug, Error)]
#[error("service configuration has no hosts")]
pub struct EmptyConfig(());

#[derive(Clone, Debug, Error)]
#[error("no such service: {service}")]
pub struct NoSuchService {
    service: String,
}

/// Every node and port of a service was tried without success.
///
/// The last transport error encountered, if any, is this error's source.
#[derive(Debug, Error)]
#[error("no usable nodes for service {service} port {port_key}")]
pub struct NoServiceNodes {
    service: String,
    port_key: String,
    #[source]
    last_error: Option<io::Error>,
}

/// The connection handle was already closed or returned to its pool.
#[derive(Clone, Debug, Error)]
#[error("connection handle is closed")]
pub struct ConnClosed(());

/// None of a service's hosts produced a usable node.
#[derive(Debug, Error)]
#[error("no usable hosts for service {service}")]
pub struct NoUsableHosts {
    service: String,
    #[source]
    source: Option<Error>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid port {key}={value:?}")]
pub struct InvalidPort {
    key: String,
    value: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InvalidHost {
    #[error("invalid cost: {0:?}")]
    Cost(String),
    #[error("invalid disabled flag: {0:?}")]
    Disabled(String),
    #[error("host has numeric ports but no name")]
    MissingName,
    #[error(transparent)]
    Port(#[from] InvalidPort),
}

#[derive(Clone, Debug, Error)]
#[error("unsupported network: {0}")]
pub struct UnsupportedNetwork(pub(crate) String);

// === impl EmptyConfig ===

impl EmptyConfig {
    pub(crate) fn new() -> Self {
        Self(())
    }
}

// === impl NoSuchService ===

impl NoSuchService {
    pub(crate) fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

// === impl NoServiceNodes ===

impl NoServiceNodes {
    pub(crate) fn new(
        service: impl Into<String>,
        port_key: impl Into<String>,
        last_error: Option<io::Error>,
    ) -> Self {
        Self {
            service: service.into(),
            port_key: port_key.into(),
            last_error,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn port_key(&self) -> &str {
        &self.port_key
    }

    pub fn last_error(&self) -> Option<&io::Error> {
        self.last_error.as_ref()
    }
}

// === impl ConnClosed ===

impl ConnClosed {
    pub(crate) fn new() -> Self {
        Self(())
    }
}

impl From<ConnClosed> for io::Error {
    fn from(e: ConnClosed) -> Self {
        io::Error::new(io::ErrorKind::NotConnected, e)
    }
}

// === impl NoUsableHosts ===

impl NoUsableHosts {
    pub(crate) fn new(service: impl Into<String>, source: Option<Error>) -> Self {
        Self {
            service: service.into(),
            source,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

// === impl InvalidPort ===

impl InvalidPort {
    pub(crate) fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}
