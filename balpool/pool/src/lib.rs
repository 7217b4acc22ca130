//! A client-side connection pool that balances across the nodes of named
//! services.
//!
//! Services are registered with a [`ServiceConfig`] (or fed by a
//! [`Discover`] source) and checked out with [`Pool::new_conn`]. Each
//! checkout walks the service's nodes with a [`balpool_balance`] strategy,
//! reusing an idle pooled connection when one is available and dialing a
//! new one otherwise. Reconfiguration publishes a new immutable snapshot of
//! the service's nodes; idle connections to endpoints that survive the
//! change stay pooled.

#![deny(rust_2018_idioms, clippy::disallowed_methods, clippy::disallowed_types)]
#![forbid(unsafe_code)]

mod config;
mod connset;
pub mod dial;
pub mod discovery;
pub mod error;
mod handle;
mod node;
mod pool;
mod port_map;
mod service;

pub use self::{
    config::{
        HostConfig, Hosts, PoolConfig, ServiceConfig, DEFAULT_CONNECT_TIMEOUT,
        DEFAULT_INITIAL_WAIT, DEFAULT_NET_NETWORK, DEFAULT_UNIX_NETWORK,
    },
    connset::{ConnSetKey, ConnectionSet},
    dial::{dial_fn, ConnectTcpOrUnix, Dial, Io, Liveness, Target},
    discovery::{Discover, Message, Op},
    error::{ConnClosed, EmptyConfig, NoServiceNodes, NoSuchService, NoUsableHosts},
    handle::ConnectionHandle,
    node::{ServiceNode, ANY_PORT},
    pool::{Builder, NodePort, Pool},
    port_map::{InvalidPortMap, PortMap},
};
pub use balpool_balance::{Settings as BalanceSettings, Status, Strategy};
