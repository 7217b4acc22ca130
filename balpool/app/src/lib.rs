//! Configures a connection pool from the environment.

#![deny(rust_2018_idioms, clippy::disallowed_methods, clippy::disallowed_types)]
#![forbid(unsafe_code)]

pub mod env;

pub use balpool_pool as pool;
pub use balpool_tracing as trace;
use balpool_error::Error;
use balpool_pool::{Builder, Dial, Io, Pool, PoolConfig};
use tracing::debug;

#[derive(Clone, Debug, Default)]
pub struct Config {
    pub pool: PoolConfig,
}

impl Config {
    /// Reads the configuration from process environment variables.
    pub fn from_env() -> Result<Self, env::EnvError> {
        env::Env.try_config()
    }

    /// Builds a pool that dials TCP and Unix sockets.
    pub fn build(self) -> Result<Pool<Io>, Error> {
        debug!(config = ?self.pool, "Building pool");
        Pool::builder().with_config(self.pool).build()
    }

    /// A pool builder around a custom dialer. A resolver or discovery
    /// source may be added before building.
    pub fn builder_with_dial<C, D: Dial<C>>(self, dial: D) -> Builder<C> {
        Builder::new(dial).with_config(self.pool)
    }
}
