//! Consumes a service discovery feed.
//!
//! A discovery source delivers flat key/value updates for a service's hosts,
//! grouped into batches. Updates are folded into a host table, and each
//! completed batch replaces the service's nodes.

use crate::{config::Hosts, dial::Liveness, pool::Inner, HostConfig};
use balpool_error::{Error, Recover};
use balpool_exp_backoff::ExponentialBackoff;
use futures::prelude::*;
use std::{
    collections::BTreeMap,
    pin::Pin,
    sync::{Arc, Weak},
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Message, Error>> + Send + 'static>>;

pub type WatchFuture = Pin<Box<dyn Future<Output = Result<MessageStream, Error>> + Send + 'static>>;

/// A source of discovery messages.
pub trait Discover: Send + Sync + 'static {
    /// Starts watching `service`. The stream should begin with the full
    /// current state of the service, terminated by [`Op::EndOfBatch`].
    fn watch(&self, service: &str) -> WatchFuture;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Must not decrease; messages with a lower index than one already
    /// seen are ignored. Gaps are fine.
    pub index: u64,
    pub op: Op,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    /// Sets `key` to `value` on `host`, creating the host if needed.
    Update {
        host: String,
        key: String,
        value: String,
    },
    /// Removes one key from `host`, or the whole host if `key` is `None`.
    Delete { host: String, key: Option<String> },
    /// Removes every host. Sent when a full resync starts.
    Flush,
    /// Applies everything received since the previous batch.
    EndOfBatch,
}

#[derive(Clone, Debug, Error)]
#[error("discovery stream ended")]
pub struct Eos(());

/// Folds messages into a host table.
#[derive(Debug, Default)]
pub(crate) struct Fold {
    hosts: BTreeMap<String, BTreeMap<String, String>>,
    index: Option<u64>,
}

// === impl Fold ===

impl Fold {
    /// Applies `msg`, returning the hosts to publish at the end of a batch.
    pub(crate) fn apply(&mut self, Message { index, op }: Message) -> Option<Hosts> {
        if let Some(last) = self.index {
            if index < last {
                trace!(index, last, "Ignoring stale message");
                return None;
            }
        }
        self.index = Some(index);

        match op {
            Op::Update { host, key, value } => {
                self.hosts.entry(host).or_default().insert(key, value);
                None
            }
            Op::Delete { host, key: Some(key) } => {
                if let Some(pairs) = self.hosts.get_mut(&host) {
                    pairs.remove(&key);
                }
                None
            }
            Op::Delete { host, key: None } => {
                self.hosts.remove(&host);
                None
            }
            Op::Flush => {
                self.hosts.clear();
                None
            }
            Op::EndOfBatch => Some(self.hosts()),
        }
    }

    fn hosts(&self) -> Hosts {
        let mut hosts = Hosts::new();
        for (key, pairs) in &self.hosts {
            match HostConfig::from_pairs(pairs) {
                Ok(host) => {
                    hosts.insert(key.clone(), host);
                }
                Err(error) => warn!(host = %key, %error, "Ignoring invalid host"),
            }
        }
        hosts
    }
}

// === impl Message ===

impl Message {
    pub fn update(
        index: u64,
        host: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            index,
            op: Op::Update {
                host: host.into(),
                key: key.into(),
                value: value.into(),
            },
        }
    }

    pub fn delete(index: u64, host: impl Into<String>, key: Option<&str>) -> Self {
        Self {
            index,
            op: Op::Delete {
                host: host.into(),
                key: key.map(Into::into),
            },
        }
    }

    pub fn flush(index: u64) -> Self {
        Self {
            index,
            op: Op::Flush,
        }
    }

    pub fn end_of_batch(index: u64) -> Self {
        Self {
            index,
            op: Op::EndOfBatch,
        }
    }
}

/// Runs discovery for `service` until the pool is dropped.
///
/// Stream failures are retried with `backoff`; the last applied batch stays
/// in effect in the meantime.
pub(crate) async fn watch<C>(
    pool: Weak<Inner<C>>,
    discover: Arc<dyn Discover>,
    service: String,
    backoff: ExponentialBackoff,
    ready: watch::Sender<bool>,
) where
    C: Liveness + Send + 'static,
{
    let mut backoffs = None;
    loop {
        let error = match discover.watch(&service).await {
            // Every stream restates the full host table from its own index.
            Ok(mut stream) => {
                let mut fold = Fold::default();
                loop {
                    match stream.next().await {
                        Some(Ok(msg)) => {
                            backoffs = None;
                            let Some(hosts) = fold.apply(msg) else {
                                continue;
                            };
                            let Some(pool) = pool.upgrade() else {
                                return;
                            };
                            match pool.update_hosts_config(&service, hosts).await {
                                Ok(0) => debug!("Batch produced no nodes"),
                                Ok(nodes) => debug!(nodes, "Applied batch"),
                                Err(error) => {
                                    debug!(%error, "Service removed");
                                    return;
                                }
                            }
                            ready.send_replace(true);
                        }
                        Some(Err(error)) => break error,
                        None => break Eos(()).into(),
                    }
                }
            }
            Err(error) => error,
        };
        warn!(%error, "Discovery failed");

        if backoffs.is_none() {
            match backoff.recover(error) {
                Ok(b) => backoffs = Some(b),
                Err(error) => {
                    warn!(%error, "Giving up on discovery");
                    return;
                }
            }
        }
        let Some(b) = backoffs.as_mut() else {
            return;
        };
        if b.next().await.is_none() {
            return;
        }
        if pool.strong_count() == 0 {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_batches() {
        let mut fold = Fold::default();
        assert_eq!(fold.apply(Message::update(1, "a", "name", "10.0.0.1")), None);
        assert_eq!(fold.apply(Message::update(1, "a", "port", "9")), None);
        assert_eq!(fold.apply(Message::update(2, "b", "name", "10.0.0.2")), None);
        assert_eq!(fold.apply(Message::update(2, "b", "port", "9")), None);

        let hosts = fold.apply(Message::end_of_batch(2)).unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts["a"].name, "10.0.0.1");
        assert_eq!(hosts["b"].ports["port"], "9");

        fold.apply(Message::delete(3, "b", None));
        fold.apply(Message::delete(3, "a", Some("port")));
        let hosts = fold.apply(Message::end_of_batch(4)).unwrap();
        assert_eq!(hosts.len(), 1);
        assert!(hosts["a"].ports.is_empty());

        fold.apply(Message::flush(5));
        assert!(fold.apply(Message::end_of_batch(5)).unwrap().is_empty());
    }

    #[test]
    fn ignores_stale_messages() {
        let mut fold = Fold::default();
        fold.apply(Message::update(10, "a", "port", "9"));
        fold.apply(Message::update(3, "b", "port", "9"));
        assert_eq!(fold.apply(Message::end_of_batch(2)), None);

        let hosts = fold.apply(Message::end_of_batch(12)).unwrap();
        assert_eq!(hosts.keys().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn skips_invalid_hosts() {
        let mut fold = Fold::default();
        fold.apply(Message::update(1, "a", "port", "nope"));
        fold.apply(Message::update(1, "b", "port", "9"));
        let hosts = fold.apply(Message::end_of_batch(1)).unwrap();
        assert_eq!(hosts.keys().collect::<Vec<_>>(), vec!["b"]);
    }
}
