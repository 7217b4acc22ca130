//! Cost-weighted node selection.
//!
//! A [`Balancer`] is an immutable list of weighted nodes plus the policy
//! knobs that govern how they are visited. Each request walks the list with
//! its own [`Iter`], reporting the outcome of the previous attempt to
//! [`Iter::next`] so that failing nodes are transiently penalized.

#![deny(rust_2018_idioms, clippy::disallowed_methods, clippy::disallowed_types)]
#![forbid(unsafe_code)]

mod iter;
mod node;

pub use self::{iter::Iter, node::BalanceNode};
use std::{fmt, str::FromStr, sync::Arc};
use thiserror::Error;

pub const DEFAULT_FAIL_COST: u64 = 10;
pub const DEFAULT_SOFT_FAIL_COST: u64 = 2;

/// The algorithm used to order node visits.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Visits nodes in list order.
    #[default]
    Seq,
    /// A cost-weighted first pick followed by a random permutation.
    Random,
    /// Like `Random`, but seeded from caller-supplied bytes so that equal
    /// seeds produce equal visitation orders within one build.
    Hash,
}

/// The outcome of the previously returned node.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Status {
    #[default]
    Start,
    Fail,
    SoftFail,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub strategy: Strategy,
    /// Extra full passes over the node list before giving up.
    pub retries: u32,
    pub fail_cost: u64,
    pub soft_fail_cost: u64,
}

#[derive(Debug)]
pub struct Balancer<T> {
    nodes: Vec<BalanceNode<T>>,
    settings: Settings,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid balance strategy: {0:?}")]
pub struct InvalidStrategy(String);

// === impl Strategy ===

impl FromStr for Strategy {
    type Err = InvalidStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("seq") || s.eq_ignore_ascii_case("sequential") {
            return Ok(Self::Seq);
        }
        if s.eq_ignore_ascii_case("random") {
            return Ok(Self::Random);
        }
        if s.eq_ignore_ascii_case("hash") {
            return Ok(Self::Hash);
        }
        Err(InvalidStrategy(s.to_string()))
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seq => "seq".fmt(f),
            Self::Random => "random".fmt(f),
            Self::Hash => "hash".fmt(f),
        }
    }
}

// === impl Settings ===

impl Default for Settings {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            retries: 0,
            fail_cost: DEFAULT_FAIL_COST,
            soft_fail_cost: DEFAULT_SOFT_FAIL_COST,
        }
    }
}

// === impl Balancer ===

impl<T> Balancer<T> {
    pub fn new(nodes: Vec<BalanceNode<T>>, settings: Settings) -> Self {
        Self { nodes, settings }
    }

    pub fn nodes(&self) -> &[BalanceNode<T>] {
        &self.nodes
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Starts a new walk over the node list.
    ///
    /// `seed` is only consulted by [`Strategy::Hash`]; without one, the hash
    /// strategy behaves like [`Strategy::Random`].
    pub fn iter(self: &Arc<Self>, seed: Option<&[u8]>) -> Iter<T> {
        Iter::new(self.clone(), seed)
    }
}

#[cfg(test)]
mod tests;
