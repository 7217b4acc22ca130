use crate::{Balancer, Status, Strategy};
use rand::{rngs::SmallRng, seq::SliceRandom, Rng, SeedableRng};
use std::{hash::BuildHasher, sync::Arc};
use tracing::trace;

/// A single walk over a [`Balancer`]'s nodes.
///
/// The walk visits every node once per pass and makes `retries + 1` passes
/// before it is exhausted. Once exhausted, [`Iter::next`] returns `None`
/// forever.
#[derive(Debug)]
pub struct Iter<T> {
    balancer: Arc<Balancer<T>>,
    order: Order,
    passes: u32,
    last: Option<usize>,
    exhausted: bool,
}

#[derive(Debug)]
enum Order {
    Seq {
        next: usize,
    },
    Shuffled {
        rng: SmallRng,
        indices: Vec<usize>,
        next: usize,
    },
}

// Fixed keys so that equal seeds hash equally across processes running the
// same build. Neither ahash nor `SmallRng` output is stable across versions
// or platforms.
const SEED_KEYS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

pub(crate) fn hash_seed(seed: &[u8]) -> u64 {
    let [k0, k1, k2, k3] = SEED_KEYS;
    ahash::RandomState::with_seeds(k0, k1, k2, k3).hash_one(seed)
}

// === impl Iter ===

impl<T> Iter<T> {
    pub(crate) fn new(balancer: Arc<Balancer<T>>, seed: Option<&[u8]>) -> Self {
        let order = match (balancer.settings.strategy, seed) {
            (Strategy::Seq, _) => Order::Seq { next: 0 },
            (Strategy::Hash, Some(seed)) => {
                Order::shuffled(SmallRng::seed_from_u64(hash_seed(seed)))
            }
            (Strategy::Random, _) | (Strategy::Hash, None) => {
                Order::shuffled(SmallRng::from_os_rng())
            }
        };
        Self {
            balancer,
            order,
            passes: 0,
            last: None,
            exhausted: false,
        }
    }

    /// The balancer this walk was started against.
    pub fn balancer(&self) -> &Arc<Balancer<T>> {
        &self.balancer
    }

    /// Records `status` against the previously returned node and returns the
    /// next node to try, or `None` once every pass has been used.
    ///
    /// The sequential strategy never consults costs, so it records nothing.
    pub fn next(&mut self, status: Status) -> Option<&T> {
        let settings = self.balancer.settings;
        if let Some(last) = self.last.filter(|_| settings.strategy != Strategy::Seq) {
            let node = &self.balancer.nodes[last];
            match status {
                Status::Start => {}
                Status::Fail => node.penalize(settings.fail_cost),
                Status::SoftFail => node.penalize(settings.soft_fail_cost),
            }
        }

        self.last = self.next_index();
        let idx = self.last?;
        Some(self.balancer.nodes[idx].value())
    }

    /// Clears any penalty on the last returned node.
    pub fn close(&mut self) {
        if let Some(last) = self.last.take() {
            self.balancer.nodes[last].reset_cost();
        }
    }

    fn next_index(&mut self) -> Option<usize> {
        let len = self.balancer.nodes.len();
        if self.exhausted || len == 0 {
            return None;
        }

        let retries = self.balancer.settings.retries;
        match self.order {
            Order::Seq { ref mut next } => {
                if *next == len {
                    self.passes += 1;
                    *next = 0;
                }
                if self.passes > retries {
                    self.exhausted = true;
                    return None;
                }
                let idx = *next;
                *next += 1;
                Some(idx)
            }

            Order::Shuffled {
                ref mut rng,
                ref mut indices,
                ref mut next,
            } => {
                if indices.is_empty() {
                    // The first pick honors node costs; every later pick
                    // walks a uniform permutation.
                    let first = weighted_pick(&self.balancer, rng);
                    indices.extend(0..len);
                    indices.shuffle(rng);
                    if let Some(at) = indices.iter().position(|&i| i == first) {
                        indices.swap(0, at);
                    }
                    trace!(first, "Weighted pick");
                } else if *next == len {
                    self.passes += 1;
                    if self.passes > retries {
                        self.exhausted = true;
                        return None;
                    }
                    indices.shuffle(rng);
                    *next = 0;
                }
                let idx = indices[*next];
                *next += 1;
                Some(idx)
            }
        }
    }
}

// === impl Order ===

impl Order {
    fn shuffled(rng: SmallRng) -> Self {
        Order::Shuffled {
            rng,
            indices: Vec::new(),
            next: 0,
        }
    }
}

/// Walks the nodes accumulating `1 / effective_cost`, replacing the pick
/// with node `i` whenever `w_i / total_i` exceeds a fresh uniform draw.
fn weighted_pick<T, R: Rng>(balancer: &Balancer<T>, rng: &mut R) -> usize {
    let mut total = 0.0;
    let mut pick = 0;
    for (i, node) in balancer.nodes.iter().enumerate() {
        let weight = node.weight();
        total += weight;
        if weight / total > rng.random::<f64>() {
            pick = i;
        }
    }
    pick
}
