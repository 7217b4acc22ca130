use super::*;
use quickcheck::{quickcheck, TestResult};
use std::collections::HashSet;

fn balancer(costs: &[u64], strategy: Strategy, retries: u32) -> Arc<Balancer<usize>> {
    let nodes = costs
        .iter()
        .enumerate()
        .map(|(i, &cost)| BalanceNode::new(i, cost))
        .collect();
    Arc::new(Balancer::new(
        nodes,
        Settings {
            strategy,
            retries,
            ..Settings::default()
        },
    ))
}

fn drain(iter: &mut Iter<usize>, status: Status) -> Vec<usize> {
    let mut visited = Vec::new();
    while let Some(&n) = iter.next(status) {
        visited.push(n);
    }
    visited
}

quickcheck! {
    fn seq_exhausts_after_every_pass(nodes: u8, retries: u8, fail: bool) -> TestResult {
        if nodes > 32 || retries > 8 {
            return TestResult::discard();
        }
        let costs = vec![1; nodes as usize];
        let balancer = balancer(&costs, Strategy::Seq, retries as u32);
        let status = if fail { Status::Fail } else { Status::Start };
        let mut iter = balancer.iter(None);
        let visited = drain(&mut iter, status);
        if visited.len() != nodes as usize * (retries as usize + 1) {
            return TestResult::failed();
        }
        TestResult::from_bool(iter.next(Status::Start).is_none())
    }

    fn random_visits_each_node_once_per_pass(nodes: u8, retries: u8) -> TestResult {
        if nodes == 0 || nodes > 32 || retries > 4 {
            return TestResult::discard();
        }
        let costs = vec![1; nodes as usize];
        let balancer = balancer(&costs, Strategy::Random, retries as u32);
        let visited = drain(&mut balancer.iter(None), Status::Fail);
        let ok = visited.chunks(nodes as usize).all(|pass| {
            pass.len() == nodes as usize
                && pass.iter().collect::<HashSet<_>>().len() == nodes as usize
        });
        TestResult::from_bool(ok && visited.len() == nodes as usize * (retries as usize + 1))
    }

    fn hash_is_deterministic(seed: Vec<u8>, nodes: u8) -> TestResult {
        if nodes == 0 || nodes > 32 {
            return TestResult::discard();
        }
        let costs = vec![1; nodes as usize];
        let balancer = balancer(&costs, Strategy::Hash, 1);
        let a = drain(&mut balancer.iter(Some(&seed)), Status::Start);
        let b = drain(&mut balancer.iter(Some(&seed)), Status::Start);
        TestResult::from_bool(a == b)
    }
}

#[test]
fn seq_walks_in_order() {
    let balancer = balancer(&[1, 1, 1], Strategy::Seq, 1);
    let visited = drain(&mut balancer.iter(None), Status::Start);
    assert_eq!(visited, vec![0, 1, 2, 0, 1, 2]);
}

#[test]
fn empty_balancer_is_exhausted() {
    for strategy in [Strategy::Seq, Strategy::Random, Strategy::Hash] {
        let balancer = balancer(&[], strategy, 3);
        assert!(balancer.iter(Some(b"10.0.0.1")).next(Status::Start).is_none());
    }
}

#[test]
fn hash_seeds_differ() {
    let balancer = balancer(&[1; 16], Strategy::Hash, 0);
    let orders = (0..8u8)
        .map(|i| drain(&mut balancer.iter(Some(&[i])), Status::Start))
        .collect::<HashSet<_>>();
    assert!(orders.len() > 1, "distinct seeds should produce distinct orders");
}

#[test]
fn hash_order_depends_only_on_the_seed() {
    let a = balancer(&[1; 8], Strategy::Hash, 0);
    let b = balancer(&[1; 8], Strategy::Hash, 0);
    let seed: &[u8] = b"10.1.1.1";
    assert_eq!(
        drain(&mut a.iter(Some(seed)), Status::Start),
        drain(&mut b.iter(Some(seed)), Status::Start)
    );
    assert_eq!(super::iter::hash_seed(seed), super::iter::hash_seed(b"10.1.1.1"));
}

#[test]
fn hash_without_seed_still_visits_everything() {
    let balancer = balancer(&[1; 5], Strategy::Hash, 0);
    let visited = drain(&mut balancer.iter(None), Status::Start);
    assert_eq!(visited.into_iter().collect::<HashSet<_>>().len(), 5);
}

#[test]
fn weighted_first_pick_prefers_cheap_nodes() {
    let balancer = balancer(&[1000, 1, 1000], Strategy::Random, 0);
    let cheap = (0..1000)
        .filter(|_| balancer.iter(None).next(Status::Start) == Some(&1))
        .count();
    // Node 1 carries ~99.8% of the weight.
    assert!(cheap > 950, "cheap node picked {cheap} times");
}

#[test]
fn failures_penalize_and_close_resets() {
    // A single node is returned once per pass, whatever the shuffle.
    let balancer = balancer(&[1], Strategy::Random, 2);
    let mut iter = balancer.iter(None);

    assert_eq!(iter.next(Status::Start), Some(&0));
    assert_eq!(iter.next(Status::Fail), Some(&0));
    assert_eq!(balancer.nodes()[0].effective_cost(), DEFAULT_FAIL_COST);
    assert_eq!(balancer.nodes()[0].cost(), 1);

    assert_eq!(iter.next(Status::SoftFail), Some(&0));
    assert_eq!(balancer.nodes()[0].effective_cost(), DEFAULT_SOFT_FAIL_COST);

    iter.close();
    assert_eq!(balancer.nodes()[0].effective_cost(), 1);
    assert_eq!(iter.next(Status::Fail), None);
    // Closing forgot the last node, so the final status has nowhere to go.
    assert_eq!(balancer.nodes()[0].effective_cost(), 1);
}

#[test]
fn seq_ignores_status() {
    let balancer = balancer(&[1, 1], Strategy::Seq, 0);
    let mut iter = balancer.iter(None);
    assert_eq!(iter.next(Status::Start), Some(&0));
    assert_eq!(iter.next(Status::Fail), Some(&1));
    assert_eq!(iter.next(Status::SoftFail), None);
    assert!(balancer.nodes().iter().all(|n| n.effective_cost() == 1));
}

#[test]
fn penalized_nodes_lose_the_first_pick() {
    let balancer = balancer(&[1, 1], Strategy::Random, 0);
    balancer.nodes()[0].penalize(10_000);
    let picks = (0..500)
        .filter(|_| balancer.iter(None).next(Status::Start) == Some(&0))
        .count();
    assert!(picks < 25, "penalized node picked {picks} times");
}

#[test]
fn zero_cost_is_clamped() {
    let node = BalanceNode::new((), 0);
    assert_eq!(node.cost(), 1);
    assert_eq!(node.effective_cost(), 1);
}

#[test]
fn parse_strategy() {
    assert_eq!("seq".parse::<Strategy>(), Ok(Strategy::Seq));
    assert_eq!("Random".parse::<Strategy>(), Ok(Strategy::Random));
    assert_eq!("HASH".parse::<Strategy>(), Ok(Strategy::Hash));
    assert!("round-robin".parse::<Strategy>().is_err());
    assert_eq!(Strategy::Hash.to_string(), "hash");
}
