use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;

use crate::error::{LockError, MIN_NODES};
use crate::node::Node;

/// Outcome of one scatter/gather round across all nodes.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Round {
    /// Nodes that accepted the operation.
    pub successes: usize,
    /// Whether the round both reached the threshold and left positive validity.
    pub ok: bool,
    /// Remaining safe hold time, clamped at zero.
    pub validity: Duration,
}

/// Executes one operation against every node concurrently and folds the
/// responses into a quorum decision with bounded-latency validity accounting.
pub(crate) struct Quorum {
    nodes: Vec<Arc<dyn Node>>,
    threshold: usize,
    drift_factor: f32,
}

impl Quorum {
    /// The threshold is a strict majority, but never below [`MIN_NODES`]:
    /// with 3 nodes all of them must accept, with 5 nodes 3 must, with 7
    /// nodes 4 must.
    pub(crate) fn new(nodes: Vec<Arc<dyn Node>>, drift_factor: f32) -> Result<Self, LockError> {
        if nodes.len() < MIN_NODES {
            return Err(LockError::InsufficientNodes(nodes.len()));
        }
        let threshold = (nodes.len() / 2 + 1).max(MIN_NODES);
        Ok(Self {
            nodes,
            threshold,
            drift_factor,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn threshold(&self) -> usize {
        self.threshold
    }

    /// Run `op` on every node and decide the round.
    ///
    /// The decision waits for the slowest node; the price of a straggler is
    /// paid in validity, not in a dropped response. Validity subtracts the
    /// round's elapsed time plus a drift allowance of
    /// `ttl * drift_factor + 2ms` from the requested ttl.
    pub(crate) async fn attempt<'a, F, Fut>(&'a self, ttl: Duration, op: F) -> Round
    where
        F: Fn(&'a dyn Node) -> Fut,
        Fut: Future<Output = bool>,
    {
        let started = Instant::now();
        let successes = join_all(self.nodes.iter().map(|node| op(node.as_ref())))
            .await
            .into_iter()
            .filter(|accepted| *accepted)
            .count();

        let ttl_ms = ttl.as_millis() as i64;
        let elapsed_ms = started.elapsed().as_millis() as i64;
        let drift_ms = (ttl_ms as f32 * self.drift_factor) as i64 + 2;
        let validity_ms = ttl_ms - elapsed_ms - drift_ms;

        Round {
            successes,
            ok: successes >= self.threshold && validity_ms > 0,
            validity: Duration::from_millis(validity_ms.max(0) as u64),
        }
    }

    /// Run `op` on every node, returning only the number of acceptances.
    pub(crate) async fn broadcast<'a, F, Fut>(&'a self, op: F) -> usize
    where
        F: Fn(&'a dyn Node) -> Fut,
        Fut: Future<Output = bool>,
    {
        self.gather(op)
            .await
            .into_iter()
            .filter(|accepted| *accepted)
            .count()
    }

    /// Run `op` on every node and collect each node's answer.
    pub(crate) async fn gather<'a, F, Fut, T>(&'a self, op: F) -> Vec<T>
    where
        F: Fn(&'a dyn Node) -> Fut,
        Fut: Future<Output = T>,
    {
        join_all(self.nodes.iter().map(|node| op(node.as_ref()))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{as_nodes, memory_cluster};

    const TTL: Duration = Duration::from_secs(1);

    #[test]
    fn rejects_too_few_nodes() {
        for count in 0..MIN_NODES {
            let cluster = memory_cluster(count);
            assert!(matches!(
                Quorum::new(as_nodes(&cluster), 0.01),
                Err(LockError::InsufficientNodes(n)) if n == count
            ));
        }
    }

    #[test]
    fn threshold_is_majority_with_a_floor() {
        for (count, expected) in [(3, 3), (4, 3), (5, 3), (7, 4), (9, 5)] {
            let quorum = Quorum::new(as_nodes(&memory_cluster(count)), 0.01).unwrap();
            assert_eq!(quorum.threshold(), expected, "with {count} nodes");
        }
    }

    #[tokio::test]
    async fn attempt_counts_acceptances() {
        let cluster = memory_cluster(5);
        cluster[0].fail_writes();
        cluster[1].fail_writes();
        let quorum = Quorum::new(as_nodes(&cluster), 0.01).unwrap();

        let round = quorum
            .attempt(TTL, |node| node.try_set("key", "token", TTL))
            .await;
        assert_eq!(round.successes, 3);
        assert!(round.ok);
    }

    #[tokio::test]
    async fn attempt_fails_below_threshold() {
        let cluster = memory_cluster(5);
        cluster[0].fail_writes();
        cluster[1].fail_writes();
        cluster[2].fail_writes();
        let quorum = Quorum::new(as_nodes(&cluster), 0.01).unwrap();

        let round = quorum
            .attempt(TTL, |node| node.try_set("key", "token", TTL))
            .await;
        assert_eq!(round.successes, 2);
        assert!(!round.ok);
    }

    #[tokio::test]
    async fn validity_is_bounded_by_ttl_minus_drift() {
        let cluster = memory_cluster(3);
        let quorum = Quorum::new(as_nodes(&cluster), 0.01).unwrap();

        let round = quorum
            .attempt(TTL, |node| node.try_set("key", "token", TTL))
            .await;
        assert!(round.ok);
        // 1000ms ttl, 1% drift + 2ms: at most 988ms may remain.
        assert!(round.validity <= Duration::from_millis(988));
        assert!(round.validity > Duration::ZERO);
    }

    #[tokio::test]
    async fn slow_round_yields_no_validity() {
        let ttl = Duration::from_millis(50);
        let cluster = memory_cluster(3);
        for node in &cluster {
            node.set_latency(Duration::from_millis(80));
        }
        let quorum = Quorum::new(as_nodes(&cluster), 0.01).unwrap();

        let round = quorum
            .attempt(ttl, |node| node.try_set("key", "token", ttl))
            .await;
        // Every node accepted, yet the lease was already spent in transit.
        assert_eq!(round.successes, 3);
        assert!(!round.ok);
        assert_eq!(round.validity, Duration::ZERO);
    }
}
