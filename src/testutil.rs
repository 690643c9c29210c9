//! In-process stand-ins for Redis instances, plus container helpers for the
//! tests that want the real thing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage};

use crate::node::{Node, RedisNode};

struct Entry {
    token: String,
    expires_at: Instant,
}

/// A single fake instance with honest SET NX PX / PEXPIRE / PTTL semantics,
/// plus switches to simulate outages and slow links.
#[derive(Default)]
pub(crate) struct MemoryNode {
    store: Mutex<HashMap<String, Entry>>,
    latency: Mutex<Option<Duration>>,
    write_failures: AtomicBool,
    release_failures: AtomicBool,
    try_set_count: AtomicUsize,
    release_count: AtomicUsize,
    extend_count: AtomicUsize,
    remaining_count: AtomicUsize,
}

impl MemoryNode {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make try_set and extend report failure, as an unreachable node would.
    pub(crate) fn fail_writes(&self) {
        self.write_failures.store(true, Ordering::SeqCst);
    }

    /// Make release report failure.
    pub(crate) fn fail_release(&self) {
        self.release_failures.store(true, Ordering::SeqCst);
    }

    pub(crate) fn reset_failures(&self) {
        self.write_failures.store(false, Ordering::SeqCst);
        self.release_failures.store(false, Ordering::SeqCst);
    }

    /// Delay every operation, as a congested link would.
    pub(crate) fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    /// Drop all keys, as expiry or a flush would.
    pub(crate) fn wipe(&self) {
        self.store.lock().unwrap().clear();
    }

    pub(crate) fn is_empty(&self) -> bool {
        let mut store = self.store.lock().unwrap();
        store.retain(|_, entry| entry.expires_at > Instant::now());
        store.is_empty()
    }

    pub(crate) fn try_set_calls(&self) -> usize {
        self.try_set_count.load(Ordering::SeqCst)
    }

    pub(crate) fn release_calls(&self) -> usize {
        self.release_count.load(Ordering::SeqCst)
    }

    pub(crate) fn extend_calls(&self) -> usize {
        self.extend_count.load(Ordering::SeqCst)
    }

    pub(crate) fn remaining_calls(&self) -> usize {
        self.remaining_count.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl Node for MemoryNode {
    async fn try_set(&self, key: &str, token: &str, ttl: Duration) -> bool {
        self.try_set_count.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if self.write_failures.load(Ordering::SeqCst) {
            return false;
        }
        let mut store = self.store.lock().unwrap();
        let now = Instant::now();
        match store.get(key) {
            Some(entry) if entry.expires_at > now => false,
            _ => {
                store.insert(
                    key.to_owned(),
                    Entry {
                        token: token.to_owned(),
                        expires_at: now + ttl,
                    },
                );
                true
            }
        }
    }

    async fn release(&self, key: &str, token: &str) -> bool {
        self.release_count.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if self.release_failures.load(Ordering::SeqCst) {
            return false;
        }
        let mut store = self.store.lock().unwrap();
        match store.get(key) {
            Some(entry) if entry.expires_at > Instant::now() && entry.token == token => {
                store.remove(key);
                true
            }
            _ => false,
        }
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> bool {
        self.extend_count.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if self.write_failures.load(Ordering::SeqCst) {
            return false;
        }
        let mut store = self.store.lock().unwrap();
        let now = Instant::now();
        match store.get_mut(key) {
            Some(entry) if entry.expires_at > now && entry.token == token => {
                entry.expires_at = now + ttl;
                true
            }
            _ => false,
        }
    }

    async fn remaining(&self, key: &str, token: &str) -> Option<Duration> {
        self.remaining_count.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let store = self.store.lock().unwrap();
        let now = Instant::now();
        match store.get(key) {
            Some(entry) if entry.expires_at > now && entry.token == token => {
                Some(entry.expires_at - now)
            }
            _ => None,
        }
    }
}

/// `count` fresh fake instances.
pub(crate) fn memory_cluster(count: usize) -> Vec<Arc<MemoryNode>> {
    (0..count).map(|_| MemoryNode::new()).collect()
}

/// Coerce concrete nodes into the trait objects the lock machinery takes.
pub(crate) fn as_nodes(cluster: &[Arc<MemoryNode>]) -> Vec<Arc<dyn Node>> {
    cluster
        .iter()
        .map(|node| node.clone() as Arc<dyn Node>)
        .collect()
}

/// Start `count` throwaway Redis containers and wrap each in a node adapter.
///
/// The containers live as long as the returned handles do; keep them bound.
pub(crate) async fn start_redis_nodes(
    count: usize,
) -> anyhow::Result<(Vec<ContainerAsync<GenericImage>>, Vec<Arc<dyn Node>>)> {
    let mut containers = Vec::with_capacity(count);
    let mut nodes: Vec<Arc<dyn Node>> = Vec::with_capacity(count);
    for _ in 0..count {
        let container = GenericImage::new("redis", "7-alpine")
            .with_exposed_port(6379.tcp())
            .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
            .start()
            .await?;
        let port = container.get_host_port_ipv4(6379.tcp()).await?;
        let node = RedisNode::from_url(format!("redis://127.0.0.1:{port}").as_str())?
            .with_response_timeout(Duration::from_secs(1));
        nodes.push(Arc::new(node));
        containers.push(container);
    }
    Ok((containers, nodes))
}
