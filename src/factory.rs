use std::sync::Arc;

use crate::error::{LockError, MIN_NODES};
use crate::lock::{Lock, LockOptions};
use crate::node::{Node, NodeConfig, RedisNode};
use crate::reentrant::ReentrantLock;

/// Builds locks that share one set of Redis nodes.
///
/// The factory owns the node list and hands every lock a clone of it, so all
/// locks built here compete over the same instances. Nodes can come from
/// pre-built clients, from [`NodeConfig`]s, or any mix of the two: build
/// [`RedisNode`]s however suits each instance and pass them in one vector.
#[derive(Clone)]
pub struct LockFactory {
    nodes: Vec<Arc<dyn Node>>,
    defaults: LockOptions,
}

impl LockFactory {
    /// Fails with [`LockError::InsufficientNodes`] when fewer than three
    /// nodes are supplied; the algorithm is meaningless below that.
    pub fn new(nodes: Vec<Arc<dyn Node>>) -> Result<Self, LockError> {
        if nodes.len() < MIN_NODES {
            return Err(LockError::InsufficientNodes(nodes.len()));
        }
        Ok(Self {
            nodes,
            defaults: LockOptions::default(),
        })
    }

    /// Build the node set from connection configurations.
    pub fn from_configs(configs: &[NodeConfig]) -> Result<Self, LockError> {
        let nodes = configs
            .iter()
            .map(|config| {
                RedisNode::from_config(config).map(|node| Arc::new(node) as Arc<dyn Node>)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(nodes)
    }

    /// Build the node set from plain connection URLs.
    pub fn from_urls<I, S>(urls: I) -> Result<Self, LockError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let nodes = urls
            .into_iter()
            .map(|url| {
                RedisNode::from_url(url.as_ref()).map(|node| Arc::new(node) as Arc<dyn Node>)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(nodes)
    }

    /// Options applied by [`lock`](LockFactory::lock) and
    /// [`reentrant_lock`](LockFactory::reentrant_lock).
    pub fn with_defaults(mut self, options: LockOptions) -> Self {
        self.defaults = options;
        self
    }

    pub fn nodes(&self) -> &[Arc<dyn Node>] {
        &self.nodes
    }

    pub fn lock(&self, name: impl Into<String>) -> Result<Lock, LockError> {
        self.lock_with(name, self.defaults.clone())
    }

    pub fn lock_with(
        &self,
        name: impl Into<String>,
        options: LockOptions,
    ) -> Result<Lock, LockError> {
        Lock::new(name, self.nodes.clone(), options)
    }

    pub fn reentrant_lock(&self, name: impl Into<String>) -> Result<ReentrantLock, LockError> {
        self.reentrant_lock_with(name, self.defaults.clone())
    }

    pub fn reentrant_lock_with(
        &self,
        name: impl Into<String>,
        options: LockOptions,
    ) -> Result<ReentrantLock, LockError> {
        ReentrantLock::new(name, self.nodes.clone(), options)
    }
}
