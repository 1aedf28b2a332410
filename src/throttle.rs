//! Per-destination-node token pools gating concurrent network operations.
//!
//! Each resource class (download, ingest) owns one `NodeTokenMap`; a token
//! is held for exactly one network operation and returned on every exit
//! path, including errors, panics and cancelled futures.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

pub(crate) struct NodeTokenMap {
    pools: RwLock<HashMap<u64, Arc<Semaphore>>>,
    tokens_per_node: usize,
    released: Arc<Notify>,
}

impl NodeTokenMap {
    /// Builds one pool per known node. Nodes scaled into the cluster later
    /// get their pool lazily on first acquisition.
    pub(crate) fn new(
        node_ids: impl IntoIterator<Item = u64>,
        tokens_per_node: usize,
        released: Arc<Notify>,
    ) -> Self {
        let pools = node_ids
            .into_iter()
            .map(|id| (id, Arc::new(Semaphore::new(tokens_per_node))))
            .collect();
        NodeTokenMap {
            pools: RwLock::new(pools),
            tokens_per_node,
            released,
        }
    }

    /// Returns the pool for `node_id`, creating it on first use. The read
    /// path is the hot path; the write path double-checks, so an existing
    /// pool is never replaced while permits are outstanding.
    fn pool(&self, node_id: u64) -> Arc<Semaphore> {
        if let Some(pool) = self.pools.read().unwrap().get(&node_id) {
            return Arc::clone(pool);
        }
        let mut pools = self.pools.write().unwrap();
        Arc::clone(
            pools
                .entry(node_id)
                .or_insert_with(|| Arc::new(Semaphore::new(self.tokens_per_node))),
        )
    }

    /// Acquires one token for `node_id`, waiting until one is free. The
    /// returned permit gives the token back when dropped.
    pub(crate) async fn acquire(&self, node_id: u64) -> TokenPermit {
        let permit = self
            .pool(node_id)
            .acquire_owned()
            .await
            .expect("token pool is never closed");
        TokenPermit {
            permit: Some(permit),
            released: Arc::clone(&self.released),
        }
    }

    /// True when every pool has all its tokens out on loan. An empty map
    /// never blocks.
    pub(crate) fn should_block(&self) -> bool {
        let pools = self.pools.read().unwrap();
        if pools.is_empty() {
            return false;
        }
        pools.values().all(|pool| pool.available_permits() == 0)
    }
}

/// One in-flight network operation's token.
pub(crate) struct TokenPermit {
    permit: Option<OwnedSemaphorePermit>,
    released: Arc<Notify>,
}

impl Drop for TokenPermit {
    fn drop(&mut self) {
        // Return the token before waking, so a woken waiter re-checking
        // the backpressure predicate observes the free token.
        self.permit.take();
        self.released.notify_waiters();
    }
}
