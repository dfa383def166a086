/// Connection pools and role-partitioned pool selection.
///
/// Selection fairness and connection checkout are two separate concerns.
/// The registry holds one bounded set of pools per role; a pool is removed
/// from its set only for the instant a session draws a connection from it,
/// then reinserted, so concurrent sessions rotate across same-role nodes
/// without two of them mutating one pool's rotation at once. Checkout of
/// individual connections is synchronized inside each pool.
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

use crate::core::connect::ProxyStream;
use crate::core::NodeRole;

/// A live, authenticated connection to one backend node.
pub struct BackendConnection {
    pub stream: ProxyStream,
    node_name: String,
}

impl BackendConnection {
    pub fn new(stream: ProxyStream, node_name: String) -> Self {
        Self { stream, node_name }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }
}

/// Bounded set of warm connections for a single node.
///
/// Dropping a checked-out connection instead of releasing it permanently
/// shrinks the pool; broken connections must never be reinserted.
pub struct ConnectionPool {
    name: String,
    capacity: usize,
    connections: Mutex<VecDeque<BackendConnection>>,
    available: Semaphore,
}

impl ConnectionPool {
    pub fn new(name: String, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            connections: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Semaphore::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of connections currently checked in.
    pub async fn size(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Seed the pool with a freshly authenticated connection. Additions
    /// beyond capacity are rejected.
    pub async fn add(&self, connection: BackendConnection) -> bool {
        let mut connections = self.connections.lock().await;
        if connections.len() >= self.capacity {
            return false;
        }
        connections.push_back(connection);
        drop(connections);
        self.available.add_permits(1);
        true
    }

    /// Draw the next connection, waiting until one is checked in. FIFO
    /// rotation over the warm set.
    pub async fn acquire(&self) -> BackendConnection {
        // the semaphore never closes, and a permit guarantees a queued
        // connection
        let permit = self
            .available
            .acquire()
            .await
            .expect("pool semaphore closed");
        permit.forget();

        let mut connections = self.connections.lock().await;
        connections
            .pop_front()
            .expect("pool permit held without a queued connection")
    }

    /// Return a previously drawn connection to the free set.
    pub async fn release(&self, connection: BackendConnection) {
        debug!(pool = %self.name, "connection returned to pool");
        let mut connections = self.connections.lock().await;
        connections.push_back(connection);
        drop(connections);
        self.available.add_permits(1);
    }
}

/// One bounded, concurrency-safe collection of node pools.
struct RoleSet {
    pools: Mutex<VecDeque<Arc<ConnectionPool>>>,
    available: Semaphore,
}

impl RoleSet {
    fn new() -> Self {
        Self {
            pools: Mutex::new(VecDeque::new()),
            available: Semaphore::new(0),
        }
    }

    async fn put(&self, pool: Arc<ConnectionPool>) {
        let mut pools = self.pools.lock().await;
        pools.push_back(pool);
        drop(pools);
        self.available.add_permits(1);
    }

    async fn take(&self) -> Arc<ConnectionPool> {
        let permit = self
            .available
            .acquire()
            .await
            .expect("role set semaphore closed");
        permit.forget();

        let mut pools = self.pools.lock().await;
        pools
            .pop_front()
            .expect("role set permit held without a queued pool")
    }
}

/// Role-partitioned registry of node pools.
pub struct PoolRegistry {
    write: RoleSet,
    read: RoleSet,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self {
            write: RoleSet::new(),
            read: RoleSet::new(),
        }
    }

    /// Register a seeded pool under its node's role.
    pub async fn add_pool(&self, role: NodeRole, pool: Arc<ConnectionPool>) {
        match role {
            NodeRole::Primary => self.write.put(pool).await,
            NodeRole::Replica => self.read.put(pool).await,
        }
    }

    /// Take exclusive hold of a pool of the requested role, waiting until
    /// one is available. Hold it only long enough to draw a connection.
    pub async fn acquire_pool(&self, read: bool) -> Arc<ConnectionPool> {
        if read {
            self.read.take().await
        } else {
            self.write.take().await
        }
    }

    /// Reinsert a pool, making it available to the next session.
    pub async fn release_pool(&self, pool: Arc<ConnectionPool>, read: bool) {
        if read {
            self.read.put(pool).await
        } else {
            self.write.put(pool).await
        }
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_connection(node: &str) -> BackendConnection {
        let (near, far) = tokio::io::duplex(64);
        // keep the far end alive alongside the near end so reads don't EOF
        std::mem::forget(far);
        BackendConnection::new(Box::new(near), node.to_string())
    }

    #[test]
    fn test_pool_add_respects_capacity() {
        tokio_test::block_on(async {
            let pool = ConnectionPool::new("replica1".to_string(), 2);

            assert!(pool.add(test_connection("replica1")).await);
            assert!(pool.add(test_connection("replica1")).await);
            assert!(!pool.add(test_connection("replica1")).await);
            assert_eq!(pool.size().await, 2);
        });
    }

    #[tokio::test]
    async fn test_pool_acquire_release_rotates_fifo() {
        let pool = ConnectionPool::new("replica1".to_string(), 2);
        pool.add(test_connection("a")).await;
        pool.add(test_connection("b")).await;

        let first = pool.acquire().await;
        assert_eq!(first.node_name(), "a");
        pool.release(first).await;

        // "b" was queued ahead of the returned "a"
        let second = pool.acquire().await;
        assert_eq!(second.node_name(), "b");
        assert_eq!(pool.size().await, 1);
    }

    #[tokio::test]
    async fn test_pool_acquire_waits_for_checkin() {
        let pool = Arc::new(ConnectionPool::new("replica1".to_string(), 1));
        pool.add(test_connection("only")).await;

        let held = pool.acquire().await;

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await })
        };

        // the waiter cannot finish while the one connection is out
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        pool.release(held).await;
        let reacquired = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reacquired.node_name(), "only");
    }

    #[tokio::test]
    async fn test_dropped_connection_shrinks_pool() {
        let pool = ConnectionPool::new("replica1".to_string(), 2);
        pool.add(test_connection("a")).await;
        pool.add(test_connection("b")).await;

        let broken = pool.acquire().await;
        drop(broken);

        assert_eq!(pool.size().await, 1);
    }

    #[tokio::test]
    async fn test_registry_partitions_by_role() {
        let registry = PoolRegistry::new();
        registry
            .add_pool(
                NodeRole::Primary,
                Arc::new(ConnectionPool::new("primary".to_string(), 1)),
            )
            .await;
        registry
            .add_pool(
                NodeRole::Replica,
                Arc::new(ConnectionPool::new("replica1".to_string(), 1)),
            )
            .await;

        let write = registry.acquire_pool(false).await;
        assert_eq!(write.name(), "primary");
        registry.release_pool(write, false).await;

        let read = registry.acquire_pool(true).await;
        assert_eq!(read.name(), "replica1");
        registry.release_pool(read, true).await;
    }

    #[tokio::test]
    async fn test_registry_round_robins_same_role_pools() {
        let registry = PoolRegistry::new();
        for name in ["replica1", "replica2"] {
            registry
                .add_pool(
                    NodeRole::Replica,
                    Arc::new(ConnectionPool::new(name.to_string(), 1)),
                )
                .await;
        }

        let first = registry.acquire_pool(true).await;
        registry.release_pool(Arc::clone(&first), true).await;
        let second = registry.acquire_pool(true).await;
        registry.release_pool(Arc::clone(&second), true).await;

        assert_eq!(first.name(), "replica1");
        assert_eq!(second.name(), "replica2");
    }

    #[tokio::test]
    async fn test_concurrent_selection_never_shares_a_held_pool() {
        const SESSIONS: usize = 8;
        const ROUNDS: usize = 50;

        let registry = Arc::new(PoolRegistry::new());
        let holders = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]);

        for (index, name) in ["replica1", "replica2"].iter().enumerate() {
            let pool = Arc::new(ConnectionPool::new(format!("{}#{}", name, index), 2));
            pool.add(test_connection(name)).await;
            pool.add(test_connection(name)).await;
            registry.add_pool(NodeRole::Replica, pool).await;
        }

        let mut workers = Vec::new();
        for _ in 0..SESSIONS {
            let registry = Arc::clone(&registry);
            let holders = Arc::clone(&holders);
            workers.push(tokio::spawn(async move {
                for _ in 0..ROUNDS {
                    let pool = registry.acquire_pool(true).await;
                    let slot = if pool.name().ends_with('0') { 0 } else { 1 };

                    // exclusive hold: nobody else may have this pool out
                    assert_eq!(holders[slot].fetch_add(1, Ordering::SeqCst), 0);
                    let connection = pool.acquire().await;
                    assert_eq!(holders[slot].fetch_sub(1, Ordering::SeqCst), 1);

                    registry.release_pool(Arc::clone(&pool), true).await;
                    pool.release(connection).await;
                }
            }));
        }

        let joined = futures_join_all(workers);
        tokio::time::timeout(Duration::from_secs(10), joined)
            .await
            .expect("concurrent selection deadlocked");
    }

    async fn futures_join_all(workers: Vec<tokio::task::JoinHandle<()>>) {
        for worker in workers {
            worker.await.expect("worker panicked");
        }
    }
}
