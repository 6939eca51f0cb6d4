use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::task::JoinSet;
use tonic::transport::{Channel, Endpoint};

use vix_core::types::UniqueId;
use vix_proto::v1::index_node_client::IndexNodeClient;
use vix_proto::v1::GetMetricsRequest;

use crate::error::CoordError;
use crate::REQ_TIMEOUT_INTERVAL;

/// One live worker: its advertised address and a shared channel to it.
#[derive(Debug, Clone)]
pub struct NodeClient {
    pub address: String,
    pub client: IndexNodeClient<Channel>,
}

/// Result of one leg of the metrics fan-out; carries either the response or
/// an error string, never both.
#[derive(Debug)]
pub struct NodeMetricsResult {
    pub node_id: UniqueId,
    pub response: Result<vix_proto::v1::GetMetricsResponse, String>,
}

/// The worker pool: client map plus the load-ordered selection heap, guarded
/// by a single RW lock.
///
/// `peek_client` returns a snapshot of the current top; the caller must
/// assume the priority can change before its RPC lands. The metadata CAS is
/// what makes assignment correct, the heap only spreads load.
#[derive(Default)]
pub struct NodeManager {
    inner: RwLock<Pool>,
}

#[derive(Default)]
struct Pool {
    clients: HashMap<UniqueId, NodeClient>,
    pq: crate::priority_queue::PriorityQueue,
}

impl NodeManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Pool> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Pool> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connects a client for the worker and inserts it at priority 0.
    /// A duplicate id is a no-op. The channel is lazy; a dead address
    /// surfaces on the first RPC, not here.
    pub fn add_node(&self, node_id: UniqueId, address: &str) -> Result<(), CoordError> {
        {
            let pool = self.read();
            if pool.clients.contains_key(&node_id) {
                return Ok(());
            }
        }

        let url = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };
        let endpoint = Endpoint::from_shared(url)
            .map_err(|e| CoordError::Transport(format!("bad worker address {address:?}: {e}")))?
            .timeout(REQ_TIMEOUT_INTERVAL);
        let channel = endpoint.connect_lazy();
        let client = IndexNodeClient::new(channel);

        let mut pool = self.write();
        if pool.clients.contains_key(&node_id) {
            return Ok(());
        }
        pool.clients.insert(
            node_id,
            NodeClient {
                address: address.to_string(),
                client,
            },
        );
        pool.pq.push(node_id);
        tracing::info!(node_id, address, "worker added");
        Ok(())
    }

    pub fn remove_node(&self, node_id: UniqueId) {
        let mut pool = self.write();
        if pool.clients.remove(&node_id).is_some() {
            pool.pq.remove(node_id);
            tracing::info!(node_id, "worker removed");
        }
    }

    pub fn node_count(&self) -> usize {
        self.read().clients.len()
    }

    /// Lowest-loaded worker and a clone of its client; `None` when the pool
    /// is empty.
    pub fn peek_client(&self) -> Option<(UniqueId, IndexNodeClient<Channel>)> {
        let pool = self.read();
        let (node_id, _) = pool.pq.peek()?;
        let client = pool.clients.get(&node_id)?.client.clone();
        Some((node_id, client))
    }

    pub fn inc_priority(&self, node_id: UniqueId, delta: i64) {
        self.write().pq.inc_priority(node_id, delta);
    }

    pub fn update_priority(&self, node_id: UniqueId, priority: i64) {
        self.write().pq.update_priority(node_id, priority);
    }

    pub fn priority(&self, node_id: UniqueId) -> Option<i64> {
        self.read().pq.priority(node_id)
    }

    /// Fans `GetMetrics` out to every live worker in parallel.
    pub async fn get_metrics(&self, request: &str) -> Vec<NodeMetricsResult> {
        let targets: Vec<(UniqueId, IndexNodeClient<Channel>)> = {
            let pool = self.read();
            pool.clients
                .iter()
                .map(|(id, nc)| (*id, nc.client.clone()))
                .collect()
        };

        let mut join_set = JoinSet::new();
        for (node_id, mut client) in targets {
            let req = GetMetricsRequest {
                request: request.to_string(),
            };
            join_set.spawn(async move {
                let response =
                    match tokio::time::timeout(REQ_TIMEOUT_INTERVAL, client.get_metrics(req))
                        .await
                    {
                        Ok(Ok(resp)) => Ok(resp.into_inner()),
                        Ok(Err(status)) => Err(status.to_string()),
                        Err(_) => Err("GetMetrics timed out".to_string()),
                    };
                NodeMetricsResult { node_id, response }
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => tracing::warn!(error = %err, "metrics fan-out task failed"),
            }
        }
        results.sort_by_key(|r| r.node_id);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_is_idempotent_and_remove_clears() {
        let mgr = NodeManager::new();
        mgr.add_node(1, "127.0.0.1:4001").unwrap();
        mgr.add_node(1, "127.0.0.1:4001").unwrap();
        assert_eq!(mgr.node_count(), 1);

        mgr.inc_priority(1, 3);
        assert_eq!(mgr.priority(1), Some(3));

        mgr.remove_node(1);
        assert_eq!(mgr.node_count(), 0);
        assert!(mgr.peek_client().is_none());
    }

    #[tokio::test]
    async fn peek_follows_priorities() {
        let mgr = NodeManager::new();
        mgr.add_node(1, "127.0.0.1:4001").unwrap();
        mgr.add_node(2, "127.0.0.1:4002").unwrap();

        assert_eq!(mgr.peek_client().map(|(id, _)| id), Some(1));
        mgr.inc_priority(1, 1);
        assert_eq!(mgr.peek_client().map(|(id, _)| id), Some(2));
        mgr.inc_priority(2, 2);
        assert_eq!(mgr.peek_client().map(|(id, _)| id), Some(1));
    }

    #[tokio::test]
    async fn bad_address_is_rejected() {
        let mgr = NodeManager::new();
        let err = mgr.add_node(1, "not a uri").unwrap_err();
        assert!(matches!(err, CoordError::Transport(_)));
    }
}
