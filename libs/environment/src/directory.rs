//! Directory of running environments, keyed by pool id.

use std::collections::HashMap;
use std::sync::Arc;

use cloudpool_id::PoolId;
use tokio::sync::RwLock;

use crate::environment::CloudEnvironment;

#[derive(Debug, Default)]
pub struct Directory {
    environments: RwLock<HashMap<PoolId, Arc<CloudEnvironment>>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an environment, replacing any previous one with the same id.
    pub async fn insert(&self, environment: Arc<CloudEnvironment>) -> Option<Arc<CloudEnvironment>> {
        let mut environments = self.environments.write().await;
        environments.insert(environment.id().clone(), environment)
    }

    pub async fn get(&self, pool_id: &PoolId) -> Option<Arc<CloudEnvironment>> {
        self.environments.read().await.get(pool_id).cloned()
    }

    pub async fn remove(&self, pool_id: &PoolId) -> Option<Arc<CloudEnvironment>> {
        self.environments.write().await.remove(pool_id)
    }

    /// Registered pool ids, sorted.
    pub async fn ids(&self) -> Vec<PoolId> {
        let mut ids: Vec<PoolId> = self.environments.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
