use tokio::sync::RwLock;

use super::{delegate_store, Tables};
use crate::error::VpnResult;
use crate::model::{Peer, PeerFilter, Protocol, ProtocolAccess, ProtocolConfig, VpnUser};

/// Volatile store, state is lost when dropped
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let tables = self.tables.read().await;
        f(&tables)
    }

    async fn mutate<T>(&self, f: impl FnOnce(&mut Tables) -> VpnResult<T>) -> VpnResult<T> {
        let mut tables = self.tables.write().await;
        f(&mut tables)
    }
}

delegate_store!(MemoryStore);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures;

    #[tokio::test]
    async fn test_memory_store_contract() {
        let store = MemoryStore::new();
        fixtures::exercise_contract(&store).await;
    }
}
