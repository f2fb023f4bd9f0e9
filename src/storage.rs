//! Secure key-value storage capability
//!
//! The engine persists through this narrow contract only; the host app
//! supplies the real encrypted backend. Keys are namespaced per mint as
//! `{wallet_id}-{field}` with `wallet_id = {node_dir}=={mint_url}`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::errors::WalletResult;

/// Narrow storage contract consumed by the wallet ledger
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> WalletResult<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: &[u8]) -> WalletResult<()>;
    async fn remove(&self, key: &str) -> WalletResult<()>;
}

/// Build the per-mint wallet id used to namespace storage keys
pub fn wallet_id(node_dir: &str, mint_url: &str) -> String {
    format!("{}=={}", node_dir, mint_url)
}

/// Build a namespaced storage key for one field of one wallet
pub fn storage_key(wallet_id: &str, field: &str) -> String {
    format!("{}-{}", wallet_id, field)
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// In-memory store, used in tests and as a scratch backend
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of stored keys (test observability)
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> WalletResult<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> WalletResult<()> {
        self.entries.write().await.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn remove(&self, key: &str) -> WalletResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
