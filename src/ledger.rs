//! Wallet ledger: the single authority for what one mint's wallet owns
//!
//! Per-mint record of proofs, the derivation counter and cached mint
//! metadata. Every mutation persists to storage before the in-memory state
//! is committed, so a crash between the two can lose at most an uncommitted
//! write, never desync the pair. The counter is monotonic and is never
//! stepped backward by any path in this module.

use std::sync::Arc;

use crate::errors::{WalletError, WalletResult};
use crate::storage::{storage_key, wallet_id, KeyValueStore};
use crate::types::{sum_proofs, MintInfo, Proof};
use crate::utils::normalize_mint_url;

const FIELD_PROOFS: &str = "proofs";
const FIELD_COUNTER: &str = "counter";
const FIELD_PUBKEY: &str = "pubkey";
const FIELD_MINT_INFO: &str = "mint-info";

/// Per-mint wallet ledger
pub struct WalletLedger {
    mint_url: String,
    wallet_id: String,
    store: Arc<dyn KeyValueStore>,
    proofs: Vec<Proof>,
    counter: u64,
    pubkey: Option<String>,
    mint_info: Option<MintInfo>,
    /// Set when the last mint contact failed; dependent operations
    /// short-circuit until a future call succeeds
    pub error_connecting: bool,
}

impl WalletLedger {
    pub fn new(store: Arc<dyn KeyValueStore>, node_dir: &str, mint_url: &str) -> Self {
        let mint_url = normalize_mint_url(mint_url);
        let wallet_id = wallet_id(node_dir, &mint_url);
        Self {
            mint_url,
            wallet_id,
            store,
            proofs: Vec::new(),
            counter: 0,
            pubkey: None,
            mint_info: None,
            error_connecting: false,
        }
    }

    /// Load persisted state into memory, tolerating absent keys (first run)
    pub async fn load(&mut self) -> WalletResult<()> {
        if let Some(bytes) = self.store.get(&self.key(FIELD_PROOFS)).await? {
            self.proofs = serde_json::from_slice(&bytes)
                .map_err(|e| WalletError::Storage(format!("corrupt proof set: {}", e)))?;
        }
        if let Some(bytes) = self.store.get(&self.key(FIELD_COUNTER)).await? {
            let text = String::from_utf8_lossy(&bytes);
            self.counter = text
                .parse()
                .map_err(|e| WalletError::Storage(format!("corrupt counter {:?}: {}", text, e)))?;
        }
        if let Some(bytes) = self.store.get(&self.key(FIELD_PUBKEY)).await? {
            self.pubkey = Some(String::from_utf8_lossy(&bytes).into_owned());
        }
        if let Some(bytes) = self.store.get(&self.key(FIELD_MINT_INFO)).await? {
            self.mint_info = serde_json::from_slice(&bytes).ok();
        }
        log::debug!(
            "Loaded ledger for {}: {} proofs ({} sats), counter {}",
            self.mint_url,
            self.proofs.len(),
            self.balance(),
            self.counter
        );
        Ok(())
    }

    fn key(&self, field: &str) -> String {
        storage_key(&self.wallet_id, field)
    }

    pub fn mint_url(&self) -> &str {
        &self.mint_url
    }

    pub fn proofs(&self) -> &[Proof] {
        &self.proofs
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn pubkey(&self) -> Option<&str> {
        self.pubkey.as_deref()
    }

    pub fn mint_info(&self) -> Option<&MintInfo> {
        self.mint_info.as_ref()
    }

    /// Balance is always a re-sum over owned proofs, never an independently
    /// maintained counter
    pub fn balance(&self) -> u64 {
        sum_proofs(&self.proofs)
    }

    // =========================================================================
    // Mutations (storage-first commit order)
    // =========================================================================

    /// Add proofs to the ledger. Proofs whose secret already exists are
    /// skipped: no two proofs in a ledger may share a secret.
    pub async fn add_proofs(&mut self, incoming: Vec<Proof>) -> WalletResult<()> {
        if incoming.is_empty() {
            return Ok(());
        }

        let mut next = self.proofs.clone();
        let mut added = 0usize;
        for proof in incoming {
            if next.iter().any(|p| p.secret == proof.secret) {
                log::warn!(
                    "Skipping duplicate proof secret for mint {} ({} sats)",
                    self.mint_url,
                    proof.amount
                );
                continue;
            }
            next.push(proof);
            added += 1;
        }

        self.persist_proofs(&next).await?;
        self.proofs = next;
        log::debug!(
            "Added {} proofs to {}, balance now {} sats",
            added,
            self.mint_url,
            self.balance()
        );
        self.check_invariant();
        Ok(())
    }

    /// Remove proofs by structural equality on the secret. Absent entries
    /// are silently ignored so idempotent cleanup paths stay cheap.
    pub async fn remove_proofs(&mut self, outgoing: &[Proof]) -> WalletResult<()> {
        if outgoing.is_empty() {
            return Ok(());
        }

        let next: Vec<Proof> = self
            .proofs
            .iter()
            .filter(|p| !outgoing.iter().any(|o| o.secret == p.secret))
            .cloned()
            .collect();

        let removed = self.proofs.len() - next.len();
        self.persist_proofs(&next).await?;
        self.proofs = next;
        log::debug!(
            "Removed {} proofs from {}, balance now {} sats",
            removed,
            self.mint_url,
            self.balance()
        );
        self.check_invariant();
        Ok(())
    }

    /// Advance the derivation counter. Persisted before the in-memory
    /// commit; a lower value than the current counter is ignored, the
    /// counter never moves backward.
    pub async fn set_counter(&mut self, counter: u64) -> WalletResult<()> {
        if counter <= self.counter {
            if counter < self.counter {
                log::warn!(
                    "Refusing to move counter backward for {} ({} -> {})",
                    self.mint_url,
                    self.counter,
                    counter
                );
            }
            return Ok(());
        }
        self.store
            .set(&self.key(FIELD_COUNTER), counter.to_string().as_bytes())
            .await?;
        self.counter = counter;
        log::debug!("Counter for {} advanced to {}", self.mint_url, counter);
        Ok(())
    }

    /// Cache the wallet's derived locking pubkey (derived once per mint)
    pub async fn set_pubkey(&mut self, pubkey: String) -> WalletResult<()> {
        self.store.set(&self.key(FIELD_PUBKEY), pubkey.as_bytes()).await?;
        self.pubkey = Some(pubkey);
        Ok(())
    }

    /// Cache mint capability/version data
    pub async fn set_mint_info(&mut self, info: MintInfo) -> WalletResult<()> {
        let bytes = serde_json::to_vec(&info).map_err(|e| WalletError::Storage(e.to_string()))?;
        self.store.set(&self.key(FIELD_MINT_INFO), &bytes).await?;
        self.mint_info = Some(info);
        Ok(())
    }

    /// Delete all persisted keys for this wallet (mint removal)
    pub async fn delete_persisted(&self) -> WalletResult<()> {
        for field in [FIELD_PROOFS, FIELD_COUNTER, FIELD_PUBKEY, FIELD_MINT_INFO] {
            self.store.remove(&self.key(field)).await?;
        }
        log::info!("Deleted persisted wallet state for {}", self.mint_url);
        Ok(())
    }

    async fn persist_proofs(&self, proofs: &[Proof]) -> WalletResult<()> {
        let bytes =
            serde_json::to_vec(proofs).map_err(|e| WalletError::Storage(e.to_string()))?;
        self.store.set(&self.key(FIELD_PROOFS), &bytes).await
    }

    /// The balance invariant holds by construction after every mutation;
    /// a violation here is a logic error, not a recoverable condition.
    fn check_invariant(&self) {
        debug_assert_eq!(self.balance(), sum_proofs(&self.proofs));
        let mut secrets: Vec<&str> = self.proofs.iter().map(|p| p.secret.as_str()).collect();
        secrets.sort_unstable();
        secrets.dedup();
        debug_assert_eq!(secrets.len(), self.proofs.len(), "duplicate proof secret in ledger");
    }
}
