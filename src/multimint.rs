//! Multi-mint orchestrator
//!
//! Owns one wallet ledger per configured mint, an ordered mint list and a
//! selected default mint. Every per-mint operation goes through that mint's
//! `tokio::sync::Mutex`, which is what makes the single-writer-per-mint
//! rule structural: two tasks can work different mints concurrently, but a
//! mint's ledger and counter only ever see one operation at a time.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use bitcoin::bip32::Xpriv;
use tokio::sync::Mutex;

use crate::derivation::derive_pubkey;
use crate::errors::{WalletError, WalletResult};
use crate::ledger::WalletLedger;
use crate::lightning::{LightningInvoices, NotificationSink};
use crate::mint::{HttpMintClient, MintApi};
use crate::restore::{self, RestoreOptions, RestoreSummary};
use crate::spend::{self, MeltOutcome, SendLock, SyncResult};
use crate::storage::{wallet_id, KeyValueStore};
use crate::sweep::{self, SweepConfig, SweepGuard, SweepOutcome};
use crate::token::Token;
use crate::types::{InvoiceDirection, InvoiceRecord, MeltQuote, MintQuote};
use crate::utils::{mint_matches, normalize_mint_url, now_secs};

const FIELD_MINT_URLS: &str = "mint-urls";
const FIELD_SELECTED_MINT: &str = "selected-mint";
const FIELD_INVOICE_HISTORY: &str = "invoice-history";
const FIELD_COUNTER_BACKUP: &str = "counter-backup";

/// Builds a `MintApi` for a mint URL. Injected so tests can route every
/// URL at an in-process mint.
pub trait MintConnector: Send + Sync {
    fn connect(&self, mint_url: &str) -> Arc<dyn MintApi>;
}

/// Production connector: one reqwest-backed client per mint
pub struct HttpConnector;

impl MintConnector for HttpConnector {
    fn connect(&self, mint_url: &str) -> Arc<dyn MintApi> {
        Arc::new(HttpMintClient::new(mint_url))
    }
}

/// One mint's client and ledger, guarded together
struct MintWallet {
    api: Arc<dyn MintApi>,
    ledger: WalletLedger,
}

/// The wallet engine's top-level surface
pub struct MultiMintWallet {
    node_dir: String,
    store: Arc<dyn KeyValueStore>,
    xpriv: Xpriv,
    connector: Arc<dyn MintConnector>,
    /// Insertion-ordered mint URLs (normalized)
    mint_urls: Vec<String>,
    selected: Option<String>,
    wallets: HashMap<String, Arc<Mutex<MintWallet>>>,
}

impl MultiMintWallet {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        node_dir: &str,
        xpriv: Xpriv,
        connector: Arc<dyn MintConnector>,
    ) -> Self {
        Self {
            node_dir: node_dir.to_string(),
            store,
            xpriv,
            connector,
            mint_urls: Vec::new(),
            selected: None,
            wallets: HashMap::new(),
        }
    }

    /// Rebuild the mint set from persisted state. Purely local: mints are
    /// not contacted, so startup works offline with cached ledgers.
    pub async fn load(&mut self) -> WalletResult<()> {
        if let Some(bytes) = self.store.get(&self.root_key(FIELD_MINT_URLS)).await? {
            self.mint_urls = serde_json::from_slice(&bytes)
                .map_err(|e| WalletError::Storage(format!("corrupt mint list: {}", e)))?;
        }
        if let Some(bytes) = self.store.get(&self.root_key(FIELD_SELECTED_MINT)).await? {
            self.selected = Some(String::from_utf8_lossy(&bytes).into_owned());
        }

        for url in self.mint_urls.clone() {
            let api = self.connector.connect(&url);
            let mut ledger = WalletLedger::new(self.store.clone(), &self.node_dir, &url);
            ledger.load().await?;
            self.wallets.insert(url, Arc::new(Mutex::new(MintWallet { api, ledger })));
        }

        log::info!(
            "Loaded {} mints, selected {:?}",
            self.mint_urls.len(),
            self.selected
        );
        Ok(())
    }

    fn root_key(&self, field: &str) -> String {
        format!("{}-{}", self.node_dir, field)
    }

    fn backup_key(&self, mint_url: &str) -> String {
        format!("{}-{}", wallet_id(&self.node_dir, mint_url), FIELD_COUNTER_BACKUP)
    }

    pub fn mint_urls(&self) -> &[String] {
        &self.mint_urls
    }

    pub fn selected_mint(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    fn wallet(&self, mint_url: &str) -> WalletResult<Arc<Mutex<MintWallet>>> {
        let normalized = normalize_mint_url(mint_url);
        self.wallets
            .get(&normalized)
            .cloned()
            .ok_or(WalletError::MintNotFound { mint_url: normalized })
    }

    fn selected_wallet(&self) -> WalletResult<Arc<Mutex<MintWallet>>> {
        let url = self.selected.clone().ok_or(WalletError::MintNotFound {
            mint_url: "(no mint selected)".into(),
        })?;
        self.wallet(&url)
    }

    /// Refuse to start a spend-path operation against a mint flagged
    /// unreachable. The flag clears when any later call gets through
    /// (refresh, sync, restore, or the quote endpoints).
    fn ensure_connected(ledger: &WalletLedger) -> WalletResult<()> {
        if ledger.error_connecting {
            return Err(WalletError::MintUnreachable {
                mint_url: ledger.mint_url().to_string(),
                message: "mint flagged unreachable; refresh before retrying".into(),
            });
        }
        Ok(())
    }

    /// Update the ledger's connectivity flag from an operation result.
    /// A protocol error proves the mint is reachable and clears the flag.
    fn track_connection<T>(ledger: &mut WalletLedger, result: &WalletResult<T>) {
        match result {
            Err(e) if e.is_connection_error() => {
                log::warn!("Flagging mint {} unreachable", ledger.mint_url());
                ledger.error_connecting = true;
            }
            _ => ledger.error_connecting = false,
        }
    }

    async fn persist_mint_list(&self) -> WalletResult<()> {
        let bytes = serde_json::to_vec(&self.mint_urls)
            .map_err(|e| WalletError::Storage(e.to_string()))?;
        self.store.set(&self.root_key(FIELD_MINT_URLS), &bytes).await?;
        match &self.selected {
            Some(url) => {
                self.store
                    .set(&self.root_key(FIELD_SELECTED_MINT), url.as_bytes())
                    .await
            }
            None => self.store.remove(&self.root_key(FIELD_SELECTED_MINT)).await,
        }
    }

    // =========================================================================
    // Mint Management
    // =========================================================================

    /// Add a mint to the wallet. The mint is contacted to validate it
    /// speaks the protocol; an unreachable mint is not added. Re-adding a
    /// previously removed mint resumes its counter from the backup taken
    /// at removal, so derivation indices are never reissued.
    pub async fn add_mint(&mut self, mint_url: &str) -> WalletResult<()> {
        let url = normalize_mint_url(mint_url);
        if self.wallets.contains_key(&url) {
            log::debug!("Mint {} already present", url);
            return Ok(());
        }

        let api = self.connector.connect(&url);
        let info = api.get_info().await?;

        let mut ledger = WalletLedger::new(self.store.clone(), &self.node_dir, &url);
        ledger.load().await?;
        ledger.set_mint_info(info).await?;
        ledger.set_pubkey(derive_pubkey(&self.xpriv)?).await?;

        if let Some(bytes) = self.store.get(&self.backup_key(&url)).await? {
            if let Ok(backup) = String::from_utf8_lossy(&bytes).parse::<u64>() {
                log::info!("Resuming counter {} for re-added mint {}", backup, url);
                ledger.set_counter(backup).await?;
            }
        }

        self.wallets.insert(url.clone(), Arc::new(Mutex::new(MintWallet { api, ledger })));
        self.mint_urls.push(url.clone());
        if self.selected.is_none() {
            self.selected = Some(url.clone());
        }
        self.persist_mint_list().await?;
        log::info!("Added mint {}", url);
        Ok(())
    }

    /// Remove a mint. Its counter is backed up before the persisted wallet
    /// state is deleted; remaining balance on that mint is abandoned, which
    /// is why callers should sweep or transfer first.
    pub async fn remove_mint(&mut self, mint_url: &str) -> WalletResult<()> {
        let url = normalize_mint_url(mint_url);
        let wallet = self.wallet(&url)?;
        {
            let guard = wallet.lock().await;
            let counter = guard.ledger.counter();
            self.store
                .set(&self.backup_key(&url), counter.to_string().as_bytes())
                .await?;
            guard.ledger.delete_persisted().await?;
            if guard.ledger.balance() > 0 {
                log::warn!(
                    "Removing mint {} with {} sats still on it",
                    url,
                    guard.ledger.balance()
                );
            }
        }

        self.wallets.remove(&url);
        self.mint_urls.retain(|u| u != &url);
        if self.selected.as_deref() == Some(url.as_str()) {
            // Fail over to the oldest remaining mint
            self.selected = self.mint_urls.first().cloned();
            log::info!("Selected mint failover to {:?}", self.selected);
        }
        self.persist_mint_list().await?;
        log::info!("Removed mint {}", url);
        Ok(())
    }

    /// Change the default mint used by amount-only operations
    pub async fn select_mint(&mut self, mint_url: &str) -> WalletResult<()> {
        let url = normalize_mint_url(mint_url);
        if !self.wallets.contains_key(&url) {
            return Err(WalletError::MintNotFound { mint_url: url });
        }
        self.selected = Some(url);
        self.persist_mint_list().await
    }

    /// Refresh one mint's cached info. An unreachable mint flips the
    /// ledger's `error_connecting` flag instead of failing, so periodic
    /// refresh keeps working offline.
    pub async fn refresh_mint(&self, mint_url: &str) -> WalletResult<bool> {
        let wallet = self.wallet(mint_url)?;
        let mut guard = wallet.lock().await;
        let MintWallet { api, ledger } = &mut *guard;
        match api.get_info().await {
            Ok(info) => {
                ledger.set_mint_info(info).await?;
                ledger.error_connecting = false;
                Ok(true)
            }
            Err(e) => {
                log::warn!("Mint {} unreachable during refresh: {}", ledger.mint_url(), e);
                ledger.error_connecting = true;
                Ok(false)
            }
        }
    }

    // =========================================================================
    // Balances
    // =========================================================================

    /// Balance on one mint
    pub async fn balance(&self, mint_url: &str) -> WalletResult<u64> {
        let wallet = self.wallet(mint_url)?;
        let guard = wallet.lock().await;
        Ok(guard.ledger.balance())
    }

    /// Sum of balances across all mints, always re-derived from the ledgers
    pub async fn total_balance(&self) -> u64 {
        let mut total = 0u64;
        for url in &self.mint_urls {
            if let Some(wallet) = self.wallets.get(url) {
                total = total.saturating_add(wallet.lock().await.ledger.balance());
            }
        }
        total
    }

    // =========================================================================
    // Operations (routed through the per-mint lock)
    // =========================================================================

    /// Create a token from the selected mint's balance
    pub async fn send(
        &self,
        amount: u64,
        lock: Option<SendLock>,
        memo: Option<String>,
    ) -> WalletResult<Token> {
        let wallet = self.selected_wallet()?;
        let mut guard = wallet.lock().await;
        let MintWallet { api, ledger } = &mut *guard;
        Self::ensure_connected(ledger)?;
        let result = spend::send(api.as_ref(), ledger, &self.xpriv, amount, lock, memo).await;
        Self::track_connection(ledger, &result);
        result
    }

    /// Claim a token, routed to the wallet of the mint that issued it
    pub async fn receive(&self, token: &Token) -> WalletResult<u64> {
        let url = self
            .mint_urls
            .iter()
            .find(|u| mint_matches(&token.mint, u))
            .cloned()
            .ok_or_else(|| WalletError::MintNotFound {
                mint_url: normalize_mint_url(&token.mint),
            })?;
        let wallet = self.wallet(&url)?;
        let mut guard = wallet.lock().await;
        let MintWallet { api, ledger } = &mut *guard;
        Self::ensure_connected(ledger)?;
        let result = spend::receive(api.as_ref(), ledger, &self.xpriv, token).await;
        Self::track_connection(ledger, &result);
        result
    }

    /// Request a mint quote (invoice to pay) on the selected mint.
    /// A successful quote clears the unreachable flag.
    pub async fn request_mint(&self, amount: u64) -> WalletResult<MintQuote> {
        let wallet = self.selected_wallet()?;
        let mut guard = wallet.lock().await;
        let MintWallet { api, ledger } = &mut *guard;
        let result = api.create_mint_quote(amount).await;
        Self::track_connection(ledger, &result);
        result
    }

    /// Redeem a paid mint quote into the selected mint's ledger
    pub async fn redeem_mint(&self, quote: &MintQuote) -> WalletResult<u64> {
        let wallet = self.selected_wallet()?;
        let minted = {
            let mut guard = wallet.lock().await;
            let MintWallet { api, ledger } = &mut *guard;
            Self::ensure_connected(ledger)?;
            let result = spend::mint_proofs(api.as_ref(), ledger, &self.xpriv, quote).await;
            Self::track_connection(ledger, &result);
            result?
        };
        self.record_invoice(quote.quote_id.clone(), quote.amount, InvoiceDirection::In)
            .await?;
        Ok(minted)
    }

    /// Quote an outgoing Lightning payment on the selected mint
    pub async fn request_melt(&self, invoice: &str) -> WalletResult<MeltQuote> {
        let wallet = self.selected_wallet()?;
        let mut guard = wallet.lock().await;
        let MintWallet { api, ledger } = &mut *guard;
        let result = api.create_melt_quote(invoice).await;
        Self::track_connection(ledger, &result);
        result
    }

    /// Pay a quoted invoice from the selected mint's balance
    pub async fn melt(&self, quote: &MeltQuote) -> WalletResult<MeltOutcome> {
        let wallet = self.selected_wallet()?;
        let outcome = {
            let mut guard = wallet.lock().await;
            let MintWallet { api, ledger } = &mut *guard;
            Self::ensure_connected(ledger)?;
            let result = spend::melt(api.as_ref(), ledger, &self.xpriv, quote).await;
            Self::track_connection(ledger, &result);
            result?
        };
        self.record_invoice(quote.quote_id.clone(), quote.amount, InvoiceDirection::Out)
            .await?;
        Ok(outcome)
    }

    /// Reconcile one mint's local proofs against mint-reported spend state.
    /// Runs even while the mint is flagged unreachable; success clears the
    /// flag.
    pub async fn sync_mint(&self, mint_url: &str) -> WalletResult<SyncResult> {
        let wallet = self.wallet(mint_url)?;
        let mut guard = wallet.lock().await;
        let MintWallet { api, ledger } = &mut *guard;
        let result = spend::sync_with_mint(api.as_ref(), ledger).await;
        Self::track_connection(ledger, &result);
        result
    }

    /// Seed-only restoration for one mint. Not gated on the unreachable
    /// flag, so a restore can always be attempted against a flagged mint.
    pub async fn restore_mint(
        &self,
        mint_url: &str,
        options: RestoreOptions<'_>,
    ) -> WalletResult<RestoreSummary> {
        let wallet = self.wallet(mint_url)?;
        let mut guard = wallet.lock().await;
        let MintWallet { api, ledger } = &mut *guard;
        let result = restore::restore_wallet(api.as_ref(), ledger, &self.xpriv, options).await;
        Self::track_connection(ledger, &result);
        result
    }

    /// Seed-only restoration across every configured mint. Per-mint
    /// failures are collected, not fatal; cancellation is.
    pub async fn restore_all(
        &self,
        cancel: Option<&AtomicBool>,
    ) -> WalletResult<Vec<(String, WalletResult<RestoreSummary>)>> {
        let mut results = Vec::new();
        for url in &self.mint_urls {
            let outcome = self
                .restore_mint(url, RestoreOptions { cancel, on_progress: None })
                .await;
            if matches!(outcome, Err(WalletError::Cancelled)) {
                return Err(WalletError::Cancelled);
            }
            results.push((url.clone(), outcome));
        }
        Ok(results)
    }

    /// Run the sweep policy against one mint's balance
    pub async fn sweep_mint(
        &self,
        mint_url: &str,
        lightning: &dyn LightningInvoices,
        sweep_guard: &dyn SweepGuard,
        sink: &dyn NotificationSink,
        config: &SweepConfig,
    ) -> WalletResult<SweepOutcome> {
        let wallet = self.wallet(mint_url)?;
        let mut guard = wallet.lock().await;
        let MintWallet { api, ledger } = &mut *guard;
        Self::ensure_connected(ledger)?;
        let result =
            sweep::maybe_sweep(api.as_ref(), ledger, &self.xpriv, lightning, sweep_guard, sink, config)
                .await;
        Self::track_connection(ledger, &result);
        result
    }

    // =========================================================================
    // Invoice History
    // =========================================================================

    async fn record_invoice(
        &self,
        quote_id: String,
        amount: u64,
        direction: InvoiceDirection,
    ) -> WalletResult<()> {
        let mut history = self.invoice_history().await?;
        history.push(InvoiceRecord {
            quote_id,
            mint_url: self.selected.clone().unwrap_or_default(),
            amount,
            direction,
            created_at: now_secs(),
        });
        let bytes =
            serde_json::to_vec(&history).map_err(|e| WalletError::Storage(e.to_string()))?;
        self.store.set(&self.root_key(FIELD_INVOICE_HISTORY), &bytes).await
    }

    /// Settled mint/melt operations, oldest first
    pub async fn invoice_history(&self) -> WalletResult<Vec<InvoiceRecord>> {
        match self.store.get(&self.root_key(FIELD_INVOICE_HISTORY)).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| WalletError::Storage(format!("corrupt invoice history: {}", e))),
            None => Ok(Vec::new()),
        }
    }
}
