//! Mint client: the fixed HTTP contract of the ecash protocol
//!
//! `MintApi` is the capability trait the engine is written against; the
//! reqwest-backed `HttpMintClient` is the production implementation. The
//! client is a thin RPC facade: bounded timeouts, no caching, no implicit
//! retries. Transport failure surfaces as `MintUnreachable` and is terminal
//! for that attempt.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{WalletError, WalletResult};
use crate::types::{Keyset, KeysetKeys, MeltQuote, MintInfo, MintQuote, ProofStateEntry, Proof};

/// Timeout applied to every mint call; a mint slower than this is treated
/// as unreachable rather than waited on
pub const MINT_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Wire Types
// =============================================================================

/// A blinded output submitted for signing: B_ = Y + r*G
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindedMessage {
    pub amount: u64,
    #[serde(rename = "id")]
    pub keyset_id: String,
    #[serde(rename = "B_")]
    pub blinded: String,
}

/// A blinded signature returned by the mint: C_ = k*B_
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlindSignature {
    pub amount: u64,
    #[serde(rename = "id")]
    pub keyset_id: String,
    #[serde(rename = "C_")]
    pub signature: String,
}

/// Result of a melt: settlement state plus change signatures for the unused
/// portion of the inputs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeltResult {
    pub state: crate::types::MeltQuoteState,
    #[serde(default)]
    pub change: Vec<BlindSignature>,
}

/// Response to a restore request: the subset of submitted outputs the mint
/// has signed before, with their signatures, in matching order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreResponse {
    pub outputs: Vec<BlindedMessage>,
    pub signatures: Vec<BlindSignature>,
}

// =============================================================================
// MintApi Capability
// =============================================================================

/// The mint's protocol surface. All calls are idempotent reads except
/// `swap`, `mint` and `melt`, which are idempotent only with respect to a
/// given deterministic secret set: resubmitting with a new counter is a new
/// operation, not a retry.
#[async_trait]
pub trait MintApi: Send + Sync {
    async fn get_info(&self) -> WalletResult<MintInfo>;
    async fn get_keysets(&self) -> WalletResult<Vec<Keyset>>;
    async fn get_keys(&self, keyset_id: &str) -> WalletResult<KeysetKeys>;

    async fn create_mint_quote(&self, amount: u64) -> WalletResult<MintQuote>;
    async fn check_mint_quote(&self, quote_id: &str) -> WalletResult<MintQuote>;
    /// Redeem a paid mint quote for blind signatures over `outputs`
    async fn mint(
        &self,
        quote_id: &str,
        outputs: &[BlindedMessage],
    ) -> WalletResult<Vec<BlindSignature>>;

    async fn create_melt_quote(&self, request: &str) -> WalletResult<MeltQuote>;
    async fn check_melt_quote(&self, quote_id: &str) -> WalletResult<MeltQuote>;
    /// Redeem `inputs` to settle a melt quote; `change_outputs` receive the
    /// unused input value
    async fn melt(
        &self,
        quote_id: &str,
        inputs: &[Proof],
        change_outputs: &[BlindedMessage],
    ) -> WalletResult<MeltResult>;

    /// Exchange input proofs for signatures over new blinded outputs
    async fn swap(
        &self,
        inputs: &[Proof],
        outputs: &[BlindedMessage],
    ) -> WalletResult<Vec<BlindSignature>>;

    /// NUT-07: spend state for each Y = hash_to_curve(secret)
    async fn check_state(&self, ys: &[String]) -> WalletResult<Vec<ProofStateEntry>>;

    /// NUT-09: replay signatures for previously signed outputs
    async fn restore(&self, outputs: &[BlindedMessage]) -> WalletResult<RestoreResponse>;
}

// =============================================================================
// HTTP Implementation
// =============================================================================

/// Stateless reqwest-backed mint client
pub struct HttpMintClient {
    mint_url: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct KeysetsResponse {
    keysets: Vec<Keyset>,
}

#[derive(Deserialize)]
struct KeysResponse {
    keysets: Vec<KeysetKeys>,
}

#[derive(Deserialize)]
struct SignaturesResponse {
    signatures: Vec<BlindSignature>,
}

#[derive(Deserialize)]
struct CheckStateResponse {
    states: Vec<ProofStateEntry>,
}

/// Error body shape mints return on non-2xx responses
#[derive(Deserialize)]
struct MintErrorBody {
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    code: Option<u16>,
}

impl HttpMintClient {
    pub fn new(mint_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(MINT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            mint_url: crate::utils::normalize_mint_url(mint_url),
            http,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.mint_url, path)
    }

    fn transport_err(&self, e: reqwest::Error) -> WalletError {
        WalletError::MintUnreachable {
            mint_url: self.mint_url.clone(),
            message: e.to_string(),
        }
    }

    /// Map a non-2xx response into a typed protocol error
    async fn into_protocol_err(&self, resp: reqwest::Response) -> WalletError {
        let status = resp.status();
        match resp.json::<MintErrorBody>().await {
            Ok(body) => WalletError::protocol(
                body.code.unwrap_or(u16::MAX),
                body.detail.unwrap_or_else(|| format!("HTTP {}", status)),
            ),
            Err(_) => WalletError::protocol(u16::MAX, format!("HTTP {}", status)),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> WalletResult<T> {
        let resp = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| self.transport_err(e))?;
        if !resp.status().is_success() {
            return Err(self.into_protocol_err(resp).await);
        }
        resp.json::<T>().await.map_err(|e| self.transport_err(e))
    }

    async fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> WalletResult<T> {
        let resp = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_err(e))?;
        if !resp.status().is_success() {
            return Err(self.into_protocol_err(resp).await);
        }
        resp.json::<T>().await.map_err(|e| self.transport_err(e))
    }
}

#[async_trait]
impl MintApi for HttpMintClient {
    async fn get_info(&self) -> WalletResult<MintInfo> {
        self.get_json("info").await
    }

    async fn get_keysets(&self) -> WalletResult<Vec<Keyset>> {
        let resp: KeysetsResponse = self.get_json("keysets").await?;
        Ok(resp.keysets)
    }

    async fn get_keys(&self, keyset_id: &str) -> WalletResult<KeysetKeys> {
        let resp: KeysResponse = self.get_json(&format!("keys/{}", keyset_id)).await?;
        resp.keysets
            .into_iter()
            .find(|k| k.id == keyset_id)
            .ok_or_else(|| WalletError::Internal(format!("mint returned no keys for {}", keyset_id)))
    }

    async fn create_mint_quote(&self, amount: u64) -> WalletResult<MintQuote> {
        self.post_json(
            "mint/quote/bolt11",
            &serde_json::json!({ "amount": amount, "unit": "sat" }),
        )
        .await
    }

    async fn check_mint_quote(&self, quote_id: &str) -> WalletResult<MintQuote> {
        self.get_json(&format!("mint/quote/bolt11/{}", quote_id)).await
    }

    async fn mint(
        &self,
        quote_id: &str,
        outputs: &[BlindedMessage],
    ) -> WalletResult<Vec<BlindSignature>> {
        let resp: SignaturesResponse = self
            .post_json(
                "mint/bolt11",
                &serde_json::json!({ "quote": quote_id, "outputs": outputs }),
            )
            .await?;
        Ok(resp.signatures)
    }

    async fn create_melt_quote(&self, request: &str) -> WalletResult<MeltQuote> {
        self.post_json(
            "melt/quote/bolt11",
            &serde_json::json!({ "request": request, "unit": "sat" }),
        )
        .await
    }

    async fn check_melt_quote(&self, quote_id: &str) -> WalletResult<MeltQuote> {
        self.get_json(&format!("melt/quote/bolt11/{}", quote_id)).await
    }

    async fn melt(
        &self,
        quote_id: &str,
        inputs: &[Proof],
        change_outputs: &[BlindedMessage],
    ) -> WalletResult<MeltResult> {
        self.post_json(
            "melt/bolt11",
            &serde_json::json!({
                "quote": quote_id,
                "inputs": inputs,
                "outputs": change_outputs,
            }),
        )
        .await
    }

    async fn swap(
        &self,
        inputs: &[Proof],
        outputs: &[BlindedMessage],
    ) -> WalletResult<Vec<BlindSignature>> {
        let resp: SignaturesResponse = self
            .post_json(
                "swap",
                &serde_json::json!({ "inputs": inputs, "outputs": outputs }),
            )
            .await?;
        Ok(resp.signatures)
    }

    async fn check_state(&self, ys: &[String]) -> WalletResult<Vec<ProofStateEntry>> {
        let resp: CheckStateResponse = self
            .post_json("checkstate", &serde_json::json!({ "Ys": ys }))
            .await?;
        Ok(resp.states)
    }

    async fn restore(&self, outputs: &[BlindedMessage]) -> WalletResult<RestoreResponse> {
        self.post_json("restore", &serde_json::json!({ "outputs": outputs }))
            .await
    }
}

// =============================================================================
// Test Mint
// =============================================================================

/// In-process mint double implementing the full `MintApi` contract with real
/// BDHKE signing, used by engine tests across modules.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::derivation::{hash_to_curve, parse_pubkey};
    use crate::types::{MeltQuoteState, MintQuoteState, ProofSpendState};
    use bitcoin::secp256k1::{Scalar, Secp256k1, SecretKey};
    use sha2::{Digest, Sha256};
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    pub const TEST_KEYSET: &str = "00ffd48b8f5ecf80";
    pub const TEST_KEYSET_2: &str = "00a208d6de5b1c25";

    #[derive(Default)]
    struct FakeMintState {
        /// B_ values the mint has signed, with their signatures (restore log)
        signed: HashMap<String, BlindSignature>,
        /// Ys of proofs the mint has seen spent
        spent_ys: HashSet<String>,
        mint_quotes: HashMap<String, MintQuote>,
        melt_quotes: HashMap<String, MeltQuote>,
        quote_seq: u64,
    }

    /// A mint that signs for real so unblinding round-trips, tracks signed
    /// outputs for conflict/restore semantics, and can inject failures.
    pub struct FakeMint {
        state: Mutex<FakeMintState>,
        keysets: Vec<Keyset>,
        /// Force the next N signing calls to fail with code 11009
        pub inject_conflicts: AtomicU32,
        /// Simulate transport failure on every call
        pub unreachable: std::sync::atomic::AtomicBool,
        /// Become unreachable after this many further calls (-1 = disabled)
        pub fail_after: std::sync::atomic::AtomicI32,
        /// Drop this many signatures from the next swap/mint response,
        /// simulating a mint that short-changes the wallet
        pub drop_signatures: AtomicU32,
        /// Total network calls observed
        pub calls: AtomicU32,
    }

    impl FakeMint {
        pub fn new() -> Self {
            Self::with_keysets(vec![Keyset {
                id: TEST_KEYSET.to_string(),
                unit: "sat".to_string(),
                active: true,
            }])
        }

        pub fn with_keysets(keysets: Vec<Keyset>) -> Self {
            Self {
                state: Mutex::new(FakeMintState::default()),
                keysets,
                inject_conflicts: AtomicU32::new(0),
                unreachable: std::sync::atomic::AtomicBool::new(false),
                fail_after: std::sync::atomic::AtomicI32::new(-1),
                drop_signatures: AtomicU32::new(0),
                calls: AtomicU32::new(0),
            }
        }

        /// Per-denomination mint secret key, stable per keyset
        fn amount_key(keyset_id: &str, amount: u64) -> SecretKey {
            let mut h = Sha256::new();
            h.update(b"satchel-test-mint");
            h.update(keyset_id.as_bytes());
            h.update(amount.to_le_bytes());
            SecretKey::from_slice(&h.finalize()).expect("hash is a valid scalar")
        }

        pub fn pubkey_for(keyset_id: &str, amount: u64) -> String {
            let secp = Secp256k1::new();
            let k = Self::amount_key(keyset_id, amount);
            hex::encode(bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &k).serialize())
        }

        fn sign_output(output: &BlindedMessage) -> WalletResult<BlindSignature> {
            let secp = Secp256k1::new();
            let b = parse_pubkey(&output.blinded)?;
            let k = Self::amount_key(&output.keyset_id, output.amount);
            let c = b
                .mul_tweak(&secp, &Scalar::from(k))
                .map_err(|e| WalletError::Internal(e.to_string()))?;
            Ok(BlindSignature {
                amount: output.amount,
                keyset_id: output.keyset_id.clone(),
                signature: hex::encode(c.serialize()),
            })
        }

        fn gate(&self) -> WalletResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.fail_after.load(Ordering::SeqCst);
            if remaining == 0 || self.unreachable.load(Ordering::SeqCst) {
                return Err(WalletError::MintUnreachable {
                    mint_url: "https://fake.mint".into(),
                    message: "injected".into(),
                });
            }
            if remaining > 0 {
                self.fail_after.fetch_sub(1, Ordering::SeqCst);
            }
            Ok(())
        }

        /// Sign outputs, enforcing the never-sign-twice rule (code 11009)
        fn sign_all(
            &self,
            state: &mut FakeMintState,
            outputs: &[BlindedMessage],
        ) -> WalletResult<Vec<BlindSignature>> {
            if self.inject_conflicts.load(Ordering::SeqCst) > 0 {
                self.inject_conflicts.fetch_sub(1, Ordering::SeqCst);
                return Err(WalletError::protocol(11009, "injected conflict"));
            }
            for o in outputs {
                if state.signed.contains_key(&o.blinded) {
                    return Err(WalletError::protocol(
                        11009,
                        "outputs have already been signed before",
                    ));
                }
            }
            let sigs: Vec<BlindSignature> =
                outputs.iter().map(Self::sign_output).collect::<WalletResult<_>>()?;
            for (o, s) in outputs.iter().zip(sigs.iter()) {
                state.signed.insert(o.blinded.clone(), s.clone());
            }
            Ok(sigs)
        }

        fn mark_spent(state: &mut FakeMintState, inputs: &[Proof]) -> WalletResult<()> {
            for p in inputs {
                let y = hex::encode(hash_to_curve(p.secret.as_bytes())?.serialize());
                if !state.spent_ys.insert(y) {
                    return Err(WalletError::protocol(11001, "token already spent"));
                }
            }
            Ok(())
        }

        /// Mark a mint quote as paid (simulates the invoice settling)
        pub fn settle_mint_quote(&self, quote_id: &str) {
            let mut state = self.state.lock().unwrap();
            if let Some(q) = state.mint_quotes.get_mut(quote_id) {
                q.state = MintQuoteState::Paid;
            }
        }

        /// Pre-register an output as already signed, to stage a counter
        /// conflict against a specific derivation index
        pub fn preoccupy_output(&self, output: &BlindedMessage) {
            let mut state = self.state.lock().unwrap();
            let sig = Self::sign_output(output).unwrap();
            state.signed.insert(output.blinded.clone(), sig);
        }

        /// Mark a secret's Y as spent without going through swap/melt
        pub fn mark_secret_spent(&self, secret: &str) {
            let y = hex::encode(hash_to_curve(secret.as_bytes()).unwrap().serialize());
            self.state.lock().unwrap().spent_ys.insert(y);
        }
    }

    #[async_trait]
    impl MintApi for FakeMint {
        async fn get_info(&self) -> WalletResult<MintInfo> {
            self.gate()?;
            Ok(MintInfo {
                name: Some("fake mint".into()),
                version: Some("satchel-test/0".into()),
                description: None,
            })
        }

        async fn get_keysets(&self) -> WalletResult<Vec<Keyset>> {
            self.gate()?;
            Ok(self.keysets.clone())
        }

        async fn get_keys(&self, keyset_id: &str) -> WalletResult<KeysetKeys> {
            self.gate()?;
            let mut keys = BTreeMap::new();
            for bit in 0..32 {
                let amount = 1u64 << bit;
                keys.insert(amount, Self::pubkey_for(keyset_id, amount));
            }
            Ok(KeysetKeys { id: keyset_id.to_string(), keys })
        }

        async fn create_mint_quote(&self, amount: u64) -> WalletResult<MintQuote> {
            self.gate()?;
            let mut state = self.state.lock().unwrap();
            state.quote_seq += 1;
            let quote = MintQuote {
                quote_id: format!("mq-{}", state.quote_seq),
                request: format!("lnbc{}n1fake", amount),
                state: MintQuoteState::Unpaid,
                amount,
                expiry: None,
            };
            state.mint_quotes.insert(quote.quote_id.clone(), quote.clone());
            Ok(quote)
        }

        async fn check_mint_quote(&self, quote_id: &str) -> WalletResult<MintQuote> {
            self.gate()?;
            let state = self.state.lock().unwrap();
            state
                .mint_quotes
                .get(quote_id)
                .cloned()
                .ok_or_else(|| WalletError::Internal(format!("unknown quote {}", quote_id)))
        }

        async fn mint(
            &self,
            quote_id: &str,
            outputs: &[BlindedMessage],
        ) -> WalletResult<Vec<BlindSignature>> {
            self.gate()?;
            let mut state = self.state.lock().unwrap();
            let quote = state
                .mint_quotes
                .get(quote_id)
                .cloned()
                .ok_or_else(|| WalletError::Internal(format!("unknown quote {}", quote_id)))?;
            match quote.state {
                MintQuoteState::Unpaid => {
                    return Err(WalletError::protocol(11006, "quote not paid"))
                }
                MintQuoteState::Issued => {
                    return Err(WalletError::protocol(u16::MAX, "quote already issued"))
                }
                MintQuoteState::Paid => {}
            }
            let total: u64 = outputs.iter().map(|o| o.amount).sum();
            if total != quote.amount {
                return Err(WalletError::protocol(11003, "transaction unbalanced"));
            }
            let mut sigs = self.sign_all(&mut state, outputs)?;
            state.mint_quotes.get_mut(quote_id).unwrap().state = MintQuoteState::Issued;
            for _ in 0..self.drop_signatures.swap(0, Ordering::SeqCst) {
                sigs.pop();
            }
            Ok(sigs)
        }

        async fn create_melt_quote(&self, request: &str) -> WalletResult<MeltQuote> {
            self.gate()?;
            // Parse amount out of the fake bolt11 produced by tests
            let amount: u64 = request
                .trim_start_matches("lnbc")
                .split('n')
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let mut state = self.state.lock().unwrap();
            state.quote_seq += 1;
            let quote = MeltQuote {
                quote_id: format!("lq-{}", state.quote_seq),
                amount,
                fee_reserve: (amount / 100).max(1),
                state: MeltQuoteState::Unpaid,
                expiry: None,
            };
            state.melt_quotes.insert(quote.quote_id.clone(), quote.clone());
            Ok(quote)
        }

        async fn check_melt_quote(&self, quote_id: &str) -> WalletResult<MeltQuote> {
            self.gate()?;
            let state = self.state.lock().unwrap();
            state
                .melt_quotes
                .get(quote_id)
                .cloned()
                .ok_or_else(|| WalletError::Internal(format!("unknown quote {}", quote_id)))
        }

        async fn melt(
            &self,
            quote_id: &str,
            inputs: &[Proof],
            change_outputs: &[BlindedMessage],
        ) -> WalletResult<MeltResult> {
            self.gate()?;
            let mut state = self.state.lock().unwrap();
            let quote = state
                .melt_quotes
                .get(quote_id)
                .cloned()
                .ok_or_else(|| WalletError::Internal(format!("unknown quote {}", quote_id)))?;
            let input_sum: u64 = inputs.iter().map(|p| p.amount).sum();
            if input_sum < quote.amount + quote.fee_reserve {
                return Err(WalletError::protocol(11003, "transaction unbalanced"));
            }
            let change = self.sign_all(&mut state, change_outputs)?;
            Self::mark_spent(&mut state, inputs)?;
            state.melt_quotes.get_mut(quote_id).unwrap().state = MeltQuoteState::Paid;
            Ok(MeltResult { state: MeltQuoteState::Paid, change })
        }

        async fn swap(
            &self,
            inputs: &[Proof],
            outputs: &[BlindedMessage],
        ) -> WalletResult<Vec<BlindSignature>> {
            self.gate()?;
            let mut state = self.state.lock().unwrap();
            let input_sum: u64 = inputs.iter().map(|p| p.amount).sum();
            let output_sum: u64 = outputs.iter().map(|o| o.amount).sum();
            if input_sum != output_sum {
                return Err(WalletError::protocol(11003, "transaction unbalanced"));
            }
            // Signing is checked before inputs are consumed so a conflict
            // leaves the inputs spendable, like a real mint
            let mut sigs = self.sign_all(&mut state, outputs)?;
            Self::mark_spent(&mut state, inputs)?;
            for _ in 0..self.drop_signatures.swap(0, Ordering::SeqCst) {
                sigs.pop();
            }
            Ok(sigs)
        }

        async fn check_state(&self, ys: &[String]) -> WalletResult<Vec<ProofStateEntry>> {
            self.gate()?;
            let state = self.state.lock().unwrap();
            Ok(ys
                .iter()
                .map(|y| ProofStateEntry {
                    y: y.clone(),
                    state: if state.spent_ys.contains(y) {
                        ProofSpendState::Spent
                    } else {
                        ProofSpendState::Unspent
                    },
                })
                .collect())
        }

        async fn restore(&self, outputs: &[BlindedMessage]) -> WalletResult<RestoreResponse> {
            self.gate()?;
            let state = self.state.lock().unwrap();
            let mut matched_outputs = Vec::new();
            let mut signatures = Vec::new();
            for o in outputs {
                if let Some(sig) = state.signed.get(&o.blinded) {
                    matched_outputs.push(o.clone());
                    signatures.push(sig.clone());
                }
            }
            Ok(RestoreResponse { outputs: matched_outputs, signatures })
        }
    }
}
