//! Token transfer envelope and P2PK lock inspection
//!
//! A token is an immutable bundle of proofs moved between wallets
//! out-of-band, serialized as `cashuA<base64url(json)>` (V3 format). The
//! `spent` flag is local bookkeeping only, never a mint-enforced property.

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::errors::{WalletError, WalletResult};
use crate::types::{sum_proofs, Proof};

const TOKEN_PREFIX: &str = "cashuA";

// =============================================================================
// Envelope
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenEntry {
    mint: String,
    proofs: Vec<Proof>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenV3 {
    token: Vec<TokenEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    memo: Option<String>,
    #[serde(default = "default_unit")]
    unit: String,
}

fn default_unit() -> String {
    "sat".to_string()
}

/// A transfer envelope: mint, proofs, optional memo
#[derive(Debug, Clone)]
pub struct Token {
    pub mint: String,
    pub proofs: Vec<Proof>,
    pub memo: Option<String>,
    pub unit: String,
    /// Local bookkeeping only: set once the receiver is known to have claimed
    pub spent: bool,
}

impl Token {
    pub fn new(mint: String, proofs: Vec<Proof>, memo: Option<String>) -> Self {
        Self { mint, proofs, memo, unit: default_unit(), spent: false }
    }

    pub fn amount(&self) -> u64 {
        sum_proofs(&self.proofs)
    }

    /// Serialize to the `cashuA...` wire form
    pub fn encode(&self) -> WalletResult<String> {
        let inner = TokenV3 {
            token: vec![TokenEntry { mint: self.mint.clone(), proofs: self.proofs.clone() }],
            memo: self.memo.clone(),
            unit: self.unit.clone(),
        };
        let json = serde_json::to_vec(&inner).map_err(|e| WalletError::Internal(e.to_string()))?;
        Ok(format!("{}{}", TOKEN_PREFIX, URL_SAFE_NO_PAD.encode(json)))
    }

    /// Parse a `cashuA...` string. Base64 padding is accepted but not required.
    pub fn decode(encoded: &str) -> WalletResult<Self> {
        let trimmed = encoded.trim();
        let body = trimmed.strip_prefix(TOKEN_PREFIX).ok_or_else(|| {
            WalletError::InvalidToken { reason: "missing cashuA prefix".into() }
        })?;

        let bytes = URL_SAFE_NO_PAD
            .decode(body)
            .or_else(|_| URL_SAFE.decode(body))
            .map_err(|e| WalletError::InvalidToken { reason: format!("base64: {}", e) })?;

        let inner: TokenV3 = serde_json::from_slice(&bytes)
            .map_err(|e| WalletError::InvalidToken { reason: format!("json: {}", e) })?;

        let entry = inner
            .token
            .into_iter()
            .next()
            .ok_or_else(|| WalletError::InvalidToken { reason: "empty token list".into() })?;
        if entry.proofs.is_empty() {
            return Err(WalletError::InvalidToken { reason: "no proofs".into() });
        }

        Ok(Self {
            mint: entry.mint,
            proofs: entry.proofs,
            memo: inner.memo,
            unit: inner.unit,
            spent: false,
        })
    }
}

// =============================================================================
// P2PK Lock Inspection (NUT-10/11 well-known secrets)
// =============================================================================

/// Lock condition extracted from a P2PK well-known secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    /// Compressed pubkey hex the proof is locked to
    pub pubkey: String,
    /// Optional unix expiry after which the lock no longer binds
    pub locktime: Option<u64>,
}

/// Build a P2PK well-known secret string.
/// The nonce is the wallet's deterministic secret for the counter position,
/// which keeps locked sends inside the normal counter discipline.
pub fn make_p2pk_secret(nonce: &str, pubkey: &str, locktime: Option<u64>) -> String {
    let mut condition = serde_json::json!({ "nonce": nonce, "data": pubkey });
    if let Some(t) = locktime {
        condition["tags"] = serde_json::json!([["locktime", t.to_string()]]);
    }
    serde_json::json!(["P2PK", condition]).to_string()
}

/// Extract the lock condition from a proof secret, if it is P2PK-shaped
pub fn parse_lock(secret: &str) -> Option<LockInfo> {
    let value: serde_json::Value = serde_json::from_str(secret).ok()?;
    let arr = value.as_array()?;
    if arr.len() != 2 || arr[0].as_str()? != "P2PK" {
        return None;
    }
    let condition = &arr[1];
    let pubkey = condition.get("data")?.as_str()?.to_string();

    let locktime = condition
        .get("tags")
        .and_then(|tags| tags.as_array())
        .and_then(|tags| {
            tags.iter().find_map(|tag| {
                let tag = tag.as_array()?;
                if tag.first()?.as_str()? == "locktime" {
                    tag.get(1)?.as_str()?.parse().ok()
                } else {
                    None
                }
            })
        });

    Some(LockInfo { pubkey, locktime })
}

/// Determine the single lock condition covering all proofs of a token.
/// Returns `None` for fully unlocked tokens; mixed locking (different
/// pubkeys, or locked mixed with unlocked) is rejected.
pub fn token_lock(proofs: &[Proof]) -> WalletResult<Option<LockInfo>> {
    let mut lock: Option<LockInfo> = None;
    for (idx, proof) in proofs.iter().enumerate() {
        let this = parse_lock(&proof.secret);
        if idx == 0 {
            lock = this;
            continue;
        }
        let consistent = match (&lock, &this) {
            (None, None) => true,
            (Some(a), Some(b)) => a.pubkey == b.pubkey && a.locktime == b.locktime,
            _ => false,
        };
        if !consistent {
            return Err(WalletError::InconsistentLocking);
        }
    }
    Ok(lock)
}
