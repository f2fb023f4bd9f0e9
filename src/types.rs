//! Core wallet data types
//!
//! Validated, explicitly tagged data types for proofs, keysets and quotes.
//! All wire-facing types derive serde; constructors validate required fields
//! so malformed mint responses fail at the boundary instead of mid-operation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{WalletError, WalletResult};

// =============================================================================
// Proof
// =============================================================================

/// An unspent token fragment: a mint-signed (amount, secret) pair.
/// Immutable once issued; owned by exactly one wallet ledger until spent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// Power-of-two denomination in sats
    pub amount: u64,
    /// Keyset that signed this proof
    #[serde(rename = "id")]
    pub keyset_id: String,
    /// Opaque secret string, unique per keyset
    pub secret: String,
    /// Unblinded mint signature (compressed point, hex)
    #[serde(rename = "C")]
    pub c: String,
    /// P2PK witness (NUT-11), attached only when spending locked proofs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub witness: Option<String>,
}

impl Proof {
    /// Construct a proof, validating required fields
    pub fn new(amount: u64, keyset_id: String, secret: String, c: String) -> WalletResult<Self> {
        if amount == 0 {
            return Err(WalletError::InvalidProof { reason: "zero amount".into() });
        }
        if secret.is_empty() {
            return Err(WalletError::InvalidProof { reason: "empty secret".into() });
        }
        // Keyset id is 1 version byte + 7 payload bytes, hex encoded
        if keyset_id.len() != 16 || hex::decode(&keyset_id).is_err() {
            return Err(WalletError::InvalidProof {
                reason: format!("bad keyset id {:?}", keyset_id),
            });
        }
        // Compressed secp256k1 point is 33 bytes
        if c.len() != 66 || hex::decode(&c).is_err() {
            return Err(WalletError::InvalidProof {
                reason: format!("bad signature point length {}", c.len()),
            });
        }
        Ok(Self { amount, keyset_id, secret, c, witness: None })
    }
}

/// Sum proof amounts with overflow protection
pub fn sum_proofs(proofs: &[Proof]) -> u64 {
    proofs.iter().map(|p| p.amount).fold(0u64, |acc, amt| acc.saturating_add(amt))
}

// =============================================================================
// Keyset
// =============================================================================

/// A mint-declared signing key bundle. Inactive keysets stay queryable so
/// restoration can scan rotated-out denominations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyset {
    pub id: String,
    pub unit: String,
    pub active: bool,
}

impl Keyset {
    /// Restoration only supports hex-identified keysets; legacy base64 ids
    /// are skipped as non-standard.
    pub fn is_hex_id(&self) -> bool {
        !self.id.is_empty() && hex::decode(&self.id).is_ok()
    }
}

/// Denomination-indexed public keys for one keyset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysetKeys {
    pub id: String,
    /// amount -> compressed pubkey hex
    pub keys: BTreeMap<u64, String>,
}

// =============================================================================
// Quotes
// =============================================================================

/// Mint quote lifecycle (incoming invoice)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MintQuoteState {
    Unpaid,
    Paid,
    Issued,
}

/// A pending request to mint new proofs against a Lightning invoice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintQuote {
    #[serde(rename = "quote")]
    pub quote_id: String,
    /// bolt11 payment request
    pub request: String,
    pub state: MintQuoteState,
    pub amount: u64,
    #[serde(default)]
    pub expiry: Option<u64>,
}

/// Melt quote lifecycle (outgoing payment)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MeltQuoteState {
    Unpaid,
    Pending,
    Paid,
}

/// A pending fee estimate / request for redeeming proofs to pay an invoice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeltQuote {
    #[serde(rename = "quote")]
    pub quote_id: String,
    pub amount: u64,
    pub fee_reserve: u64,
    pub state: MeltQuoteState,
    #[serde(default)]
    pub expiry: Option<u64>,
}

// =============================================================================
// Proof State (NUT-07)
// =============================================================================

/// Mint-reported spend state of a proof
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProofSpendState {
    Unspent,
    Pending,
    Spent,
}

/// One entry of a NUT-07 checkstate response, keyed by Y = hash_to_curve(secret)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofStateEntry {
    #[serde(rename = "Y")]
    pub y: String,
    pub state: ProofSpendState,
}

// =============================================================================
// Mint Info
// =============================================================================

/// Cached mint capability/version data (NUT-06, reduced to what the engine uses)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MintInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

// =============================================================================
// Invoice History
// =============================================================================

/// Direction of a completed Lightning-side operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceDirection {
    /// Proofs minted from a paid invoice
    In,
    /// Proofs melted to pay an invoice
    Out,
}

/// Persisted record of a settled mint/melt quote
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub quote_id: String,
    pub mint_url: String,
    pub amount: u64,
    pub direction: InvoiceDirection,
    pub created_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex_point() -> String {
        format!("02{}", "ab".repeat(32))
    }

    #[test]
    fn test_proof_validation() {
        let ok = Proof::new(8, "00ffd48b8f5ecf80".into(), "s1".into(), hex_point());
        assert!(ok.is_ok());

        assert!(Proof::new(0, "00ffd48b8f5ecf80".into(), "s1".into(), hex_point()).is_err());
        assert!(Proof::new(8, "00ffd48b8f5ecf80".into(), "".into(), hex_point()).is_err());
        assert!(Proof::new(8, "tooshort".into(), "s1".into(), hex_point()).is_err());
        assert!(Proof::new(8, "00ffd48b8f5ecf80".into(), "s1".into(), "02ab".into()).is_err());
    }

    #[test]
    fn test_sum_proofs() {
        let proofs: Vec<Proof> = [1u64, 2, 4]
            .iter()
            .map(|&a| Proof::new(a, "00ffd48b8f5ecf80".into(), format!("s{}", a), hex_point()).unwrap())
            .collect();
        assert_eq!(sum_proofs(&proofs), 7);
        assert_eq!(sum_proofs(&[]), 0);
    }

    #[test]
    fn test_keyset_hex_id() {
        let hex = Keyset { id: "00ffd48b8f5ecf80".into(), unit: "sat".into(), active: true };
        assert!(hex.is_hex_id());

        let legacy = Keyset { id: "I2yN+iRYfkzT".into(), unit: "sat".into(), active: false };
        assert!(!legacy.is_hex_id());
    }

    #[test]
    fn test_quote_state_serde() {
        let q: MintQuote = serde_json::from_str(
            r#"{"quote":"q1","request":"lnbc1...","state":"PAID","amount":100}"#,
        )
        .unwrap();
        assert_eq!(q.state, MintQuoteState::Paid);
        assert_eq!(q.expiry, None);

        let m: MeltQuote = serde_json::from_str(
            r#"{"quote":"m1","amount":600,"fee_reserve":6,"state":"UNPAID"}"#,
        )
        .unwrap();
        assert_eq!(m.state, MeltQuoteState::Unpaid);
        assert_eq!(m.fee_reserve, 6);
    }
}
