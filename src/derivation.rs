//! Deterministic secret derivation and BDHKE blinding (NUT-00 / NUT-13)
//!
//! Pure functions only, no I/O. The same `(seed, keyset, counter)` always
//! yields the same `(secret, blinding_factor)` pair, which is what makes
//! seed-only restoration possible and what makes index reuse a privacy bug.
//!
//! Derivation scheme (v2, see DESIGN.md): everything hangs off the Cashu
//! purpose `m/129372'`. Spending secrets live on branch `0'`:
//!
//!   secret           m/129372'/0'/{keyset}'/{counter}'/0
//!   blinding factor  m/129372'/0'/{keyset}'/{counter}'/1
//!
//! The per-wallet P2PK locking key lives on its own branch `1'`
//! (`m/129372'/1'/0'`), fully disjoint from the spending counter space, so
//! no index is ever shared between the lock key and spending secrets.

use std::sync::OnceLock;

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::key::Keypair;
use bitcoin::secp256k1::{self, All, Message, PublicKey, Scalar, Secp256k1, SecretKey};
use bitcoin::Network;
use sha2::{Digest, Sha256};

use crate::errors::{WalletError, WalletResult};

/// Cashu derivation purpose (NUT-13)
const PURPOSE: u32 = 129_372;

/// NUT-00 hash_to_curve domain separator
const H2C_DOMAIN: &[u8] = b"Secp256k1_HashToCurve_Cashu_";

fn secp() -> &'static Secp256k1<All> {
    static SECP: OnceLock<Secp256k1<All>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::new)
}

fn derivation_err(e: impl std::fmt::Display) -> WalletError {
    WalletError::Derivation(e.to_string())
}

// =============================================================================
// Seed and Master Key
// =============================================================================

/// Derive the 64-byte wallet seed from a BIP-39 mnemonic (empty passphrase)
pub fn seed_from_mnemonic(mnemonic: &str) -> WalletResult<[u8; 64]> {
    let parsed = bip39::Mnemonic::parse(mnemonic).map_err(derivation_err)?;
    Ok(parsed.to_seed(""))
}

/// Build the BIP-32 master key for a seed.
/// A malformed seed length is a programmer error upstream; bip32 rejects it.
pub fn master_xpriv(seed: &[u8; 64]) -> WalletResult<Xpriv> {
    Xpriv::new_master(Network::Bitcoin, seed).map_err(derivation_err)
}

/// Map a hex keyset id onto a hardened BIP-32 child index (NUT-13)
pub fn keyset_child_index(keyset_id: &str) -> WalletResult<u32> {
    let bytes = hex::decode(keyset_id)
        .map_err(|_| WalletError::Derivation(format!("non-hex keyset id {:?}", keyset_id)))?;
    if bytes.len() != 8 {
        return Err(WalletError::Derivation(format!(
            "keyset id must be 8 bytes, got {}",
            bytes.len()
        )));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes);
    Ok((u64::from_be_bytes(buf) % ((1u64 << 31) - 1)) as u32)
}

fn spending_path(keyset_index: u32, counter: u32, leaf: u32) -> WalletResult<DerivationPath> {
    let path = vec![
        ChildNumber::from_hardened_idx(PURPOSE).map_err(derivation_err)?,
        ChildNumber::from_hardened_idx(0).map_err(derivation_err)?,
        ChildNumber::from_hardened_idx(keyset_index).map_err(derivation_err)?,
        ChildNumber::from_hardened_idx(counter).map_err(derivation_err)?,
        ChildNumber::from_normal_idx(leaf).map_err(derivation_err)?,
    ];
    Ok(DerivationPath::from(path))
}

// =============================================================================
// Deterministic Secrets
// =============================================================================

/// Derive the deterministic `(secret, blinding_factor)` pair for one counter
/// position of one keyset. Pure: same inputs, same outputs.
pub fn derive_secret(
    xpriv: &Xpriv,
    keyset_id: &str,
    counter: u32,
) -> WalletResult<(String, SecretKey)> {
    let keyset_index = keyset_child_index(keyset_id)?;

    let secret_key = xpriv
        .derive_priv(secp(), &spending_path(keyset_index, counter, 0)?)
        .map_err(derivation_err)?
        .private_key;
    let blinding = xpriv
        .derive_priv(secp(), &spending_path(keyset_index, counter, 1)?)
        .map_err(derivation_err)?
        .private_key;

    // The secret string is the hex encoding of the derived key bytes
    Ok((hex::encode(secret_key.secret_bytes()), blinding))
}

/// Derive the wallet's stable P2PK locking keypair (branch 1', index 0')
pub fn derive_lock_keypair(xpriv: &Xpriv) -> WalletResult<(SecretKey, PublicKey)> {
    let path = DerivationPath::from(vec![
        ChildNumber::from_hardened_idx(PURPOSE).map_err(derivation_err)?,
        ChildNumber::from_hardened_idx(1).map_err(derivation_err)?,
        ChildNumber::from_hardened_idx(0).map_err(derivation_err)?,
    ]);
    let sk = xpriv.derive_priv(secp(), &path).map_err(derivation_err)?.private_key;
    let pk = PublicKey::from_secret_key(secp(), &sk);
    Ok((sk, pk))
}

/// Derive the wallet's locking pubkey as compressed hex
pub fn derive_pubkey(xpriv: &Xpriv) -> WalletResult<String> {
    let (_, pk) = derive_lock_keypair(xpriv)?;
    Ok(hex::encode(pk.serialize()))
}

// =============================================================================
// BDHKE Blinding (NUT-00)
// =============================================================================

/// Hash a secret onto the curve: Y = PublicKey(0x02 || sha256(sha256(DOMAIN || x) || i))
/// for the first i that yields a valid point.
pub fn hash_to_curve(message: &[u8]) -> WalletResult<PublicKey> {
    let msg_hash: [u8; 32] = {
        let mut h = Sha256::new();
        h.update(H2C_DOMAIN);
        h.update(message);
        h.finalize().into()
    };

    for i in 0u32..65_536 {
        let mut h = Sha256::new();
        h.update(msg_hash);
        h.update(i.to_le_bytes());
        let candidate: [u8; 32] = h.finalize().into();

        let mut point = [0u8; 33];
        point[0] = 0x02;
        point[1..].copy_from_slice(&candidate);
        if let Ok(pk) = PublicKey::from_slice(&point) {
            return Ok(pk);
        }
    }
    Err(WalletError::Derivation("hash_to_curve exhausted iterations".into()))
}

/// Blind a secret for submission: B_ = Y + r*G
pub fn blind_message(secret: &str, blinding: &SecretKey) -> WalletResult<PublicKey> {
    let y = hash_to_curve(secret.as_bytes())?;
    let r_point = PublicKey::from_secret_key(secp(), blinding);
    y.combine(&r_point).map_err(derivation_err)
}

/// Unblind a mint signature: C = C_ - r*K, where K is the mint key for the amount
pub fn unblind_signature(
    c_blinded: &PublicKey,
    blinding: &SecretKey,
    mint_key: &PublicKey,
) -> WalletResult<PublicKey> {
    let r_times_k = mint_key
        .mul_tweak(secp(), &Scalar::from(*blinding))
        .map_err(derivation_err)?
        .negate(secp());
    c_blinded.combine(&r_times_k).map_err(derivation_err)
}

// =============================================================================
// P2PK Witness (NUT-11)
// =============================================================================

/// Sign a proof secret with the wallet's lock key, producing the witness JSON
pub fn sign_p2pk_witness(secret: &str, lock_key: &SecretKey) -> WalletResult<String> {
    let digest: [u8; 32] = Sha256::digest(secret.as_bytes()).into();
    let keypair = Keypair::from_secret_key(secp(), lock_key);
    let sig = secp().sign_schnorr_no_aux_rand(&Message::from_digest(digest), &keypair);
    serde_json::to_string(&serde_json::json!({ "signatures": [sig.to_string()] }))
        .map_err(|e| WalletError::Internal(e.to_string()))
}

/// Parse a compressed pubkey from hex
pub fn parse_pubkey(hex_key: &str) -> WalletResult<PublicKey> {
    let bytes = hex::decode(hex_key)
        .map_err(|_| WalletError::Derivation(format!("non-hex pubkey {:?}", hex_key)))?;
    PublicKey::from_slice(&bytes).map_err(derivation_err)
}

/// Multiply a secret key by G, returning the compressed pubkey
pub fn pubkey_of(sk: &SecretKey) -> PublicKey {
    PublicKey::from_secret_key(secp(), sk)
}
