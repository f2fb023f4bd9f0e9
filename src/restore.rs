//! Seed-only wallet restoration (NUT-09 / NUT-13)
//!
//! Re-derives blinded outputs for ascending counter windows, asks the mint
//! to replay any signatures it issued for them, and stops once a gap of
//! consecutive silent windows says the counter space is exhausted. Only
//! plain deterministic secrets are recoverable; locked sends belong to the
//! recipient and never come back through this path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use bitcoin::bip32::Xpriv;
use bitcoin::secp256k1::SecretKey;

use crate::derivation::{blind_message, derive_secret, hash_to_curve, parse_pubkey, unblind_signature};
use crate::errors::{WalletError, WalletResult};
use crate::ledger::WalletLedger;
use crate::mint::{BlindedMessage, MintApi};
use crate::types::{KeysetKeys, Proof, ProofSpendState};

/// Counter window requested from the mint per restore round
pub const RESTORE_BATCH_SIZE: u64 = 100;

/// Consecutive empty windows after which a keyset is considered exhausted
pub const GAP_LIMIT: u32 = 3;

/// State-check sub-batch size for filtering restored proofs
const CHECK_BATCH_SIZE: usize = 100;

/// Progress report emitted after each restore round
#[derive(Debug, Clone)]
pub struct RestoreProgress {
    pub keyset_id: String,
    /// Position of this keyset in the run, starting at 0
    pub keyset_index: usize,
    /// Total hex keysets the run will scan
    pub keyset_total: usize,
    /// First counter of the next window to be scanned
    pub next_start: u64,
    /// Signatures recovered so far for this keyset
    pub found: usize,
}

impl RestoreProgress {
    /// Whole-run completion estimate. Keysets scan an open-ended counter
    /// space, so only completed keysets count toward the percentage.
    pub fn percent(&self) -> u8 {
        ((self.keyset_index * 100) / self.keyset_total.max(1)) as u8
    }
}

/// Knobs for a restore run. All optional; `Default` scans everything.
#[derive(Default)]
pub struct RestoreOptions<'a> {
    /// Cooperative cancellation flag, polled between windows
    pub cancel: Option<&'a AtomicBool>,
    /// Progress callback, invoked after each window
    pub on_progress: Option<Box<dyn FnMut(RestoreProgress) + Send + 'a>>,
}

/// Totals for a completed restore run
#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreSummary {
    pub keysets_scanned: usize,
    pub keysets_failed: usize,
    /// Signatures the mint replayed
    pub proofs_found: usize,
    /// Proofs still unspent after state filtering
    pub proofs_restored: usize,
    pub sats_restored: u64,
}

/// One recovered (counter, proof) pair prior to state filtering
struct FoundProof {
    counter: u64,
    proof: Proof,
}

/// Restore the wallet's proofs for every hex keyset the mint has ever used.
/// A per-keyset failure is logged and skipped so one retired keyset cannot
/// sink the run; an unreachable mint aborts it, since every remaining
/// keyset would fail the same way.
pub async fn restore_wallet(
    api: &dyn MintApi,
    ledger: &mut WalletLedger,
    xpriv: &Xpriv,
    mut options: RestoreOptions<'_>,
) -> WalletResult<RestoreSummary> {
    let keysets = api.get_keysets().await?;
    let hex_keysets: Vec<_> = keysets.iter().filter(|k| k.is_hex_id()).collect();
    let keyset_total = hex_keysets.len();
    let mut summary = RestoreSummary::default();
    let mut highest_counter: Option<u64> = None;

    for (keyset_index, keyset) in hex_keysets.into_iter().enumerate() {
        check_cancelled(options.cancel)?;

        let scanned = match scan_keyset(
            api,
            xpriv,
            &keyset.id,
            (keyset_index, keyset_total),
            &mut options,
        )
        .await
        {
            Ok(found) => found,
            Err(e @ WalletError::MintUnreachable { .. }) => return Err(e),
            Err(e @ WalletError::Cancelled) => return Err(e),
            Err(e) => {
                log::warn!("Restore skipping keyset {}: {}", keyset.id, e);
                summary.keysets_failed += 1;
                continue;
            }
        };
        summary.keysets_scanned += 1;
        summary.proofs_found += scanned.len();

        if let Some(max_counter) = scanned.iter().map(|f| f.counter).max() {
            highest_counter = Some(highest_counter.unwrap_or(0).max(max_counter));
        }

        let unspent = filter_unspent(api, scanned).await?;
        summary.proofs_restored += unspent.len();
        summary.sats_restored += unspent.iter().map(|p| p.amount).sum::<u64>();
        ledger.add_proofs(unspent).await?;
    }

    // The counter must clear every index the mint has seen, and must never
    // move backward past indices a concurrent operation already consumed
    if let Some(max_counter) = highest_counter {
        ledger.set_counter(ledger.counter().max(max_counter + 1)).await?;
    }

    log::info!(
        "Restore for {}: {} keysets, {} found, {} unspent ({} sats), counter {}",
        ledger.mint_url(),
        summary.keysets_scanned,
        summary.proofs_found,
        summary.proofs_restored,
        summary.sats_restored,
        ledger.counter()
    );
    Ok(summary)
}

fn check_cancelled(cancel: Option<&AtomicBool>) -> WalletResult<()> {
    match cancel {
        Some(flag) if flag.load(Ordering::SeqCst) => Err(WalletError::Cancelled),
        _ => Ok(()),
    }
}

/// Scan one keyset's counter space window by window until the gap limit
async fn scan_keyset(
    api: &dyn MintApi,
    xpriv: &Xpriv,
    keyset_id: &str,
    (keyset_index, keyset_total): (usize, usize),
    options: &mut RestoreOptions<'_>,
) -> WalletResult<Vec<FoundProof>> {
    let keys = api.get_keys(keyset_id).await?;

    let mut found: Vec<FoundProof> = Vec::new();
    let mut start = 0u64;
    let mut empty_windows = 0u32;

    while empty_windows < GAP_LIMIT {
        check_cancelled(options.cancel)?;

        let window = derive_window(xpriv, keyset_id, start)?;
        let outputs: Vec<BlindedMessage> = window
            .iter()
            .map(|d| BlindedMessage {
                amount: 0,
                keyset_id: keyset_id.to_string(),
                blinded: d.blinded_hex.clone(),
            })
            .collect();

        let response = api.restore(&outputs).await?;
        if response.signatures.is_empty() {
            empty_windows += 1;
            log::debug!(
                "Restore window [{}, {}) of {} empty ({}/{})",
                start,
                start + RESTORE_BATCH_SIZE,
                keyset_id,
                empty_windows,
                GAP_LIMIT
            );
        } else {
            empty_windows = 0;
            let by_blinded: HashMap<&str, &Derived> =
                window.iter().map(|d| (d.blinded_hex.as_str(), d)).collect();

            for (output, sig) in response.outputs.iter().zip(response.signatures.iter()) {
                let derived = by_blinded.get(output.blinded.as_str()).ok_or_else(|| {
                    WalletError::Internal("mint replayed an output it was never asked about".into())
                })?;
                found.push(FoundProof {
                    counter: derived.counter,
                    proof: unblind_restored(derived, sig, &keys)?,
                });
            }
            log::debug!(
                "Restore window [{}, {}) of {}: {} signatures",
                start,
                start + RESTORE_BATCH_SIZE,
                keyset_id,
                response.signatures.len()
            );
        }

        start += RESTORE_BATCH_SIZE;
        if let Some(cb) = options.on_progress.as_mut() {
            cb(RestoreProgress {
                keyset_id: keyset_id.to_string(),
                keyset_index,
                keyset_total,
                next_start: start,
                found: found.len(),
            });
        }
    }

    Ok(found)
}

/// Derivation material for one counter position
struct Derived {
    counter: u64,
    secret: String,
    blinding: SecretKey,
    blinded_hex: String,
}

fn derive_window(xpriv: &Xpriv, keyset_id: &str, start: u64) -> WalletResult<Vec<Derived>> {
    let mut window = Vec::with_capacity(RESTORE_BATCH_SIZE as usize);
    for counter in start..start + RESTORE_BATCH_SIZE {
        let index = u32::try_from(counter)
            .ok()
            .filter(|c| *c < (1 << 31))
            .ok_or_else(|| {
                WalletError::Derivation(format!("restore counter {} exceeds derivation space", counter))
            })?;
        let (secret, blinding) = derive_secret(xpriv, keyset_id, index)?;
        let blinded = blind_message(&secret, &blinding)?;
        window.push(Derived {
            counter,
            secret,
            blinding,
            blinded_hex: hex::encode(blinded.serialize()),
        });
    }
    Ok(window)
}

fn unblind_restored(
    derived: &Derived,
    sig: &crate::mint::BlindSignature,
    keys: &KeysetKeys,
) -> WalletResult<Proof> {
    let mint_key_hex = keys.keys.get(&sig.amount).ok_or_else(|| {
        WalletError::Internal(format!("mint has no key for amount {}", sig.amount))
    })?;
    let mint_key = parse_pubkey(mint_key_hex)?;
    let c_blinded = parse_pubkey(&sig.signature)?;
    let c = unblind_signature(&c_blinded, &derived.blinding, &mint_key)?;
    Proof::new(
        sig.amount,
        sig.keyset_id.clone(),
        derived.secret.clone(),
        hex::encode(c.serialize()),
    )
}

/// Drop restored proofs the mint reports as spent or pending; only
/// provably spendable value goes back into the ledger
async fn filter_unspent(
    api: &dyn MintApi,
    found: Vec<FoundProof>,
) -> WalletResult<Vec<Proof>> {
    let mut unspent = Vec::new();
    for batch in found.chunks(CHECK_BATCH_SIZE) {
        let ys: Vec<String> = batch
            .iter()
            .map(|f| Ok(hex::encode(hash_to_curve(f.proof.secret.as_bytes())?.serialize())))
            .collect::<WalletResult<_>>()?;
        let states = api.check_state(&ys).await?;
        for (f, state) in batch.iter().zip(states.iter()) {
            if state.state == ProofSpendState::Unspent {
                unspent.push(f.proof.clone());
            }
        }
    }
    Ok(unspent)
}
