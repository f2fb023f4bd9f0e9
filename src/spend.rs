//! Proof selection and spend engine
//!
//! Everything that consumes proofs funnels through one pattern:
//! select inputs, derive fresh outputs at the ledger's counter, submit,
//! retry with a bumped counter on an index conflict, then commit with the
//! counter persisted before any proof removal. Send, receive, mint-redeem
//! and melt all share the same `with_derivation_attempts` primitive so no
//! call site can drift from the retry discipline.

use bitcoin::bip32::Xpriv;
use bitcoin::secp256k1::SecretKey;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::derivation::{
    blind_message, derive_lock_keypair, derive_pubkey, derive_secret, hash_to_curve,
    sign_p2pk_witness, unblind_signature,
};
use crate::errors::{WalletError, WalletResult};
use crate::ledger::WalletLedger;
use crate::mint::{BlindSignature, BlindedMessage, MintApi};
use crate::token::{make_p2pk_secret, token_lock, Token};
use crate::types::{
    sum_proofs, KeysetKeys, MeltQuote, MeltQuoteState, MintQuote, MintQuoteState, Proof,
    ProofSpendState,
};
use crate::utils::{mint_matches, now_secs, split_amount};

/// Hard cap on counter-conflict retries before surfacing `SpendExhausted`
pub const MAX_DERIVATION_ATTEMPTS: u32 = 100;

/// Batch size for NUT-07 state sync of the local proof set
pub const MAX_SYNC_INPUT_SIZE: usize = 200;

// =============================================================================
// Coin Selection
// =============================================================================

/// Order in which available proofs are accumulated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionOrder {
    /// Largest denominations first (default): fewest inputs
    #[default]
    LargestFirst,
    /// Smallest first: sweeps dust
    SmallestFirst,
}

/// A partition of the available proofs into inputs and untouched remainder
#[derive(Debug, Clone)]
pub struct Selection {
    pub to_send: Vec<Proof>,
    pub to_keep: Vec<Proof>,
}

/// Greedy coin selection: accumulate sorted proofs until the running sum
/// reaches the target. Correctness over optimality; over-collection is
/// resolved by the swap's change outputs, not re-optimized here.
pub fn select_proofs(
    available: &[Proof],
    target: u64,
    order: SelectionOrder,
) -> WalletResult<Selection> {
    let total = sum_proofs(available);
    if total < target {
        return Err(WalletError::InsufficientFunds { available: total, required: target });
    }

    let mut sorted: Vec<Proof> = available.to_vec();
    match order {
        SelectionOrder::LargestFirst => sorted.sort_by(|a, b| b.amount.cmp(&a.amount)),
        SelectionOrder::SmallestFirst => sorted.sort_by(|a, b| a.amount.cmp(&b.amount)),
    }

    let mut to_send = Vec::new();
    let mut running = 0u64;
    let mut rest = Vec::new();
    for proof in sorted {
        if running < target {
            running = running.saturating_add(proof.amount);
            to_send.push(proof);
        } else {
            rest.push(proof);
        }
    }

    Ok(Selection { to_send, to_keep: rest })
}

// =============================================================================
// Optimistic Derivation Attempts
// =============================================================================

/// Run one derivation-consuming operation with optimistic-concurrency retry
/// over the base counter. The closure receives the base counter to derive
/// from and returns the operation value plus the number of indices it
/// consumed. Only counter-conflict errors are retried; everything else
/// propagates untouched. Returns the value and the new ledger counter.
pub(crate) async fn with_derivation_attempts<'a, T>(
    base_counter: u64,
    mut attempt: impl FnMut(u64) -> BoxFuture<'a, WalletResult<(T, u64)>> + 'a,
) -> WalletResult<(T, u64)> {
    for n in 0..MAX_DERIVATION_ATTEMPTS {
        let base = base_counter + u64::from(n);
        match attempt(base).await {
            Ok((value, consumed)) => {
                if n > 0 {
                    log::info!("Derivation conflict resolved after {} retries", n);
                }
                return Ok((value, base + consumed));
            }
            Err(e) if e.is_counter_conflict() => {
                log::debug!("Counter conflict at base {}, retrying with fresh base", base);
            }
            Err(e) => return Err(e),
        }
    }
    Err(WalletError::SpendExhausted { attempts: MAX_DERIVATION_ATTEMPTS })
}

// =============================================================================
// Output Planning
// =============================================================================

/// Optional P2PK lock applied to the sent half of a swap
#[derive(Debug, Clone)]
pub struct SendLock {
    /// Compressed recipient pubkey, hex
    pub pubkey: String,
    /// Optional unix time after which the lock stops binding
    pub locktime: Option<u64>,
}

/// Blinded outputs with the derivation material needed to unblind them
pub(crate) struct PlannedOutputs {
    pub outputs: Vec<BlindedMessage>,
    secrets: Vec<String>,
    blindings: Vec<SecretKey>,
}

fn child_index(counter: u64) -> WalletResult<u32> {
    u32::try_from(counter)
        .ok()
        .filter(|c| *c < (1 << 31))
        .ok_or_else(|| WalletError::Derivation(format!("counter {} exceeds derivation space", counter)))
}

/// Derive blinded outputs for `amounts` at counters `[base, base + n)`.
/// The first `locked_prefix` outputs are wrapped in a P2PK well-known
/// secret when `lock` is given; the derived hex secret becomes its nonce so
/// locked sends stay inside the normal counter discipline.
pub(crate) fn plan_outputs(
    xpriv: &Xpriv,
    keyset_id: &str,
    base_counter: u64,
    amounts: &[u64],
    lock: Option<&SendLock>,
    locked_prefix: usize,
) -> WalletResult<PlannedOutputs> {
    let mut outputs = Vec::with_capacity(amounts.len());
    let mut secrets = Vec::with_capacity(amounts.len());
    let mut blindings = Vec::with_capacity(amounts.len());

    for (i, &amount) in amounts.iter().enumerate() {
        let counter = child_index(base_counter + i as u64)?;
        let (hex_secret, blinding) = derive_secret(xpriv, keyset_id, counter)?;
        let secret = match lock {
            Some(lock) if i < locked_prefix => {
                make_p2pk_secret(&hex_secret, &lock.pubkey, lock.locktime)
            }
            _ => hex_secret,
        };
        let blinded = blind_message(&secret, &blinding)?;
        outputs.push(BlindedMessage {
            amount,
            keyset_id: keyset_id.to_string(),
            blinded: hex::encode(blinded.serialize()),
        });
        secrets.push(secret);
        blindings.push(blinding);
    }

    Ok(PlannedOutputs { outputs, secrets, blindings })
}

/// Unblind mint signatures into proofs. Swap and mint responses must
/// answer every submitted output; a short signature list here means the
/// mint is short-changing the wallet and the operation is not committed.
pub(crate) fn assemble_proofs(
    planned: &PlannedOutputs,
    signatures: &[BlindSignature],
    keys: &KeysetKeys,
) -> WalletResult<Vec<Proof>> {
    if signatures.len() != planned.outputs.len() {
        return Err(WalletError::Internal(format!(
            "mint returned {} signatures for {} outputs",
            signatures.len(),
            planned.outputs.len()
        )));
    }
    unblind_all(planned, signatures, keys)
}

/// Melt change pairing: the mint owes at most one signature per change
/// output and may legitimately return fewer; pairing is positional over
/// the returned prefix.
pub(crate) fn assemble_change_proofs(
    planned: &PlannedOutputs,
    signatures: &[BlindSignature],
    keys: &KeysetKeys,
) -> WalletResult<Vec<Proof>> {
    if signatures.len() > planned.outputs.len() {
        return Err(WalletError::Internal(format!(
            "mint returned {} change signatures for {} outputs",
            signatures.len(),
            planned.outputs.len()
        )));
    }
    unblind_all(planned, signatures, keys)
}

fn unblind_all(
    planned: &PlannedOutputs,
    signatures: &[BlindSignature],
    keys: &KeysetKeys,
) -> WalletResult<Vec<Proof>> {
    let mut proofs = Vec::with_capacity(signatures.len());
    for (i, sig) in signatures.iter().enumerate() {
        let mint_key_hex = keys.keys.get(&sig.amount).ok_or_else(|| {
            WalletError::Internal(format!("mint has no key for amount {}", sig.amount))
        })?;
        let mint_key = crate::derivation::parse_pubkey(mint_key_hex)?;
        let c_blinded = crate::derivation::parse_pubkey(&sig.signature)?;
        let c = unblind_signature(&c_blinded, &planned.blindings[i], &mint_key)?;
        proofs.push(Proof::new(
            sig.amount,
            sig.keyset_id.clone(),
            planned.secrets[i].clone(),
            hex::encode(c.serialize()),
        )?);
    }
    Ok(proofs)
}

/// Resolve the mint's active sat keyset and fetch its keys
pub(crate) async fn active_keyset(api: &dyn MintApi) -> WalletResult<KeysetKeys> {
    let keysets = api.get_keysets().await?;
    let active = keysets
        .iter()
        .find(|k| k.active && k.unit == "sat" && k.is_hex_id())
        .ok_or_else(|| WalletError::Internal("mint has no active sat keyset".into()))?;
    api.get_keys(&active.id).await
}

// =============================================================================
// Send (swap out a token)
// =============================================================================

/// Swap owned proofs into an exact-amount token plus change, optionally
/// locking the sent half to a recipient pubkey.
pub async fn send(
    api: &dyn MintApi,
    ledger: &mut WalletLedger,
    xpriv: &Xpriv,
    amount: u64,
    lock: Option<SendLock>,
    memo: Option<String>,
) -> WalletResult<Token> {
    let selection = select_proofs(ledger.proofs(), amount, SelectionOrder::default())?;
    let inputs = selection.to_send;
    let input_sum = sum_proofs(&inputs);

    let send_denoms = split_amount(amount);
    let keep_denoms = split_amount(input_sum - amount);
    let locked_prefix = send_denoms.len();
    let amounts: Vec<u64> = send_denoms.iter().chain(keep_denoms.iter()).copied().collect();

    log::info!(
        "Sending {} sats from {} ({} inputs, {} outputs)",
        amount,
        ledger.mint_url(),
        inputs.len(),
        amounts.len()
    );

    let keys = active_keyset(api).await?;
    let keyset_id = keys.id.clone();
    let lock_ref = lock.as_ref();
    let inputs_ref: &[Proof] = &inputs;
    let amounts_ref: &[u64] = &amounts;
    let keyset_ref: &str = &keyset_id;

    let ((planned, signatures), new_counter) =
        with_derivation_attempts(ledger.counter(), |base| {
            async move {
                let planned =
                    plan_outputs(xpriv, keyset_ref, base, amounts_ref, lock_ref, locked_prefix)?;
                let consumed = planned.outputs.len() as u64;
                let signatures = api.swap(inputs_ref, &planned.outputs).await?;
                Ok(((planned, signatures), consumed))
            }
            .boxed()
        })
        .await?;

    // Counter first: a crash after this point can lose proofs to a re-sync,
    // but can never reuse a derivation index. Unblinding happens before the
    // inputs are dropped so a bad mint response leaves them for state sync.
    ledger.set_counter(new_counter).await?;
    let all_proofs = assemble_proofs(&planned, &signatures, &keys)?;
    ledger.remove_proofs(&inputs).await?;

    let sent: Vec<Proof> = all_proofs[..locked_prefix].to_vec();
    let kept: Vec<Proof> = all_proofs[locked_prefix..].to_vec();
    ledger.add_proofs(kept).await?;

    log::info!(
        "Send complete: token of {} sats, balance now {} sats",
        amount,
        ledger.balance()
    );
    Ok(Token::new(ledger.mint_url().to_string(), sent, memo))
}

// =============================================================================
// Receive (claim a token)
// =============================================================================

/// Claim a received token by swapping its proofs for freshly derived ones.
/// Lock conditions are validated before any network call or ledger
/// mutation. Returns the amount received.
pub async fn receive(
    api: &dyn MintApi,
    ledger: &mut WalletLedger,
    xpriv: &Xpriv,
    token: &Token,
) -> WalletResult<u64> {
    if !mint_matches(&token.mint, ledger.mint_url()) {
        return Err(WalletError::InvalidToken {
            reason: format!("token is from {}, not {}", token.mint, ledger.mint_url()),
        });
    }

    let mut inputs = token.proofs.clone();
    if let Some(lock) = token_lock(&inputs)? {
        let our_pubkey = derive_pubkey(xpriv)?;
        if lock.pubkey == our_pubkey {
            // Locked to us: witness every input with the lock key
            let (lock_sk, _) = derive_lock_keypair(xpriv)?;
            for proof in &mut inputs {
                proof.witness = Some(sign_p2pk_witness(&proof.secret, &lock_sk)?);
            }
        } else {
            match lock.locktime {
                // Lock expired: claimable by anyone, no witness needed
                Some(t) if t <= now_secs() => {}
                Some(t) => return Err(WalletError::LockTimeNotExpired { locktime: t }),
                None => return Err(WalletError::LockedToWallet { expected: lock.pubkey }),
            }
        }
    }

    let amount = sum_proofs(&inputs);
    let amounts = split_amount(amount);
    log::info!("Claiming token of {} sats at {}", amount, ledger.mint_url());

    let keys = active_keyset(api).await?;
    let keyset_id = keys.id.clone();
    let inputs_ref: &[Proof] = &inputs;
    let amounts_ref: &[u64] = &amounts;
    let keyset_ref: &str = &keyset_id;

    let result = with_derivation_attempts(ledger.counter(), |base| {
        async move {
            let planned = plan_outputs(xpriv, keyset_ref, base, amounts_ref, None, 0)?;
            let consumed = planned.outputs.len() as u64;
            let signatures = api.swap(inputs_ref, &planned.outputs).await?;
            Ok(((planned, signatures), consumed))
        }
        .boxed()
    })
    .await;

    let ((planned, signatures), new_counter) = match result {
        Ok(ok) => ok,
        Err(e) if e.is_token_spent() => return Err(WalletError::TokenAlreadySpent),
        Err(e) => return Err(e),
    };

    ledger.set_counter(new_counter).await?;
    let fresh = assemble_proofs(&planned, &signatures, &keys)?;
    let received = sum_proofs(&fresh);
    ledger.add_proofs(fresh).await?;

    log::info!("Received {} sats, balance now {} sats", received, ledger.balance());
    Ok(received)
}

// =============================================================================
// Mint (redeem a paid quote)
// =============================================================================

/// Redeem a paid mint quote for fresh proofs. Returns the minted amount.
pub async fn mint_proofs(
    api: &dyn MintApi,
    ledger: &mut WalletLedger,
    xpriv: &Xpriv,
    quote: &MintQuote,
) -> WalletResult<u64> {
    let state = if quote.state == MintQuoteState::Paid {
        quote.state
    } else {
        api.check_mint_quote(&quote.quote_id).await?.state
    };
    if state != MintQuoteState::Paid {
        return Err(WalletError::QuoteUnpaid { quote_id: quote.quote_id.clone() });
    }

    let amounts = split_amount(quote.amount);
    let keys = active_keyset(api).await?;
    let keyset_id = keys.id.clone();
    let quote_id: &str = &quote.quote_id;
    let amounts_ref: &[u64] = &amounts;
    let keyset_ref: &str = &keyset_id;

    let ((planned, signatures), new_counter) =
        with_derivation_attempts(ledger.counter(), |base| {
            async move {
                let planned = plan_outputs(xpriv, keyset_ref, base, amounts_ref, None, 0)?;
                let consumed = planned.outputs.len() as u64;
                let signatures = api.mint(quote_id, &planned.outputs).await?;
                Ok(((planned, signatures), consumed))
            }
            .boxed()
        })
        .await?;

    ledger.set_counter(new_counter).await?;
    let fresh = assemble_proofs(&planned, &signatures, &keys)?;
    let minted = sum_proofs(&fresh);
    ledger.add_proofs(fresh).await?;

    log::info!(
        "Minted {} sats from quote {}, balance now {} sats",
        minted,
        quote.quote_id,
        ledger.balance()
    );
    Ok(minted)
}

// =============================================================================
// Melt (redeem proofs to pay an invoice)
// =============================================================================

/// Outcome of a settled melt
#[derive(Debug, Clone)]
pub struct MeltOutcome {
    pub state: MeltQuoteState,
    /// Change credited back to the ledger
    pub change_sats: u64,
    /// Amount debited including the fee reserve
    pub spent_sats: u64,
}

/// Pay a melt quote by consuming proofs. Inputs are tentatively removed
/// before the network call (they may stay pending at the mint while the
/// Lightning payment is in flight) and restored if the call fails.
pub async fn melt(
    api: &dyn MintApi,
    ledger: &mut WalletLedger,
    xpriv: &Xpriv,
    quote: &MeltQuote,
) -> WalletResult<MeltOutcome> {
    let needed = quote.amount + quote.fee_reserve;
    let selection = select_proofs(ledger.proofs(), needed, SelectionOrder::default())?;
    let inputs = selection.to_send;
    let input_sum = sum_proofs(&inputs);
    let change_denoms = split_amount(input_sum - needed);

    log::info!(
        "Melting {} sats (+{} fee reserve) at {} with {} inputs",
        quote.amount,
        quote.fee_reserve,
        ledger.mint_url(),
        inputs.len()
    );

    let keys = active_keyset(api).await?;
    let keyset_id = keys.id.clone();

    // Tentative removal: while the payment is in flight these proofs must
    // not be selectable by another operation
    ledger.remove_proofs(&inputs).await?;

    let quote_id: &str = &quote.quote_id;
    let inputs_ref: &[Proof] = &inputs;
    let amounts_ref: &[u64] = &change_denoms;
    let keyset_ref: &str = &keyset_id;

    let result = with_derivation_attempts(ledger.counter(), |base| {
        async move {
            let planned = plan_outputs(xpriv, keyset_ref, base, amounts_ref, None, 0)?;
            let consumed = planned.outputs.len() as u64;
            let melt_result = api.melt(quote_id, inputs_ref, &planned.outputs).await?;
            Ok(((planned, melt_result), consumed))
        }
        .boxed()
    })
    .await;

    let ((planned, melt_result), new_counter) = match result {
        Ok(ok) => ok,
        Err(e) => {
            // The mint did not confirm the spend: the balance must not be
            // silently decreased, so the inputs go back before surfacing
            log::warn!("Melt failed, restoring {} input proofs: {}", inputs.len(), e);
            ledger.add_proofs(inputs).await?;
            return Err(e);
        }
    };

    ledger.set_counter(new_counter).await?;
    let change = assemble_change_proofs(&planned, &melt_result.change, &keys)?;
    let change_sats = sum_proofs(&change);
    ledger.add_proofs(change).await?;

    log::info!(
        "Melt {}: {} sats paid, {} sats change, balance now {} sats",
        quote.quote_id,
        quote.amount,
        change_sats,
        ledger.balance()
    );
    Ok(MeltOutcome {
        state: melt_result.state,
        change_sats,
        spent_sats: input_sum - change_sats,
    })
}

// =============================================================================
// NUT-07 State Sync
// =============================================================================

/// Result of reconciling local proofs against mint-reported states
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncResult {
    pub spent_found: usize,
    pub sats_cleaned: u64,
    pub pending_found: usize,
}

/// Check every local proof's spend state with the mint and drop the ones
/// the mint reports as spent. Pending proofs are kept; they may complete.
pub async fn sync_with_mint(
    api: &dyn MintApi,
    ledger: &mut WalletLedger,
) -> WalletResult<SyncResult> {
    let proofs: Vec<Proof> = ledger.proofs().to_vec();
    if proofs.is_empty() {
        return Ok(SyncResult::default());
    }

    let mut result = SyncResult::default();
    let mut spent = Vec::new();

    for batch in proofs.chunks(MAX_SYNC_INPUT_SIZE) {
        let ys: Vec<String> = batch
            .iter()
            .map(|p| Ok(hex::encode(hash_to_curve(p.secret.as_bytes())?.serialize())))
            .collect::<WalletResult<_>>()?;
        let states = api.check_state(&ys).await?;

        for (proof, state) in batch.iter().zip(states.iter()) {
            match state.state {
                ProofSpendState::Spent => {
                    result.spent_found += 1;
                    result.sats_cleaned += proof.amount;
                    spent.push(proof.clone());
                }
                ProofSpendState::Pending => result.pending_found += 1,
                ProofSpendState::Unspent => {}
            }
        }
    }

    if !spent.is_empty() {
        log::info!(
            "Sync with {}: removing {} spent proofs ({} sats)",
            ledger.mint_url(),
            result.spent_found,
            result.sats_cleaned
        );
        ledger.remove_proofs(&spent).await?;
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derivation::{master_xpriv, seed_from_mnemonic};
    use crate::mint::testing::{FakeMint, TEST_KEYSET};
    use crate::storage::MemoryStore;

    const MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
    const MNEMONIC_B: &str =
        "legal winner thank year wave sausage worth useful legal winner thank yellow";
    const MNEMONIC_C: &str =
        "letter advice cage absurd amount doctor acoustic avoid letter advice cage above";

    fn xpriv_for(mnemonic: &str) -> Xpriv {
        master_xpriv(&seed_from_mnemonic(mnemonic).unwrap()).unwrap()
    }

    fn fresh_ledger(tag: &str) -> WalletLedger {
        WalletLedger::new(MemoryStore::new(), tag, "https://fake.mint")
    }

    /// Fund a ledger through the real mint-quote path
    async fn fund(api: &FakeMint, ledger: &mut WalletLedger, xpriv: &Xpriv, amount: u64) {
        let quote = api.create_mint_quote(amount).await.unwrap();
        api.settle_mint_quote(&quote.quote_id);
        let quote = api.check_mint_quote(&quote.quote_id).await.unwrap();
        let minted = mint_proofs(api, ledger, xpriv, &quote).await.unwrap();
        assert_eq!(minted, amount);
    }

    #[test]
    fn test_selection_is_a_partition() {
        let proofs: Vec<Proof> = [64u64, 32, 16, 8, 4, 2, 1]
            .iter()
            .map(|&a| {
                Proof::new(
                    a,
                    TEST_KEYSET.into(),
                    format!("s{}", a),
                    format!("02{}", "ab".repeat(32)),
                )
                .unwrap()
            })
            .collect();

        let selection = select_proofs(&proofs, 70, SelectionOrder::LargestFirst).unwrap();
        assert!(sum_proofs(&selection.to_send) >= 70);

        // No proof lost or duplicated: send + keep == original set
        let mut all: Vec<String> = selection
            .to_send
            .iter()
            .chain(selection.to_keep.iter())
            .map(|p| p.secret.clone())
            .collect();
        all.sort();
        let mut expected: Vec<String> = proofs.iter().map(|p| p.secret.clone()).collect();
        expected.sort();
        assert_eq!(all, expected);

        // Ascending order sweeps small denominations first
        let small = select_proofs(&proofs, 3, SelectionOrder::SmallestFirst).unwrap();
        assert_eq!(small.to_send.iter().map(|p| p.amount).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_selection_insufficient_funds() {
        let proofs = vec![Proof::new(
            4,
            TEST_KEYSET.into(),
            "s".into(),
            format!("02{}", "ab".repeat(32)),
        )
        .unwrap()];
        assert!(matches!(
            select_proofs(&proofs, 100, SelectionOrder::default()),
            Err(WalletError::InsufficientFunds { available: 4, required: 100 })
        ));
    }

    #[tokio::test]
    async fn test_happy_path_spend() {
        let api = FakeMint::new();
        let xpriv = xpriv_for(MNEMONIC);
        let mut ledger = fresh_ledger("n1");

        fund(&api, &mut ledger, &xpriv, 1000).await;
        assert_eq!(ledger.balance(), 1000);
        let counter_before = ledger.counter();
        assert!(counter_before > 0);

        let token = send(&api, &mut ledger, &xpriv, 600, None, None).await.unwrap();
        assert_eq!(token.amount(), 600);
        assert_eq!(ledger.balance(), 400);
        assert!(ledger.counter() > counter_before, "counter must strictly increase");
    }

    #[tokio::test]
    async fn test_conflict_retry_bumps_counter() {
        let api = FakeMint::new();
        let xpriv = xpriv_for(MNEMONIC);
        let mut ledger = fresh_ledger("n2");
        fund(&api, &mut ledger, &xpriv, 64).await;

        let base = ledger.counter();
        api.inject_conflicts.store(1, std::sync::atomic::Ordering::SeqCst);

        let token = send(&api, &mut ledger, &xpriv, 32, None, None).await.unwrap();
        assert_eq!(token.amount(), 32);

        // First attempt rejected, second succeeded at base+1: the committed
        // counter reflects attempt=1, i.e. base + 1 + outputs
        let outputs = 2; // split(32) + split(32)
        assert_eq!(ledger.counter(), base + 1 + outputs);
    }

    #[tokio::test]
    async fn test_conflict_exhaustion() {
        let api = FakeMint::new();
        let xpriv = xpriv_for(MNEMONIC);
        let mut ledger = fresh_ledger("n3");
        fund(&api, &mut ledger, &xpriv, 8).await;

        api.inject_conflicts
            .store(MAX_DERIVATION_ATTEMPTS, std::sync::atomic::Ordering::SeqCst);
        let err = send(&api, &mut ledger, &xpriv, 8, None, None).await.unwrap_err();
        assert!(matches!(err, WalletError::SpendExhausted { .. }));
    }

    #[tokio::test]
    async fn test_short_signature_list_is_rejected() {
        let api = FakeMint::new();
        let xpriv = xpriv_for(MNEMONIC);
        let mut ledger = fresh_ledger("n8");
        fund(&api, &mut ledger, &xpriv, 64).await;

        // A swap answered with fewer signatures than outputs must surface
        // a typed error, and the inputs stay put for state sync
        api.drop_signatures.store(1, std::sync::atomic::Ordering::SeqCst);
        let err = send(&api, &mut ledger, &xpriv, 64, None, None).await.unwrap_err();
        assert!(matches!(err, WalletError::Internal(_)));
        assert_eq!(ledger.balance(), 64);

        // Mint redemption applies the same strictness
        let quote = api.create_mint_quote(32).await.unwrap();
        api.settle_mint_quote(&quote.quote_id);
        let quote = api.check_mint_quote(&quote.quote_id).await.unwrap();
        api.drop_signatures.store(1, std::sync::atomic::Ordering::SeqCst);
        let err = mint_proofs(&api, &mut ledger, &xpriv, &quote).await.unwrap_err();
        assert!(matches!(err, WalletError::Internal(_)));
        assert_eq!(ledger.balance(), 64);
    }

    #[tokio::test]
    async fn test_send_then_receive_between_wallets() {
        let api = FakeMint::new();
        let xpriv_a = xpriv_for(MNEMONIC);
        let xpriv_b = xpriv_for(MNEMONIC_B);
        let mut alice = fresh_ledger("alice");
        let mut bob = fresh_ledger("bob");

        fund(&api, &mut alice, &xpriv_a, 256).await;
        let token = send(&api, &mut alice, &xpriv_a, 100, None, Some("hi".into()))
            .await
            .unwrap();
        assert_eq!(alice.balance(), 156);

        let received = receive(&api, &mut bob, &xpriv_b, &token).await.unwrap();
        assert_eq!(received, 100);
        assert_eq!(bob.balance(), 100);

        // Second claim must fail: the proofs are spent at the mint
        let xpriv_c = xpriv_for(MNEMONIC_C);
        let mut mallory = fresh_ledger("mallory");
        let err = receive(&api, &mut mallory, &xpriv_c, &token).await.unwrap_err();
        assert!(matches!(err, WalletError::TokenAlreadySpent));
        assert_eq!(mallory.balance(), 0);
    }

    #[tokio::test]
    async fn test_locked_token_claim() {
        let api = FakeMint::new();
        let xpriv_a = xpriv_for(MNEMONIC);
        let xpriv_b = xpriv_for(MNEMONIC_B);
        let mut alice = fresh_ledger("alice2");
        let mut bob = fresh_ledger("bob2");

        fund(&api, &mut alice, &xpriv_a, 128).await;

        let bob_pubkey = derive_pubkey(&xpriv_b).unwrap();
        let token = send(
            &api,
            &mut alice,
            &xpriv_a,
            64,
            Some(SendLock { pubkey: bob_pubkey, locktime: None }),
            None,
        )
        .await
        .unwrap();

        // Bob can claim a token locked to his pubkey
        let received = receive(&api, &mut bob, &xpriv_b, &token).await.unwrap();
        assert_eq!(received, 64);
    }

    #[tokio::test]
    async fn test_locked_token_rejected_for_wrong_wallet() {
        let api = FakeMint::new();
        let xpriv_a = xpriv_for(MNEMONIC);
        let xpriv_b = xpriv_for(MNEMONIC_B);
        let mut alice = fresh_ledger("alice3");
        let mut carol = fresh_ledger("carol");

        fund(&api, &mut alice, &xpriv_a, 128).await;
        let bob_pubkey = derive_pubkey(&xpriv_b).unwrap();

        // No locktime: locked forever to Bob
        let token = send(
            &api,
            &mut alice,
            &xpriv_a,
            64,
            Some(SendLock { pubkey: bob_pubkey.clone(), locktime: None }),
            None,
        )
        .await
        .unwrap();

        let calls_before = api.calls.load(std::sync::atomic::Ordering::SeqCst);
        let err = receive(&api, &mut carol, &xpriv_a, &token).await.unwrap_err();
        assert!(matches!(err, WalletError::LockedToWallet { .. }));
        assert_eq!(carol.balance(), 0, "rejection must not mutate the ledger");
        assert_eq!(
            api.calls.load(std::sync::atomic::Ordering::SeqCst),
            calls_before,
            "lock validation happens before any network call"
        );

        // Unexpired locktime: still bound
        let token2 = send(
            &api,
            &mut alice,
            &xpriv_a,
            32,
            Some(SendLock { pubkey: bob_pubkey, locktime: Some(now_secs() + 3600) }),
            None,
        )
        .await
        .unwrap();
        let err = receive(&api, &mut carol, &xpriv_a, &token2).await.unwrap_err();
        assert!(matches!(err, WalletError::LockTimeNotExpired { .. }));
    }

    #[tokio::test]
    async fn test_expired_lock_is_claimable() {
        let api = FakeMint::new();
        let xpriv_a = xpriv_for(MNEMONIC);
        let xpriv_b = xpriv_for(MNEMONIC_B);
        let mut alice = fresh_ledger("alice4");
        let mut carol = fresh_ledger("carol2");

        fund(&api, &mut alice, &xpriv_a, 64).await;
        let bob_pubkey = derive_pubkey(&xpriv_b).unwrap();

        let token = send(
            &api,
            &mut alice,
            &xpriv_a,
            16,
            Some(SendLock { pubkey: bob_pubkey, locktime: Some(now_secs() - 10) }),
            None,
        )
        .await
        .unwrap();

        let received = receive(&api, &mut carol, &xpriv_a, &token).await.unwrap();
        assert_eq!(received, 16);
    }

    #[tokio::test]
    async fn test_melt_pays_and_credits_change() {
        let api = FakeMint::new();
        let xpriv = xpriv_for(MNEMONIC);
        let mut ledger = fresh_ledger("n4");
        fund(&api, &mut ledger, &xpriv, 1024).await;

        let quote = api.create_melt_quote("lnbc600n1fake").await.unwrap();
        assert_eq!(quote.amount, 600);

        let outcome = melt(&api, &mut ledger, &xpriv, &quote).await.unwrap();
        assert_eq!(outcome.state, MeltQuoteState::Paid);
        assert_eq!(outcome.spent_sats, 600 + quote.fee_reserve);
        assert_eq!(ledger.balance(), 1024 - 600 - quote.fee_reserve);
    }

    #[tokio::test]
    async fn test_melt_failure_restores_inputs() {
        let api = FakeMint::new();
        let xpriv = xpriv_for(MNEMONIC);
        let mut ledger = fresh_ledger("n5");
        fund(&api, &mut ledger, &xpriv, 512).await;
        let quote = api.create_melt_quote("lnbc100n1fake").await.unwrap();

        // Allow the keyset fetch through, then drop the melt call itself so
        // the tentatively removed inputs must be restored
        api.fail_after.store(2, std::sync::atomic::Ordering::SeqCst);
        let err = melt(&api, &mut ledger, &xpriv, &quote).await.unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(ledger.balance(), 512, "failed melt must not decrease the balance");
    }

    #[tokio::test]
    async fn test_sync_with_mint_drops_spent_proofs() {
        let api = FakeMint::new();
        let xpriv_a = xpriv_for(MNEMONIC);
        let xpriv_b = xpriv_for(MNEMONIC_B);
        let mut alice = fresh_ledger("n6");
        let mut bob = fresh_ledger("n7");
        fund(&api, &mut alice, &xpriv_a, 64).await;

        // Alice's proofs leak to Bob, who claims them out-of-band
        let token = Token::new("https://fake.mint".into(), alice.proofs().to_vec(), None);
        receive(&api, &mut bob, &xpriv_b, &token).await.unwrap();

        // Alice still holds stale local proofs; sync removes them
        assert_eq!(alice.balance(), 64);
        let result = sync_with_mint(&api, &mut alice).await.unwrap();
        assert_eq!(result.sats_cleaned, 64);
        assert_eq!(alice.balance(), 0);
    }
}
