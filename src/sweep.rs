//! Automatic sweep of excess ecash into the user's Lightning node
//!
//! Ecash is bearer money held on trust in the mint; above a configured
//! threshold the surplus is melted out to an invoice the host node issues
//! for itself. The decision path is purely local: a run that decides not
//! to sweep makes no network calls at all.

use bitcoin::bip32::Xpriv;

use crate::errors::WalletResult;
use crate::ledger::WalletLedger;
use crate::lightning::{LightningInvoices, NotificationSink};
use crate::mint::MintApi;
use crate::spend;

/// Invoice expiry requested for sweep invoices
const SWEEP_INVOICE_EXPIRY_SECS: u64 = 3600;

/// Sweep policy knobs, persisted by the host
#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub enabled: bool,
    /// Balance at or above which a sweep is attempted
    pub threshold_sats: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self { enabled: false, threshold_sats: 10_000 }
    }
}

/// Host veto over sweep timing (e.g. node offline, channels saturated).
/// Consulted only after the local threshold checks pass.
pub trait SweepGuard: Send + Sync {
    fn allow_sweep(&self) -> bool;
}

/// Guard that never vetoes
pub struct AlwaysAllow;

impl SweepGuard for AlwaysAllow {
    fn allow_sweep(&self) -> bool {
        true
    }
}

/// Why a sweep run did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    BelowThreshold,
    GuardDeclined,
    /// Balance would not survive the fee margin
    NothingToSweep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    Skipped(SkipReason),
    Swept {
        /// Total debited from the ledger, fees included
        swept_sats: u64,
        /// Change credited back after the melt
        change_sats: u64,
    },
}

/// Sweep the ledger's balance to the host's Lightning node if policy allows.
/// Failure modes are ordinary melt failures; a failed sweep leaves the
/// balance intact and is retried on the next trigger.
pub async fn maybe_sweep(
    api: &dyn MintApi,
    ledger: &mut WalletLedger,
    xpriv: &Xpriv,
    lightning: &dyn LightningInvoices,
    guard: &dyn SweepGuard,
    sink: &dyn NotificationSink,
    config: &SweepConfig,
) -> WalletResult<SweepOutcome> {
    if !config.enabled {
        return Ok(SweepOutcome::Skipped(SkipReason::Disabled));
    }
    let balance = ledger.balance();
    if balance < config.threshold_sats {
        log::debug!(
            "Sweep for {} skipped: balance {} below threshold {}",
            ledger.mint_url(),
            balance,
            config.threshold_sats
        );
        return Ok(SweepOutcome::Skipped(SkipReason::BelowThreshold));
    }
    if !guard.allow_sweep() {
        log::debug!("Sweep for {} vetoed by guard", ledger.mint_url());
        return Ok(SweepOutcome::Skipped(SkipReason::GuardDeclined));
    }

    // Quote the full balance once just to learn the mint's fee reserve,
    // then re-invoice for what actually fits
    let probe = lightning
        .create_invoice("ecash sweep", balance, SWEEP_INVOICE_EXPIRY_SECS)
        .await?;
    let probe_quote = api.create_melt_quote(&probe.payment_request).await?;
    let receivable = balance.saturating_sub(probe_quote.fee_reserve);
    if receivable == 0 {
        log::debug!(
            "Sweep for {} skipped: fee reserve {} consumes the whole balance",
            ledger.mint_url(),
            probe_quote.fee_reserve
        );
        return Ok(SweepOutcome::Skipped(SkipReason::NothingToSweep));
    }

    let invoice = lightning
        .create_invoice("ecash sweep", receivable, SWEEP_INVOICE_EXPIRY_SECS)
        .await?;
    let quote = api.create_melt_quote(&invoice.payment_request).await?;
    if quote.amount + quote.fee_reserve > balance {
        // Fee reserve grew between the probe and the real quote; stand down
        // and let the next trigger try again
        log::warn!(
            "Sweep quote for {} needs {} sats against balance {}, skipping",
            ledger.mint_url(),
            quote.amount + quote.fee_reserve,
            balance
        );
        return Ok(SweepOutcome::Skipped(SkipReason::NothingToSweep));
    }

    let outcome = spend::melt(api, ledger, xpriv, &quote).await?;
    log::info!(
        "Swept {} sats from {} to the local node ({} sats change)",
        outcome.spent_sats,
        ledger.mint_url(),
        outcome.change_sats
    );
    sink.notify(&format!("Swept {} sats of ecash to your node", quote.amount));

    Ok(SweepOutcome::Swept {
        swept_sats: outcome.spent_sats,
        change_sats: outcome.change_sats,
    })
}
