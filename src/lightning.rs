//! Lightning invoice collaborator
//!
//! The engine never speaks bolt11 itself; invoice creation and decoding are
//! delegated through this narrow contract to the host's Lightning subsystem.

use async_trait::async_trait;

use crate::errors::WalletResult;

/// A freshly created invoice
#[derive(Debug, Clone)]
pub struct CreatedInvoice {
    /// bolt11 payment request
    pub payment_request: String,
    /// Optional on-chain fallback address
    pub on_chain_address: Option<String>,
}

/// Decoded bolt11 fields the engine cares about
#[derive(Debug, Clone)]
pub struct DecodedInvoice {
    pub amount_sats: u64,
    pub description: String,
    pub payment_hash: String,
    pub expiry_secs: u64,
}

/// Lightning invoice/payment service contract
#[async_trait]
pub trait LightningInvoices: Send + Sync {
    /// Create an invoice payable to the user's node
    async fn create_invoice(
        &self,
        memo: &str,
        value_sats: u64,
        expiry_secs: u64,
    ) -> WalletResult<CreatedInvoice>;

    /// Decode a bolt11 payment request
    async fn decode_bolt11(&self, invoice: &str) -> WalletResult<DecodedInvoice>;
}

/// Fire-and-forget UI notification sink. Advisory only, never affects
/// correctness; implementations must not block.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, message: &str);
}

/// Sink that drops all notifications
pub struct NullSink;

impl NotificationSink for NullSink {
    fn notify(&self, _message: &str) {}
}
