//! Wallet engine error types
//!
//! Typed error handling for better context preservation and error matching.
//! Includes NUT error codes per the Cashu NUT-00 specification.

use std::fmt;

// =============================================================================
// NUT Error Codes (per NUT-00 specification)
// =============================================================================

/// NUT error codes from the Cashu specification
/// These map to standardized error responses from mints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NutErrorCode {
    /// Token already spent
    TokenAlreadySpent = 11001,
    /// Token pending (locked in transaction)
    TokenPending = 11002,
    /// Transaction unbalanced (inputs != outputs + fee)
    TransactionUnbalanced = 11003,
    /// Unit not supported by mint
    UnsupportedUnit = 11004,
    /// Minting disabled
    MintingDisabled = 11005,
    /// Quote not paid
    QuoteNotPaid = 11006,
    /// Quote expired
    QuoteExpired = 11007,
    /// Quote pending
    QuotePending = 11008,
    /// Blinded message already signed (derivation index reuse)
    BlindedMessageAlreadySigned = 11009,
    /// Amount out of limit range
    AmountOutOfLimitRange = 11010,
    /// Witness missing or invalid (P2PK)
    WitnessMissingOrInvalid = 11015,
    /// Lightning error
    LightningError = 20001,
    /// Invoice already paid
    InvoiceAlreadyPaid = 20002,
    /// Unknown/generic error
    Unknown = 65535,
}

impl NutErrorCode {
    /// Create from numeric code
    pub fn from_code(code: u16) -> Self {
        match code {
            11001 => Self::TokenAlreadySpent,
            11002 => Self::TokenPending,
            11003 => Self::TransactionUnbalanced,
            11004 => Self::UnsupportedUnit,
            11005 => Self::MintingDisabled,
            11006 => Self::QuoteNotPaid,
            11007 => Self::QuoteExpired,
            11008 => Self::QuotePending,
            11009 => Self::BlindedMessageAlreadySigned,
            11010 => Self::AmountOutOfLimitRange,
            11015 => Self::WitnessMissingOrInvalid,
            20001 => Self::LightningError,
            20002 => Self::InvoiceAlreadyPaid,
            _ => Self::Unknown,
        }
    }

    /// Get numeric code value
    pub fn code(&self) -> u16 {
        *self as u16
    }

    /// Check if this code means a derivation index was already consumed
    /// at the mint, i.e. the operation should retry with a fresh counter
    pub fn is_counter_conflict(&self) -> bool {
        matches!(self, Self::BlindedMessageAlreadySigned)
    }
}

impl fmt::Display for NutErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokenAlreadySpent => write!(f, "Token already spent (11001)"),
            Self::TokenPending => write!(f, "Token pending (11002)"),
            Self::TransactionUnbalanced => write!(f, "Transaction unbalanced (11003)"),
            Self::UnsupportedUnit => write!(f, "Unsupported unit (11004)"),
            Self::MintingDisabled => write!(f, "Minting disabled (11005)"),
            Self::QuoteNotPaid => write!(f, "Quote not paid (11006)"),
            Self::QuoteExpired => write!(f, "Quote expired (11007)"),
            Self::QuotePending => write!(f, "Quote pending (11008)"),
            Self::BlindedMessageAlreadySigned => write!(f, "Blinded message already signed (11009)"),
            Self::AmountOutOfLimitRange => write!(f, "Amount out of limit range (11010)"),
            Self::WitnessMissingOrInvalid => write!(f, "Witness missing or invalid (11015)"),
            Self::LightningError => write!(f, "Lightning error (20001)"),
            Self::InvoiceAlreadyPaid => write!(f, "Invoice already paid (20002)"),
            Self::Unknown => write!(f, "Unknown error (65535)"),
        }
    }
}

// =============================================================================
// Wallet Error Type
// =============================================================================

/// Wallet engine error type
#[derive(Debug, Clone)]
pub enum WalletError {
    // ==========================================================================
    // Transport Errors
    // ==========================================================================
    /// Mint unreachable: transport failure or timeout. Terminal for the
    /// current attempt; never silently retried by the client layer.
    MintUnreachable { mint_url: String, message: String },

    // ==========================================================================
    // Mint Protocol Errors
    // ==========================================================================
    /// Mint rejected a request with a protocol-level error
    Protocol { code: NutErrorCode, message: String },
    /// Counter-conflict retry budget exhausted
    SpendExhausted { attempts: u32 },

    // ==========================================================================
    // Validation Errors
    // ==========================================================================
    InsufficientFunds { available: u64, required: u64 },
    /// Token proofs lock to more than one pubkey
    InconsistentLocking,
    /// Token is locked to a pubkey that is not this wallet's
    LockedToWallet { expected: String },
    /// Token is locked to another wallet and the locktime has not passed yet
    LockTimeNotExpired { locktime: u64 },
    TokenAlreadySpent,
    InvalidToken { reason: String },
    InvalidProof { reason: String },

    // ==========================================================================
    // Quote Errors
    // ==========================================================================
    QuoteUnpaid { quote_id: String },
    QuoteExpired { quote_id: String },

    // ==========================================================================
    // Wallet State Errors
    // ==========================================================================
    MintNotFound { mint_url: String },
    Storage(String),
    Derivation(String),
    Cancelled,
    Internal(String),
}

impl fmt::Display for WalletError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MintUnreachable { mint_url, message } => {
                write!(f, "Mint unreachable {}: {}", mint_url, message)
            }
            Self::Protocol { code, message } => {
                write!(f, "Mint error: {} ({})", message, code)
            }
            Self::SpendExhausted { attempts } => {
                write!(f, "Derivation counter conflicts persisted after {} attempts", attempts)
            }
            Self::InsufficientFunds { available, required } => {
                write!(f, "Insufficient funds: available={}, required={}", available, required)
            }
            Self::InconsistentLocking => {
                write!(f, "Token proofs lock to different pubkeys")
            }
            Self::LockedToWallet { expected } => {
                write!(f, "Token is locked to another wallet's pubkey {}", expected)
            }
            Self::LockTimeNotExpired { locktime } => {
                write!(f, "Token lock time {} has not expired", locktime)
            }
            Self::TokenAlreadySpent => write!(f, "Token already spent"),
            Self::InvalidToken { reason } => write!(f, "Invalid token format: {}", reason),
            Self::InvalidProof { reason } => write!(f, "Invalid proof: {}", reason),
            Self::QuoteUnpaid { quote_id } => write!(f, "Quote unpaid: {}", quote_id),
            Self::QuoteExpired { quote_id } => write!(f, "Quote expired: {}", quote_id),
            Self::MintNotFound { mint_url } => write!(f, "Mint not found: {}", mint_url),
            Self::Storage(msg) => write!(f, "Storage error: {}", msg),
            Self::Derivation(msg) => write!(f, "Derivation error: {}", msg),
            Self::Cancelled => write!(f, "Operation cancelled"),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for WalletError {}

/// Result type alias for wallet engine operations
pub type WalletResult<T> = Result<T, WalletError>;

impl WalletError {
    /// Check if this error means a derivation index was already used at the
    /// mint and the operation should retry with a fresh base counter
    pub fn is_counter_conflict(&self) -> bool {
        match self {
            Self::Protocol { code, .. } => code.is_counter_conflict(),
            _ => false,
        }
    }

    /// Check if this is a connection/transport error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::MintUnreachable { .. })
    }

    /// Check if this error indicates the involved proofs are already spent
    pub fn is_token_spent(&self) -> bool {
        matches!(
            self,
            Self::TokenAlreadySpent
                | Self::Protocol { code: NutErrorCode::TokenAlreadySpent, .. }
        )
    }

    /// Build a protocol error from a mint-reported code and detail string
    pub fn protocol(code: u16, message: impl Into<String>) -> Self {
        Self::Protocol {
            code: NutErrorCode::from_code(code),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nut_code_roundtrip() {
        assert_eq!(NutErrorCode::from_code(11009), NutErrorCode::BlindedMessageAlreadySigned);
        assert_eq!(NutErrorCode::BlindedMessageAlreadySigned.code(), 11009);
        assert_eq!(NutErrorCode::from_code(42), NutErrorCode::Unknown);
    }

    #[test]
    fn test_counter_conflict_classification() {
        let conflict = WalletError::protocol(11009, "outputs already signed");
        assert!(conflict.is_counter_conflict());

        let spent = WalletError::protocol(11001, "already spent");
        assert!(!spent.is_counter_conflict());
        assert!(spent.is_token_spent());

        let transport = WalletError::MintUnreachable {
            mint_url: "https://mint.example.com".into(),
            message: "timeout".into(),
        };
        assert!(transport.is_connection_error());
        assert!(!transport.is_counter_conflict());
    }
}
