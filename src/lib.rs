//! Chaumian ecash wallet engine
//!
//! A self-custodial Cashu wallet core: deterministic NUT-13 derivation,
//! BDHKE blinding, per-mint proof ledgers with crash-safe counters, an
//! optimistic-retry spend engine, seed-only restoration and a multi-mint
//! orchestrator. The host supplies storage, Lightning and notification
//! capabilities through the traits in `storage` and `lightning`.

pub mod derivation;
pub mod errors;
pub mod ledger;
pub mod lightning;
pub mod mint;
pub mod multimint;
pub mod restore;
pub mod spend;
pub mod storage;
pub mod sweep;
pub mod token;
pub mod types;
pub mod utils;

pub use errors::{NutErrorCode, WalletError, WalletResult};
pub use ledger::WalletLedger;
pub use lightning::{LightningInvoices, NotificationSink, NullSink};
pub use mint::{HttpMintClient, MintApi};
pub use multimint::{HttpConnector, MintConnector, MultiMintWallet};
pub use restore::{restore_wallet, RestoreOptions, RestoreSummary};
pub use spend::{select_proofs, SelectionOrder, SendLock};
pub use storage::{KeyValueStore, MemoryStore};
pub use sweep::{SweepConfig, SweepGuard, SweepOutcome};
pub use token::Token;
pub use types::{MeltQuote, MintQuote, Proof};
