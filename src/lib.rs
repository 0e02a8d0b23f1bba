//! Derived state tracking for an on-chain custodial vault.
//!
//! Deposit and withdrawal logs are read from a JSON-RPC node and folded into a balance series,
//! a transaction ledger and aggregate totals. Refreshes may be triggered by users, pollers and
//! transaction confirmations at once; only the most recently issued refresh of a scope ever
//! becomes visible.

pub mod config;
pub mod rpc;
pub mod utils;
pub mod vault;

pub use config::{Config, ConfigError};
pub use vault::{TrackerError, TrackingScope, VaultSnapshot, VaultTracker};
