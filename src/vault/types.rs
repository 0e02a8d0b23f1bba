use crate::rpc::{EventKind, RpcError};
use crate::vault::sync::reconstructor::ReconstructError;

use alloy_primitives::{Address, B256, I256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A deposit or withdrawal placed in chain order.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct VaultEvent {
	pub kind: EventKind,
	pub amount: U256,
	pub block_number: u64,
	pub log_index: u64,
	pub timestamp: DateTime<Utc>,
	pub transaction_hash: B256,
	pub user: Address,
}

impl VaultEvent {
	/// Total order of events on chain
	pub fn position(&self) -> (u64, u64) {
		(self.block_number, self.log_index)
	}
}

/// One point of the balance chart.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BalancePoint {
	pub at: DateTime<Utc>,
	/// Running balance in wei
	pub balance: I256,
}

/// One row of the user-facing transaction history.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LedgerEntry {
	pub tx_hash: B256,
	pub kind: EventKind,
	pub amount: U256,
	pub block_number: u64,
	pub log_index: u64,
	pub timestamp: Option<DateTime<Utc>>,
}

/// Independently summed deposit and withdrawal totals, in wei.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Aggregate {
	pub total_deposits: U256,
	pub total_withdrawals: U256,
}

impl Aggregate {
	/// Deposits minus withdrawals. Saturates at the `I256` bounds.
	pub fn net(&self) -> I256 {
		let deposits = I256::try_from(self.total_deposits).unwrap_or(I256::MAX);
		let withdrawals = I256::try_from(self.total_withdrawals).unwrap_or(I256::MAX);
		deposits.saturating_sub(withdrawals)
	}
}

/// Contract state read directly at the session's head block.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct LiveState {
	/// Ether held by the vault contract, in wei
	pub contract_balance: U256,
	/// `getBalance(user)` for user scopes, in wei
	pub user_balance: Option<U256>,
	pub owner: Address,
}

impl LiveState {
	pub fn is_owner(&self, user: &Address) -> bool {
		self.owner == *user
	}
}

/// Derived state produced by one fetch session.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct VaultSnapshot {
	pub series: Vec<BalancePoint>,
	pub ledger: Vec<LedgerEntry>,
	pub aggregate: Aggregate,
	pub live: LiveState,
	/// Head block the session read up to
	pub head_block: u64,
}

impl VaultSnapshot {
	/// Balance after the last event, zero when there are none.
	pub fn current_balance(&self) -> I256 {
		self.series.last().map(|point| point.balance).unwrap_or(I256::ZERO)
	}
}

/// Which events a reconstruction covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViewScope {
	/// Every event of the vault
	All,
	/// Only events whose `user` matches
	User(Address),
}

impl ViewScope {
	pub fn matches(&self, user: &Address) -> bool {
		match self {
			ViewScope::All => true,
			ViewScope::User(scoped) => scoped == user,
		}
	}

	pub fn user(&self) -> Option<Address> {
		match self {
			ViewScope::All => None,
			ViewScope::User(user) => Some(*user),
		}
	}
}

/// Identity of a consumer of derived state: one contract, optionally one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackingScope {
	pub contract: Address,
	pub user: Option<Address>,
}

impl TrackingScope {
	pub fn vault_wide(contract: Address) -> Self {
		Self { contract, user: None }
	}

	pub fn for_user(contract: Address, user: Address) -> Self {
		Self {
			contract,
			user: Some(user),
		}
	}

	pub fn view(&self) -> ViewScope {
		self.user.map(ViewScope::User).unwrap_or(ViewScope::All)
	}
}

impl fmt::Display for TrackingScope {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.user {
			Some(user) => write!(f, "{}/{}", self.contract, user),
			None => write!(f, "{}/*", self.contract),
		}
	}
}

/// Errors surfaced to consumers of the tracker
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
	#[error("Request declined by user: {0}")]
	UserDeclined(#[source] RpcError),

	#[error("Gave up after {attempts} attempts: {source}")]
	ExhaustedRetries {
		attempts: u32,
		#[source]
		source: RpcError,
	},

	#[error("Refresh did not finish within {0:?}")]
	DeadlineElapsed(Duration),

	#[error("Reconstruction error: {0}")]
	ReconstructError(#[from] ReconstructError),

	#[error("Invalid amount: {0}")]
	InvalidAmount(String),

	#[error("Baseline offset of {0} seconds is out of range")]
	InvalidBaselineOffset(i64),
}

impl TrackerError {
	/// Whether the error came from an explicit user decline
	pub fn is_user_declined(&self) -> bool {
		matches!(self, TrackerError::UserDeclined(_))
	}
}

/// Shared handle to a surfaced error, cheap to hand to several observers
pub type SharedError = Arc<TrackerError>;
