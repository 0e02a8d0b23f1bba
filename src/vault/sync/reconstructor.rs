//! Folding raw vault logs into chart, ledger and totals.
//!
//! The reconstructor is a pure function of its inputs: it never reads the clock and never
//! talks to the chain. Logs from both streams are merged and ordered by
//! `(block_number, log_index)`, the only order that is stable for several events in one block.

use crate::rpc::{EventKind, RawLog};
use crate::vault::types::{
	Aggregate, BalancePoint, LedgerEntry, LiveState, VaultEvent, VaultSnapshot, ViewScope,
};

use alloy_primitives::{I256, U256};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;

/// Errors that make a set of logs impossible to fold
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconstructError {
	#[error("No timestamp resolved for block {0}")]
	MissingBlockTimestamp(u64),

	#[error("Amount {amount} in block {block_number} overflows the running balance")]
	AmountOverflow { block_number: u64, amount: U256 },

	#[error("Baseline point before block {0} is out of the representable time range")]
	BaselineOutOfRange(u64),
}

/// Merges deposit and withdrawal logs into derived vault state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconstructor {
	/// Distance between the synthetic zero point and the first event
	baseline_offset: TimeDelta,
}

impl Default for Reconstructor {
	fn default() -> Self {
		Self {
			baseline_offset: TimeDelta::days(1),
		}
	}
}

impl Reconstructor {
	pub fn new(baseline_offset: TimeDelta) -> Self {
		Self { baseline_offset }
	}

	/// Tag, order and resolve timestamps for the logs visible in `scope`.
	pub fn merge(
		&self,
		deposit_logs: &[RawLog],
		withdrawal_logs: &[RawLog],
		block_timestamps: &HashMap<u64, DateTime<Utc>>,
		scope: ViewScope,
	) -> Result<Vec<VaultEvent>, ReconstructError> {
		let tagged = deposit_logs
			.iter()
			.map(|log| (EventKind::Deposit, log))
			.chain(withdrawal_logs.iter().map(|log| (EventKind::Withdrawal, log)))
			.filter(|(_, log)| scope.matches(&log.user));

		let mut events = Vec::with_capacity(deposit_logs.len() + withdrawal_logs.len());
		for (kind, log) in tagged {
			let timestamp = *block_timestamps
				.get(&log.block_number)
				.ok_or(ReconstructError::MissingBlockTimestamp(log.block_number))?;
			events.push(VaultEvent {
				kind,
				amount: log.amount,
				block_number: log.block_number,
				log_index: log.log_index,
				timestamp,
				transaction_hash: log.transaction_hash,
				user: log.user,
			});
		}

		// sort_by_key is stable, so duplicates keep input order
		events.sort_by_key(VaultEvent::position);
		Ok(events)
	}

	/// Running balance per event, preceded by a zero baseline.
	pub fn balance_series(&self, events: &[VaultEvent]) -> Result<Vec<BalancePoint>, ReconstructError> {
		let Some(first) = events.first() else {
			return Ok(Vec::new());
		};

		let mut series = Vec::with_capacity(events.len() + 1);
		let baseline = first
			.timestamp
			.checked_sub_signed(self.baseline_offset)
			.ok_or(ReconstructError::BaselineOutOfRange(first.block_number))?;
		series.push(BalancePoint {
			at: baseline,
			balance: I256::ZERO,
		});

		let mut balance = I256::ZERO;
		for event in events {
			let overflow = || ReconstructError::AmountOverflow {
				block_number: event.block_number,
				amount: event.amount,
			};
			let amount = I256::try_from(event.amount).map_err(|_| overflow())?;
			balance = match event.kind {
				EventKind::Deposit => balance.checked_add(amount),
				EventKind::Withdrawal => balance.checked_sub(amount),
			}
			.ok_or_else(overflow)?;

			series.push(BalancePoint {
				at: event.timestamp,
				balance,
			});
		}

		Ok(series)
	}

	/// History rows, newest first.
	pub fn ledger(&self, events: &[VaultEvent]) -> Vec<LedgerEntry> {
		events
			.iter()
			.rev()
			.map(|event| LedgerEntry {
				tx_hash: event.transaction_hash,
				kind: event.kind,
				amount: event.amount,
				block_number: event.block_number,
				log_index: event.log_index,
				timestamp: Some(event.timestamp),
			})
			.collect()
	}

	/// Totals summed straight from the events, independent of the fold.
	pub fn aggregate(&self, events: &[VaultEvent]) -> Result<Aggregate, ReconstructError> {
		let mut aggregate = Aggregate::default();
		for event in events {
			let total = match event.kind {
				EventKind::Deposit => &mut aggregate.total_deposits,
				EventKind::Withdrawal => &mut aggregate.total_withdrawals,
			};
			*total = total
				.checked_add(event.amount)
				.ok_or(ReconstructError::AmountOverflow {
					block_number: event.block_number,
					amount: event.amount,
				})?;
		}
		Ok(aggregate)
	}

	/// Full reconstruction for one session.
	pub fn reconstruct(
		&self,
		deposit_logs: &[RawLog],
		withdrawal_logs: &[RawLog],
		block_timestamps: &HashMap<u64, DateTime<Utc>>,
		scope: ViewScope,
		head_block: u64,
	) -> Result<VaultSnapshot, ReconstructError> {
		let events = self.merge(deposit_logs, withdrawal_logs, block_timestamps, scope)?;

		Ok(VaultSnapshot {
			series: self.balance_series(&events)?,
			ledger: self.ledger(&events),
			aggregate: self.aggregate(&events)?,
			live: LiveState::default(),
			head_block,
		})
	}
}
