use crate::rpc::abi::{getBalanceCall, ownerCall};
use crate::rpc::{
	BlockHeader, BlockRange, CallRequest, ChainReader, EventKind, LogFilter, RawLog, RpcError,
};
use crate::vault::types::LiveState;

use alloy_primitives::{Address, Bytes};
use alloy_sol_types::SolCall;
use chrono::{DateTime, Utc};
use futures_util::{StreamExt, TryStreamExt};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Issues filtered log queries, block lookups and contract reads against a [`ChainReader`].
///
/// Errors are returned as-is; retrying is the caller's concern.
#[derive(Clone)]
pub struct EventSource {
	chain: Arc<dyn ChainReader>,
	/// Widest block span sent in one `eth_getLogs`
	max_block_range: u64,
	/// Block lookups kept in flight at once
	block_fetch_concurrency: usize,
}

impl EventSource {
	pub fn new(chain: Arc<dyn ChainReader>, max_block_range: u64, block_fetch_concurrency: usize) -> Self {
		Self {
			chain,
			max_block_range: max_block_range.max(1),
			block_fetch_concurrency: block_fetch_concurrency.max(1),
		}
	}

	/// The sub-ranges `fetch_logs` queries for `range`
	pub fn chunk_plan(&self, range: BlockRange) -> Vec<BlockRange> {
		range.chunks(self.max_block_range)
	}

	pub async fn latest_block(&self) -> Result<u64, RpcError> {
		self.chain.block_number().await
	}

	/// Fetch all `kind` logs of `address` within `range`, optionally for one user.
	///
	/// The range is queried in chunks of at most `max_block_range` blocks, in order,
	/// so the returned logs are in chain order as long as the node returns each chunk sorted.
	pub async fn fetch_logs(
		&self,
		address: Address,
		kind: EventKind,
		user: Option<Address>,
		range: BlockRange,
	) -> Result<Vec<RawLog>, RpcError> {
		let mut logs = Vec::new();

		for chunk in self.chunk_plan(range) {
			let filter = LogFilter {
				address,
				kind,
				user,
				range: chunk,
			};
			let batch = self.chain.query_logs(&filter).await?;
			debug!(
				"{:?} logs in blocks {}..={}: {}",
				kind,
				chunk.from,
				chunk.to,
				batch.len()
			);
			logs.extend(batch);
		}

		Ok(logs)
	}

	/// Resolve the timestamp of every distinct block in `blocks`.
	///
	/// Each block is looked up once no matter how often it appears.
	pub async fn fetch_block_timestamps(
		&self,
		blocks: &[u64],
	) -> Result<HashMap<u64, DateTime<Utc>>, RpcError> {
		let distinct: BTreeSet<u64> = blocks.iter().copied().collect();
		debug!("Resolving timestamps for {} blocks", distinct.len());

		let headers: Vec<BlockHeader> = futures_util::stream::iter(distinct)
			.map(|number| self.chain.get_block(number))
			.buffer_unordered(self.block_fetch_concurrency)
			.try_collect()
			.await?;

		headers
			.into_iter()
			.map(|header| {
				let at = i64::try_from(header.timestamp)
					.ok()
					.and_then(|secs| DateTime::from_timestamp(secs, 0))
					.ok_or(RpcError::InvalidTimestamp {
						block: header.number,
						timestamp: header.timestamp,
					})?;
				Ok((header.number, at))
			})
			.collect()
	}

	/// Read the vault's ether balance, its owner and, for a user, their vault balance at `block`.
	pub async fn fetch_live_state(
		&self,
		contract: Address,
		user: Option<Address>,
		block: u64,
	) -> Result<LiveState, RpcError> {
		let user_balance = async {
			match user {
				Some(user) => {
					let output = self.read(contract, getBalanceCall { user }.abi_encode(), block).await?;
					Ok::<_, RpcError>(Some(getBalanceCall::abi_decode_returns(&output, true)?._0))
				}
				None => Ok(None),
			}
		};
		let owner = async {
			let output = self.read(contract, ownerCall {}.abi_encode(), block).await?;
			Ok::<_, RpcError>(ownerCall::abi_decode_returns(&output, true)?._0)
		};

		let (contract_balance, user_balance, owner) = futures::try_join!(
			self.chain.get_balance(contract, block),
			user_balance,
			owner,
		)?;
		debug!("Vault {} holds {} wei at block {}", contract, contract_balance, block);

		Ok(LiveState {
			contract_balance,
			user_balance,
			owner,
		})
	}

	async fn read(&self, contract: Address, data: Vec<u8>, block: u64) -> Result<Bytes, RpcError> {
		let request = CallRequest {
			from: None,
			to: contract,
			value: None,
			data: data.into(),
		};
		self.chain.call(&request, block).await
	}
}

/// Distinct block numbers across any number of log lists, ascending.
pub fn distinct_blocks<'a>(logs: impl IntoIterator<Item = &'a RawLog>) -> Vec<u64> {
	logs.into_iter()
		.map(|log| log.block_number)
		.collect::<BTreeSet<_>>()
		.into_iter()
		.collect()
}
