use super::abi::{getBalanceCall, ownerCall};
use super::{BlockHeader, CallRequest, ChainReader, EventKind, LogFilter, RawLog, RpcError};
use alloy_primitives::{Address, B256, Bytes, U256, address, utils::parse_ether};
use alloy_sol_types::{SolCall, SolValue};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

pub(crate) const VAULT: Address = address!("2d71De053e0DEFbCE58D609E36568d874D07e1a5");
pub(crate) const ALICE: Address = address!("00000000000000000000000000000000000000a1");
pub(crate) const BOB: Address = address!("00000000000000000000000000000000000000b0");
pub(crate) const OWNER: Address = address!("00000000000000000000000000000000000000ee");

/// Chain id reported by the mock chain
pub(crate) const CHAIN_ID: u64 = 8453;

/// Unix seconds for `block` in the mock chain.
pub(crate) fn block_time(block: u64) -> u64 {
	1_700_000_000 + block * 12
}

pub(crate) fn ether(value: &str) -> U256 {
	parse_ether(value).expect("valid ether literal")
}

pub(crate) fn raw_log(block_number: u64, log_index: u64, user: Address, amount: &str) -> RawLog {
	let mut hash = [0u8; 32];
	hash[..8].copy_from_slice(&block_number.to_be_bytes());
	hash[8..16].copy_from_slice(&log_index.to_be_bytes());
	RawLog {
		transaction_hash: B256::from(hash),
		block_number,
		log_index,
		user,
		amount: ether(amount),
	}
}

#[derive(Default)]
pub(crate) struct MockState {
	pub head: u64,
	pub deposits: Vec<RawLog>,
	pub withdrawals: Vec<RawLog>,
	pub timestamps: HashMap<u64, u64>,
	/// Per `block_number` call: latency and the head to report
	pub scripted_heads: VecDeque<(Duration, u64)>,
	pub log_failures: VecDeque<RpcError>,
	pub block_failures: VecDeque<RpcError>,
	pub log_queries: Vec<LogFilter>,
	pub block_queries: Vec<u64>,
	pub gas: U256,
	pub gas_price: U256,
	pub estimate_failures: VecDeque<RpcError>,
	pub estimate_requests: Vec<CallRequest>,
	pub chain_id: u64,
	/// Ether held per address
	pub balances: HashMap<Address, U256>,
	/// `getBalance(user)` results
	pub vault_balances: HashMap<Address, U256>,
	pub owner: Address,
	/// Blocks at which balances and calls were read
	pub read_blocks: Vec<u64>,
}

/// In-memory chain with scripted latency and failures.
#[derive(Default)]
pub(crate) struct MockChain {
	pub state: Mutex<MockState>,
}

impl MockChain {
	/// Deposit 1.0 at block 10, deposit 0.5 at block 12, withdrawal 0.3 at block 15.
	pub fn scenario() -> Self {
		let chain = MockChain::default();
		{
			let mut state = chain.state.lock().unwrap();
			state.head = 20;
			state.deposits = vec![raw_log(10, 0, ALICE, "1.0"), raw_log(12, 0, ALICE, "0.5")];
			state.withdrawals = vec![raw_log(15, 1, ALICE, "0.3")];
			for block in 0..=20 {
				state.timestamps.insert(block, block_time(block));
			}
			state.gas = U256::from(21_000u64);
			state.gas_price = U256::from(1_000_000_000u64);
			state.chain_id = CHAIN_ID;
			state.balances.insert(VAULT, ether("1.2"));
			state.vault_balances.insert(ALICE, ether("1.2"));
			state.owner = OWNER;
		}
		chain
	}

	pub fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
		f(&mut self.state.lock().unwrap())
	}
}

#[async_trait::async_trait]
impl ChainReader for MockChain {
	async fn query_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, RpcError> {
		let mut state = self.state.lock().unwrap();
		state.log_queries.push(filter.clone());
		if let Some(error) = state.log_failures.pop_front() {
			return Err(error);
		}
		let source = match filter.kind {
			EventKind::Deposit => &state.deposits,
			EventKind::Withdrawal => &state.withdrawals,
		};
		Ok(source
			.iter()
			.filter(|log| log.block_number >= filter.range.from && log.block_number <= filter.range.to)
			.filter(|log| filter.user.is_none_or(|user| user == log.user))
			.cloned()
			.collect())
	}

	async fn get_block(&self, number: u64) -> Result<BlockHeader, RpcError> {
		let mut state = self.state.lock().unwrap();
		state.block_queries.push(number);
		if let Some(error) = state.block_failures.pop_front() {
			return Err(error);
		}
		state
			.timestamps
			.get(&number)
			.map(|timestamp| BlockHeader {
				number,
				timestamp: *timestamp,
			})
			.ok_or(RpcError::BlockNotFound(number))
	}

	async fn block_number(&self) -> Result<u64, RpcError> {
		let scripted = self.state.lock().unwrap().scripted_heads.pop_front();
		match scripted {
			Some((latency, head)) => {
				tokio::time::sleep(latency).await;
				Ok(head)
			}
			None => Ok(self.state.lock().unwrap().head),
		}
	}

	async fn estimate_gas(&self, request: &CallRequest) -> Result<U256, RpcError> {
		let mut state = self.state.lock().unwrap();
		state.estimate_requests.push(request.clone());
		if let Some(error) = state.estimate_failures.pop_front() {
			return Err(error);
		}
		Ok(state.gas)
	}

	async fn gas_price(&self) -> Result<U256, RpcError> {
		Ok(self.state.lock().unwrap().gas_price)
	}

	async fn chain_id(&self) -> Result<u64, RpcError> {
		Ok(self.state.lock().unwrap().chain_id)
	}

	async fn get_balance(&self, address: Address, block: u64) -> Result<U256, RpcError> {
		let mut state = self.state.lock().unwrap();
		state.read_blocks.push(block);
		Ok(state.balances.get(&address).copied().unwrap_or_default())
	}

	async fn call(&self, request: &CallRequest, block: u64) -> Result<Bytes, RpcError> {
		let mut state = self.state.lock().unwrap();
		state.read_blocks.push(block);
		if let Ok(call) = getBalanceCall::abi_decode(&request.data, true) {
			let balance = state.vault_balances.get(&call.user).copied().unwrap_or_default();
			return Ok(balance.abi_encode().into());
		}
		if request.data.starts_with(&ownerCall::SELECTOR) {
			return Ok(state.owner.abi_encode().into());
		}
		Err(RpcError::from_rpc(-32000, "execution reverted".into()))
	}
}
