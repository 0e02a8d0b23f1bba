//!
//! JSON-RPC client for the chain node backing the vault.
//!
//! This module provides the [`ChainReader`] seam used by the sync engine and an HTTP
//! implementation of it. All methods are read-only, async, and safe to call from
//! several sessions at once.

use super::types::*;
use alloy_primitives::{Address, Bytes, U256};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use reqwest::Client;
use tracing::{debug, warn};

/// Read-only view of the chain consumed by the sync engine.
///
/// Implementations never retry; callers wrap each call in a retry policy.
#[async_trait::async_trait]
pub trait ChainReader: Send + Sync {
	/// Fetch the logs matching `filter` within its block range.
	async fn query_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, RpcError>;

	/// Fetch the header of block `number`.
	async fn get_block(&self, number: u64) -> Result<BlockHeader, RpcError>;

	/// Current head block number.
	async fn block_number(&self) -> Result<u64, RpcError>;

	/// Gas units a call would consume.
	async fn estimate_gas(&self, request: &CallRequest) -> Result<U256, RpcError>;

	/// Current gas price in wei.
	async fn gas_price(&self) -> Result<U256, RpcError>;

	/// Id of the chain the node serves.
	async fn chain_id(&self) -> Result<u64, RpcError>;

	/// Ether balance of `address` at block `block`.
	async fn get_balance(&self, address: Address, block: u64) -> Result<U256, RpcError>;

	/// Execute a read-only call at block `block` and return its raw output.
	async fn call(&self, request: &CallRequest, block: u64) -> Result<Bytes, RpcError>;
}

/// Fail with [`RpcError::WrongChain`] unless `chain` serves chain `expected`.
pub async fn verify_chain(chain: &dyn ChainReader, expected: u64) -> Result<(), RpcError> {
	let actual = chain.chain_id().await?;
	if actual != expected {
		return Err(RpcError::WrongChain { expected, actual });
	}
	debug!("Node serves chain {}", actual);
	Ok(())
}

/// HTTP JSON-RPC 2.0 client
pub struct JsonRpcClient {
	/// The underlying HTTP client.
	http_client: Client,
	/// The node endpoint.
	rpc_url: String,
	/// Request id counter.
	next_id: AtomicU64,
}

impl JsonRpcClient {
	/// Create a new JSON-RPC client.
	///
	/// # Arguments
	/// * `rpc_url` - The HTTP endpoint of the node.
	/// * `request_timeout` - Per-request timeout applied by the HTTP client.
	///
	/// # Errors
	/// Returns `RpcError::HttpError` if the HTTP client cannot be built.
	pub fn new(rpc_url: String, request_timeout: Duration) -> Result<Self, RpcError> {
		let http_client = Client::builder().timeout(request_timeout).build()?;

		Ok(Self {
			http_client,
			rpc_url,
			next_id: AtomicU64::new(1),
		})
	}

	/// The endpoint this client talks to.
	pub fn rpc_url(&self) -> &str {
		&self.rpc_url
	}

	/// Execute a JSON-RPC request and decode its `result` member.
	///
	/// # Arguments
	/// * `method` - The JSON-RPC method name.
	/// * `params` - Positional parameters.
	///
	/// # Returns
	/// The decoded result, or an `RpcError` for transport, status, or protocol failures.
	pub async fn execute_request<T: DeserializeOwned>(
		&self,
		method: &str,
		params: serde_json::Value,
	) -> Result<T, RpcError> {
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let request_body = json!({
			"jsonrpc": "2.0",
			"id": id,
			"method": method,
			"params": params
		});

		debug!("Sending {} (id {})", method, id);

		let response = self
			.http_client
			.post(&self.rpc_url)
			.header("Content-Type", "application/json")
			.json(&request_body)
			.send()
			.await?;

		if !response.status().is_success() {
			return Err(RpcError::StatusError(response.status().as_u16()));
		}

		let response_json: serde_json::Value = response.json().await?;

		if let Some(error) = response_json.get("error") {
			let code = error.get("code").and_then(|c| c.as_i64()).unwrap_or_default();
			let message = error
				.get("message")
				.and_then(|m| m.as_str())
				.unwrap_or("Unknown JSON-RPC error")
				.to_string();
			return Err(RpcError::from_rpc(code, message));
		}

		let result = response_json
			.get("result")
			.cloned()
			.ok_or(RpcError::NoData)?;

		Ok(serde_json::from_value(result)?)
	}
}

#[async_trait::async_trait]
impl ChainReader for JsonRpcClient {
	async fn query_logs(&self, filter: &LogFilter) -> Result<Vec<RawLog>, RpcError> {
		let logs: Vec<RpcLog> = self
			.execute_request("eth_getLogs", json!([filter.to_params()]))
			.await?;

		debug!(
			"eth_getLogs {:?} blocks {}..={} returned {} logs",
			filter.kind,
			filter.range.from,
			filter.range.to,
			logs.len()
		);

		let total = logs.len();
		let mut decoded = Vec::with_capacity(total);
		for log in logs {
			if let Some(raw) = log.decode(filter.kind)? {
				decoded.push(raw);
			}
		}
		if decoded.len() < total {
			warn!(
				"Skipped {} pending or removed {:?} logs",
				total - decoded.len(),
				filter.kind
			);
		}
		Ok(decoded)
	}

	async fn get_block(&self, number: u64) -> Result<BlockHeader, RpcError> {
		let block: Option<RpcBlock> = self
			.execute_request("eth_getBlockByNumber", json!([format!("{:#x}", number), false]))
			.await?;

		block
			.map(BlockHeader::from)
			.ok_or(RpcError::BlockNotFound(number))
	}

	async fn block_number(&self) -> Result<u64, RpcError> {
		let number: alloy_primitives::U64 = self.execute_request("eth_blockNumber", json!([])).await?;
		Ok(number.to::<u64>())
	}

	async fn estimate_gas(&self, request: &CallRequest) -> Result<U256, RpcError> {
		self.execute_request("eth_estimateGas", json!([request])).await
	}

	async fn gas_price(&self) -> Result<U256, RpcError> {
		self.execute_request("eth_gasPrice", json!([])).await
	}

	async fn chain_id(&self) -> Result<u64, RpcError> {
		let id: alloy_primitives::U64 = self.execute_request("eth_chainId", json!([])).await?;
		Ok(id.to::<u64>())
	}

	async fn get_balance(&self, address: Address, block: u64) -> Result<U256, RpcError> {
		self.execute_request("eth_getBalance", json!([address, format!("{:#x}", block)]))
			.await
	}

	async fn call(&self, request: &CallRequest, block: u64) -> Result<Bytes, RpcError> {
		self.execute_request("eth_call", json!([request, format!("{:#x}", block)]))
			.await
	}
}
