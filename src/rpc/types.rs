//! Types for JSON-RPC log and block queries against the vault contract

use super::abi;
use alloy_primitives::{Address, B256, Bytes, U64, U256};
use alloy_sol_types::SolEvent;
use serde::{Deserialize, Serialize};

/// The two event shapes emitted by the vault contract.
///
/// Both carry `address indexed user` in topic slot 1 and a single
/// non-indexed `uint256 amount` in the log data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// `Deposit(address indexed user, uint256 amount)`
    Deposit,
    /// `Withdrawal(address indexed user, uint256 amount)`
    Withdrawal,
}

impl EventKind {
    /// Canonical event signature used to derive topic 0
    pub fn signature(&self) -> &'static str {
        match self {
            EventKind::Deposit => abi::Deposit::SIGNATURE,
            EventKind::Withdrawal => abi::Withdrawal::SIGNATURE,
        }
    }

    /// Topic 0 of logs of this kind
    pub fn topic(&self) -> B256 {
        match self {
            EventKind::Deposit => abi::Deposit::SIGNATURE_HASH,
            EventKind::Withdrawal => abi::Withdrawal::SIGNATURE_HASH,
        }
    }

    /// Decode `(user, amount)` from the topics and data of a log of this kind.
    pub fn decode_args(&self, topics: &[B256], data: &[u8]) -> Result<(Address, U256), alloy_sol_types::Error> {
        let topics = topics.iter().copied();
        match self {
            EventKind::Deposit => {
                abi::Deposit::decode_raw_log(topics, data, true).map(|event| (event.user, event.amount))
            }
            EventKind::Withdrawal => {
                abi::Withdrawal::decode_raw_log(topics, data, true).map(|event| (event.user, event.amount))
            }
        }
    }
}

/// Inclusive block range for a single `eth_getLogs` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    /// Number of blocks covered, zero for an inverted range.
    pub fn len(&self) -> u64 {
        if self.to < self.from {
            0
        } else {
            self.to - self.from + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Split into consecutive sub-ranges of at most `max_span` blocks.
    pub fn chunks(&self, max_span: u64) -> Vec<BlockRange> {
        let max_span = max_span.max(1);
        let mut chunks = Vec::new();
        let mut from = self.from;
        while from <= self.to {
            let to = from.saturating_add(max_span - 1).min(self.to);
            chunks.push(BlockRange::new(from, to));
            if to == u64::MAX {
                break;
            }
            from = to + 1;
        }
        chunks
    }
}

/// Filter for one log query: one contract, one event kind, optional user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Address,
    pub kind: EventKind,
    /// Matches the indexed `user` argument when set
    pub user: Option<Address>,
    pub range: BlockRange,
}

impl LogFilter {
    /// JSON parameter object for `eth_getLogs`.
    pub fn to_params(&self) -> serde_json::Value {
        let user_topic = self
            .user
            .map(|user| serde_json::Value::String(user.into_word().to_string()))
            .unwrap_or(serde_json::Value::Null);

        serde_json::json!({
            "address": self.address.to_string(),
            "topics": [self.kind.topic().to_string(), user_topic],
            "fromBlock": format!("{:#x}", self.range.from),
            "toBlock": format!("{:#x}", self.range.to),
        })
    }
}

/// A decoded vault log as returned by the chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawLog {
    pub transaction_hash: B256,
    pub block_number: u64,
    pub log_index: u64,
    /// The indexed `user` argument
    pub user: Address,
    /// The `amount` argument, in wei
    pub amount: U256,
}

/// Log object as serialized by `eth_getLogs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub topics: Vec<B256>,
    pub data: Bytes,
    /// Absent for pending logs
    pub block_number: Option<U64>,
    pub transaction_hash: Option<B256>,
    pub log_index: Option<U64>,
    /// Set when the log was dropped by a reorg
    #[serde(default)]
    pub removed: bool,
}

impl RpcLog {
    /// Decode into a [`RawLog`] of `kind`.
    ///
    /// Returns `Ok(None)` for pending or removed logs, which carry no stable
    /// position in the chain.
    pub fn decode(self, kind: EventKind) -> Result<Option<RawLog>, RpcError> {
        if self.removed {
            return Ok(None);
        }
        let (Some(block_number), Some(log_index), Some(transaction_hash)) =
            (self.block_number, self.log_index, self.transaction_hash)
        else {
            return Ok(None);
        };

        let (user, amount) = kind.decode_args(&self.topics, &self.data).map_err(|e| {
            RpcError::MalformedLog(format!(
                "{:?} log {}:{} does not decode: {}",
                kind, transaction_hash, log_index, e
            ))
        })?;

        Ok(Some(RawLog {
            transaction_hash,
            block_number: block_number.to::<u64>(),
            log_index: log_index.to::<u64>(),
            user,
            amount,
        }))
    }
}

/// Block header fields needed for timestamp resolution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    /// Unix seconds
    pub timestamp: u64,
}

/// Block object as serialized by `eth_getBlockByNumber`.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcBlock {
    pub number: U64,
    pub timestamp: U64,
}

impl From<RpcBlock> for BlockHeader {
    fn from(block: RpcBlock) -> Self {
        Self {
            number: block.number.to::<u64>(),
            timestamp: block.timestamp.to::<u64>(),
        }
    }
}

/// Call object for `eth_estimateGas` and `eth_call`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Address>,
    pub to: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<U256>,
    pub data: Bytes,
}

/// JSON-RPC code wallets use for an explicitly declined request (EIP-1193).
pub const USER_REJECTED_CODE: i64 = 4001;

/// Error types for chain reads
#[allow(clippy::enum_variant_names)]
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("HTTP status {0}")]
    StatusError(u16),

    #[error("JSON-RPC error {code}: {message}")]
    JsonRpcError { code: i64, message: String },

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("No data returned")]
    NoData,

    #[error("Block {0} not found")]
    BlockNotFound(u64),

    #[error("Block {block} has out-of-range timestamp {timestamp}")]
    InvalidTimestamp { block: u64, timestamp: u64 },

    #[error("Malformed log: {0}")]
    MalformedLog(String),

    #[error("User rejected the request: {0}")]
    UserRejected(String),

    #[error("ABI decode error: {0}")]
    AbiError(#[from] alloy_sol_types::Error),

    #[error("Node serves chain {actual}, expected {expected}")]
    WrongChain { expected: u64, actual: u64 },
}

impl RpcError {
    /// Build from a JSON-RPC error object, recognising explicit declines.
    pub fn from_rpc(code: i64, message: String) -> Self {
        if code == USER_REJECTED_CODE || message.to_lowercase().contains("user rejected") {
            RpcError::UserRejected(message)
        } else {
            RpcError::JsonRpcError { code, message }
        }
    }

    /// Whether retrying could succeed. An explicit user decline and a wrong chain are final.
    pub fn is_transient(&self) -> bool {
        match self {
            RpcError::UserRejected(_) | RpcError::WrongChain { .. } => false,
            RpcError::JsonRpcError { message, .. } => {
                !message.to_lowercase().contains("user rejected")
            }
            _ => true,
        }
    }
}
