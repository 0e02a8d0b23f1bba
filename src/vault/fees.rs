//! Fee estimation for vault deposits and withdrawals.
//!
//! `FeeEstimator` prices one call to the vault contract. `AmountInput` sits in front of it for
//! amounts that are still being typed: inputs are debounced, unparseable or non-positive
//! amounts are ignored, and an estimate is only delivered if no newer input arrived meanwhile.

use crate::config::FeeConfig;
use crate::rpc::abi::{depositCall, withdrawCall};
use crate::rpc::{CallRequest, ChainReader, RpcError};
use crate::utils::{format_token_amount, parse_amount};
use crate::vault::sync::rate_limit::{Debouncer, Sink};
use crate::vault::sync::retry::{RetryExecutor, RetryState};
use crate::vault::types::{SharedError, TrackerError};

use alloy_primitives::{Address, Bytes, U256};
use alloy_sol_types::SolCall;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Decimals shown for fee amounts
pub const FEE_DISPLAY_PRECISION: usize = 6;

/// A state-changing call to the vault contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VaultAction {
	/// `deposit()` payable, the amount travels as call value
	Deposit,
	/// `withdraw(uint256 amount)`
	Withdraw,
}

impl VaultAction {
	pub fn signature(&self) -> &'static str {
		match self {
			VaultAction::Deposit => depositCall::SIGNATURE,
			VaultAction::Withdraw => withdrawCall::SIGNATURE,
		}
	}

	pub fn selector(&self) -> [u8; 4] {
		match self {
			VaultAction::Deposit => depositCall::SELECTOR,
			VaultAction::Withdraw => withdrawCall::SELECTOR,
		}
	}

	/// ABI-encoded calldata for `amount` wei
	pub fn calldata(&self, amount: U256) -> Bytes {
		let data = match self {
			VaultAction::Deposit => depositCall {}.abi_encode(),
			VaultAction::Withdraw => withdrawCall { amount }.abi_encode(),
		};
		Bytes::from(data)
	}

	/// The `eth_estimateGas` call object for this action
	pub fn call_request(&self, contract: Address, amount: U256, from: Option<Address>) -> CallRequest {
		CallRequest {
			from,
			to: contract,
			value: match self {
				VaultAction::Deposit => Some(amount),
				VaultAction::Withdraw => None,
			},
			data: self.calldata(amount),
		}
	}
}

impl fmt::Display for VaultAction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			VaultAction::Deposit => write!(f, "deposit"),
			VaultAction::Withdraw => write!(f, "withdraw"),
		}
	}
}

/// Gas, price and their product, all in wei except `gas`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeEstimate {
	pub gas: U256,
	pub gas_price: U256,
	pub fee: U256,
}

impl FeeEstimate {
	pub fn new(gas: U256, gas_price: U256) -> Self {
		Self {
			gas,
			gas_price,
			fee: gas.saturating_mul(gas_price),
		}
	}

	/// Fee in ether, truncated for display
	pub fn display_fee(&self) -> String {
		format_token_amount(self.fee, FEE_DISPLAY_PRECISION)
	}
}

/// Prices vault calls against the chain.
#[derive(Clone)]
pub struct FeeEstimator {
	chain: Arc<dyn ChainReader>,
	contract: Address,
	retry: RetryExecutor,
}

impl FeeEstimator {
	pub fn new(chain: Arc<dyn ChainReader>, contract: Address, retry: RetryExecutor) -> Self {
		Self {
			chain,
			contract,
			retry,
		}
	}

	/// Estimate the fee of `action` for `amount` wei sent from `from`.
	///
	/// Gas and gas price are read concurrently, each under the retry policy.
	pub async fn estimate(
		&self,
		action: VaultAction,
		amount: U256,
		from: Option<Address>,
	) -> Result<FeeEstimate, TrackerError> {
		let request = action.call_request(self.contract, amount, from);
		debug!("Estimating {} of {} wei", action, amount);

		let (gas, gas_price) = futures::try_join!(
			self.retried("eth_estimateGas", || self.chain.estimate_gas(&request)),
			self.retried("eth_gasPrice", || self.chain.gas_price()),
		)?;
		Ok(FeeEstimate::new(gas, gas_price))
	}

	async fn retried<F, Fut>(&self, label: &str, operation: F) -> Result<U256, TrackerError>
	where
		F: FnMut() -> Fut,
		Fut: std::future::Future<Output = Result<U256, RpcError>>,
	{
		let attempts = self.retry.policy().attempts();
		self.retry
			.execute_observed(operation, |state: &RetryState, e: &RpcError| {
				warn!("{} failed (attempt {} of {}), retrying: {}", label, state.attempt, attempts, e);
			})
			.await
			.map_err(TrackerError::from)
	}
}

/// Estimate delivered for one typed input
#[derive(Debug, Clone)]
pub struct FeeQuote {
	/// The text the estimate was made for
	pub input: String,
	pub amount: U256,
	pub result: Result<FeeEstimate, SharedError>,
}

/// Receiver of fee quotes
pub type QuoteSink = Arc<dyn Fn(FeeQuote) + Send + Sync>;

/// Debounced fee estimation for an amount field.
pub struct AmountInput {
	debouncer: Debouncer<String>,
	generation: Arc<AtomicU64>,
}

impl AmountInput {
	/// Must be called within a tokio runtime.
	pub fn new(
		estimator: FeeEstimator,
		action: VaultAction,
		from: Option<Address>,
		quiet: Duration,
		on_quote: QuoteSink,
	) -> Self {
		let generation = Arc::new(AtomicU64::new(0));
		let estimator = Arc::new(estimator);

		let current = generation.clone();
		let sink: Sink<String> = Arc::new(move |input: String| {
			let Some(amount) = parse_amount(&input) else {
				debug!("Ignoring amount input {:?}", input);
				return;
			};
			let issued = current.load(Ordering::SeqCst);
			let estimator = estimator.clone();
			let current = current.clone();
			let on_quote = on_quote.clone();
			tokio::spawn(async move {
				let result = estimator.estimate(action, amount, from).await.map_err(Arc::new);
				if current.load(Ordering::SeqCst) != issued {
					debug!("Dropping fee estimate for superseded input {:?}", input);
					return;
				}
				on_quote(FeeQuote {
					input,
					amount,
					result,
				});
			});
		});

		Self {
			debouncer: Debouncer::new(quiet, sink),
			generation,
		}
	}

	/// An input whose quiet period is the configured `fees.debounce`.
	pub fn from_config(
		estimator: FeeEstimator,
		action: VaultAction,
		from: Option<Address>,
		config: &FeeConfig,
		on_quote: QuoteSink,
	) -> Self {
		Self::new(estimator, action, from, config.debounce, on_quote)
	}

	/// Record the field's new text.
	pub fn set(&self, input: impl Into<String>) {
		self.generation.fetch_add(1, Ordering::SeqCst);
		self.debouncer.push(input.into());
	}

	/// Whether typed input is still waiting for its quiet period
	pub fn is_pending(&self) -> bool {
		self.debouncer.is_pending()
	}
}
