use alloy_primitives::Address;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use vault_state_sync::config::Config;
use vault_state_sync::rpc::{JsonRpcClient, RpcError, verify_chain};
use vault_state_sync::utils::{format_balance, format_token_amount, parse_amount, truncate_address};
use vault_state_sync::vault::sync::SessionOutcome;
use vault_state_sync::vault::sync::events::TrackerEvent;
use vault_state_sync::vault::sync::retry::RetryExecutor;
use vault_state_sync::vault::{
	AmountInput, FeeEstimator, FeeQuote, SharedError, TrackerError, TrackingScope, VaultAction,
	VaultTracker,
};

/// Decimals shown for balances and totals
const DISPLAY_PRECISION: usize = 4;

#[derive(Parser)]
#[command(name = "vault-state-sync", version, about = "Track derived state of an on-chain vault")]
struct Cli {
	/// TOML configuration file
	#[arg(short, long)]
	config: Option<PathBuf>,

	/// Track a single user instead of the whole vault
	#[arg(short, long)]
	user: Option<Address>,

	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
	/// Poll the vault and log every state change until Ctrl-C
	Watch {
		/// Poll interval override in milliseconds
		#[arg(long)]
		interval_ms: Option<u64>,
	},
	/// Refresh once and print the snapshot as JSON
	Snapshot,
	/// Estimate the fee of a deposit or withdrawal
	Fee {
		#[arg(value_enum)]
		action: ActionArg,
		/// Amount in ether
		amount: String,
	},
	/// Read amounts from stdin as they are typed and quote the fee of the latest one
	Quote {
		#[arg(value_enum)]
		action: ActionArg,
	},
}

#[derive(Clone, Copy, ValueEnum)]
enum ActionArg {
	Deposit,
	Withdraw,
}

impl From<ActionArg> for VaultAction {
	fn from(action: ActionArg) -> Self {
		match action {
			ActionArg::Deposit => VaultAction::Deposit,
			ActionArg::Withdraw => VaultAction::Withdraw,
		}
	}
}

#[derive(Debug, thiserror::Error)]
enum CliError {
	#[error("RPC error: {0}")]
	Rpc(#[from] RpcError),

	#[error("{0}")]
	Tracker(#[from] TrackerError),

	#[error("Refresh failed: {0}")]
	Refresh(SharedError),

	#[error("Refresh was discarded: {0:?}")]
	Discarded(SessionOutcome),

	#[error("Serialization error: {0}")]
	Serialize(#[from] serde_json::Error),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
	let cli = Cli::parse();

	let mut config = match Config::load(cli.config.as_deref()) {
		Ok(config) => config,
		Err(e) => {
			eprintln!("{}", e);
			return ExitCode::FAILURE;
		}
	};
	if cli.user.is_some() {
		config.vault.user = cli.user;
	}

	init_tracing(&config.logging.level);

	let command = cli.command.unwrap_or(Command::Watch { interval_ms: None });
	match run(command, config).await {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			error!("{}", e);
			ExitCode::FAILURE
		}
	}
}

fn init_tracing(level: &str) {
	let default_level = level.parse().unwrap_or(tracing::Level::INFO);
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::builder()
				.with_default_directive(default_level.into())
				.from_env_lossy(),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();
}

async fn run(command: Command, config: Config) -> Result<(), CliError> {
	let chain = Arc::new(JsonRpcClient::new(
		config.rpc.url.clone(),
		config.rpc.request_timeout,
	)?);
	info!("Using node {}", chain.rpc_url());
	verify_chain(chain.as_ref(), config.rpc.chain_id).await?;

	let scope = match config.vault.user {
		Some(user) => TrackingScope::for_user(config.vault.contract, user),
		None => TrackingScope::vault_wide(config.vault.contract),
	};

	match command {
		Command::Watch { interval_ms } => {
			let interval = interval_ms
				.map(Duration::from_millis)
				.unwrap_or(config.sync.poll_interval);
			let tracker = VaultTracker::new(chain, &config.sync)?;

			let subscription = tracker.subscribe(scope, log_event);
			let _ = tracker.request_refresh(scope);
			tracker.start_polling(scope, interval);

			info!("Watching {} (Ctrl-C to stop)", describe(&scope));
			tokio::signal::ctrl_c().await?;

			tracker.stop_polling(&scope);
			subscription.unsubscribe();
			info!("Stopped watching");
			Ok(())
		}
		Command::Snapshot => {
			let tracker = VaultTracker::new(chain, &config.sync)?;
			match tracker.refresh(scope).await {
				SessionOutcome::Applied => {
					if let Some(snapshot) = tracker.snapshot(&scope) {
						println!("{}", serde_json::to_string_pretty(&*snapshot)?);
					}
					Ok(())
				}
				SessionOutcome::Failed => match tracker.last_error(&scope) {
					Some(e) => Err(CliError::Refresh(e)),
					None => Err(CliError::Discarded(SessionOutcome::Failed)),
				},
				outcome => Err(CliError::Discarded(outcome)),
			}
		}
		Command::Fee { action, amount } => {
			let wei = parse_amount(&amount)
				.ok_or_else(|| TrackerError::InvalidAmount(amount.clone()))?;
			let action = VaultAction::from(action);
			let estimator = FeeEstimator::new(
				chain,
				config.vault.contract,
				RetryExecutor::new(config.sync.retry.clone()),
			);

			let estimate = estimator.estimate(action, wei, config.vault.user).await?;
			info!(
				"Calldata for {} of {} ETH: 0x{}",
				action,
				amount,
				hex::encode(action.calldata(wei))
			);
			println!(
				"Estimated fee for {} of {} ETH: ~{} ETH ({} gas at {} wei)",
				action,
				amount,
				estimate.display_fee(),
				estimate.gas,
				estimate.gas_price
			);
			Ok(())
		}
		Command::Quote { action } => {
			let action = VaultAction::from(action);
			let estimator = FeeEstimator::new(
				chain,
				config.vault.contract,
				RetryExecutor::new(config.sync.retry.clone()),
			);
			let (sender, mut quotes) = tokio::sync::mpsc::unbounded_channel::<FeeQuote>();
			let input = AmountInput::from_config(
				estimator,
				action,
				config.vault.user,
				&config.fees,
				Arc::new(move |quote: FeeQuote| {
					let _ = sender.send(quote);
				}),
			);

			info!("Enter {} amounts in ETH, one per line (Ctrl-D to finish)", action);
			let mut lines = BufReader::new(tokio::io::stdin()).lines();
			let mut awaiting = false;
			loop {
				tokio::select! {
					line = lines.next_line() => match line? {
						Some(line) => {
							awaiting = parse_amount(line.trim()).is_some();
							input.set(line.trim());
						}
						None => break,
					},
					Some(quote) = quotes.recv() => {
						awaiting = false;
						print_quote(action, &quote);
					}
				}
			}

			if awaiting {
				let grace = config.fees.debounce + config.rpc.request_timeout;
				if let Ok(Some(quote)) = tokio::time::timeout(grace, quotes.recv()).await {
					print_quote(action, &quote);
				}
			}
			Ok(())
		}
	}
}

fn print_quote(action: VaultAction, quote: &FeeQuote) {
	match &quote.result {
		Ok(estimate) => println!(
			"Estimated fee for {} of {} ETH: ~{} ETH",
			action,
			quote.input,
			estimate.display_fee()
		),
		Err(e) => error!("Estimate for {} of {} ETH failed: {}", action, quote.input, e),
	}
}

fn describe(scope: &TrackingScope) -> String {
	match scope.user {
		Some(user) => format!(
			"vault {} for {}",
			truncate_address(&scope.contract),
			truncate_address(&user)
		),
		None => format!("vault {}", truncate_address(&scope.contract)),
	}
}

fn log_event(event: &TrackerEvent) {
	match event {
		TrackerEvent::StateChanged {
			scope,
			session,
			snapshot,
		} => {
			info!(
				"{} at block {} (session {}): balance {} ETH, deposited {} ETH, withdrawn {} ETH, {} transactions",
				describe(scope),
				snapshot.head_block,
				session,
				format_balance(snapshot.current_balance(), DISPLAY_PRECISION),
				format_token_amount(snapshot.aggregate.total_deposits, DISPLAY_PRECISION),
				format_token_amount(snapshot.aggregate.total_withdrawals, DISPLAY_PRECISION),
				snapshot.ledger.len()
			);
			let live = &snapshot.live;
			info!(
				"Vault holds {} ETH, owned by {}",
				format_token_amount(live.contract_balance, DISPLAY_PRECISION),
				truncate_address(&live.owner)
			);
			if let (Some(user), Some(balance)) = (scope.user, live.user_balance) {
				info!(
					"Vault balance of {}: {} ETH{}",
					truncate_address(&user),
					format_token_amount(balance, DISPLAY_PRECISION),
					if live.is_owner(&user) { " (owner)" } else { "" }
				);
			}
		}
		TrackerEvent::RefreshFailed {
			scope,
			session,
			error,
		} => {
			error!(
				"Refresh of {} failed (session {}), showing last good state: {}",
				describe(scope),
				session,
				error
			);
		}
	}
}
