use alloy_primitives::utils::{format_ether, parse_ether};
use alloy_primitives::{Address, I256, U256};

/// Render a wei amount as ether with at most `precision` decimals.
///
/// Extra digits are cut off, never rounded, so a displayed balance is never higher than the
/// real one.
pub fn format_token_amount(amount: U256, precision: usize) -> String {
    let full = format_ether(amount);
    match full.split_once('.') {
        Some((whole, _)) if precision == 0 => whole.to_string(),
        Some((whole, fraction)) => {
            let digits = &fraction[..precision.min(fraction.len())];
            format!("{}.{:0<width$}", whole, digits, width = precision)
        }
        None => full,
    }
}

/// Signed variant of [`format_token_amount`] for running balances.
pub fn format_balance(balance: I256, precision: usize) -> String {
    let magnitude = format_token_amount(balance.unsigned_abs(), precision);
    if balance.is_negative() {
        format!("-{}", magnitude)
    } else {
        magnitude
    }
}

/// `0x1234...abcd` form of a checksummed address
pub fn truncate_address(address: &Address) -> String {
    let checksummed = address.to_checksum(None);
    format!("{}...{}", &checksummed[..6], &checksummed[checksummed.len() - 4..])
}

/// Parse a typed ether amount into wei. Returns `None` unless it is a positive number.
pub fn parse_amount(input: &str) -> Option<U256> {
    let input = input.trim();
    if input.is_empty() || input.starts_with('-') {
        return None;
    }
    parse_ether(input).ok().filter(|amount| !amount.is_zero())
}
