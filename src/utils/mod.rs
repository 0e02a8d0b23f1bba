//!
//! Utility module for the vault tracker.
//!
//! Re-exports formatting helpers and serde adapters used throughout the codebase.
/// Serde adapters for millisecond durations
pub mod duration;
/// Utility functions for formatting and display
pub mod index;

pub use index::{format_balance, format_token_amount, parse_amount, truncate_address};
