//! Chain-read integration for the vault contract
//!
//! This module provides the [`ChainReader`] trait, its JSON-RPC implementation, and the
//! wire types for log queries, block lookups, contract reads, and gas estimation.

/// Solidity bindings for the vault contract
pub mod abi;
/// JSON-RPC client and the `ChainReader` trait
mod client;
/// In-memory chain used by tests
#[cfg(test)]
pub(crate) mod mock;
/// Type definitions for chain data structures
mod types;

pub use client::{ChainReader, JsonRpcClient, verify_chain};
pub use types::*;
