//! Chain module - boundary to the destination chain's command-line tool
//!
//! This module provides:
//! - The `ChainClient` capability trait the coordinator depends on
//! - A concrete client that shells out to a Cosmos-style CLI
//! - Parsing of the tool's structured (JSON) output into typed results

pub mod cli;
pub mod output;

pub use cli::CliChainClient;

use crate::error::ToolError;
use crate::swap::Signature;

use async_trait::async_trait;
use num_bigint::BigUint;
use serde::Deserialize;

pub type ToolResult<T> = Result<T, ToolError>;

/// On-chain record of a token swap as reported by the tool
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SwapQueryResult {
    pub done: bool,
}

/// Operations the relayer needs from the destination chain.
///
/// Every call may take seconds and is cancelled by dropping the future.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Build, without submitting, a mint transaction from the multisig account
    async fn generate_unsigned_transaction(
        &self,
        eth_tx_hash: &str,
        sender_address: &str,
        amount: &BigUint,
        recipient_address: &str,
    ) -> ToolResult<serde_json::Value>;

    /// Read-only lookup of the on-chain swap record
    async fn query_swap_status(&self, eth_tx_hash: &str) -> ToolResult<SwapQueryResult>;

    /// Produce `signer`'s partial signature with its local key
    async fn co_sign(&self, unsigned_tx: &serde_json::Value, signer: &str)
        -> ToolResult<String>;

    /// Merge partial signatures into the multisig transaction and broadcast it.
    /// Returns the destination-chain transaction hash.
    async fn combine_and_broadcast(
        &self,
        unsigned_tx: &serde_json::Value,
        signatures: &[Signature],
    ) -> ToolResult<String>;
}
