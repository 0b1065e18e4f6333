//! Durable swap state
//!
//! Handles:
//! - Swap records keyed by source-chain transaction hash
//! - Append-only co-signer signatures, unique per (swap, signer)
//! - Guarded status transitions (compare-and-set on the status field)
//! - Quorum detection queries

mod memory;
mod postgres;

pub use memory::MemorySwapStore;
pub use postgres::PgSwapStore;

use crate::config::{DatabaseBackend, DatabaseConfig};
use crate::error::{RelayerError, RelayerResult};
use crate::swap::{QuorumCandidate, Signature, Swap, SwapStatus};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Storage contract the coordinator depends on.
///
/// Every mutation must be atomic at the storage layer: inserts are
/// insert-if-absent and status changes are compare-and-set. Coordinators
/// may run as several independent processes against the same store.
#[async_trait]
pub trait SwapStateStore: Send + Sync {
    /// Insert a new swap. Fails with `DuplicateSwap` if the hash exists.
    async fn create_swap(&self, swap: &Swap) -> RelayerResult<()>;

    async fn get_swap(&self, tx_hash: &str) -> RelayerResult<Option<Swap>>;

    /// Insert a signature unless (tx_hash, user) is present.
    /// Returns whether a new row was written.
    async fn append_signature(&self, signature: &Signature) -> RelayerResult<bool>;

    async fn count_signatures(&self, tx_hash: &str) -> RelayerResult<usize>;

    /// Signatures for a swap in arrival order
    async fn list_signatures(&self, tx_hash: &str) -> RelayerResult<Vec<Signature>>;

    async fn list_swaps_by_status(&self, status: SwapStatus) -> RelayerResult<Vec<Swap>>;

    /// UNSIGNED swaps with at least `threshold` signatures, each with its full set
    async fn list_swaps_at_or_above_threshold(
        &self,
        threshold: usize,
    ) -> RelayerResult<Vec<QuorumCandidate>>;

    /// Move a swap from `expected` to `next`.
    ///
    /// Fails with `StaleTransition` when the stored status is not `expected`.
    /// `mint_tx_hash`, when given, is written in the same update.
    async fn transition_status(
        &self,
        tx_hash: &str,
        expected: SwapStatus,
        next: SwapStatus,
        mint_tx_hash: Option<&str>,
    ) -> RelayerResult<Swap>;

    /// Store the destination-chain hash on a swap that has none, whatever
    /// its status. Used when a broadcast landed after the swap moved on.
    async fn record_mint_hash(&self, tx_hash: &str, mint_tx_hash: &str) -> RelayerResult<()>;

    /// Swaps in any of `statuses` not updated since `older_than`
    async fn list_stale(
        &self,
        statuses: &[SwapStatus],
        older_than: DateTime<Utc>,
    ) -> RelayerResult<Vec<Swap>>;

    async fn stats(&self) -> RelayerResult<SwapStats>;

    async fn health_check(&self) -> RelayerResult<()>;
}

/// Swap counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SwapStats {
    pub unsigned: u64,
    pub signed: u64,
    pub submitted: u64,
    pub confirmed: u64,
    pub failed: u64,
}

impl SwapStats {
    pub fn add(&mut self, status: SwapStatus, n: u64) {
        match status {
            SwapStatus::Unsigned => self.unsigned += n,
            SwapStatus::Signed => self.signed += n,
            SwapStatus::Submitted => self.submitted += n,
            SwapStatus::Confirmed => self.confirmed += n,
            SwapStatus::Failed => self.failed += n,
        }
    }

    pub fn get(&self, status: SwapStatus) -> u64 {
        match status {
            SwapStatus::Unsigned => self.unsigned,
            SwapStatus::Signed => self.signed,
            SwapStatus::Submitted => self.submitted,
            SwapStatus::Confirmed => self.confirmed,
            SwapStatus::Failed => self.failed,
        }
    }
}

/// Reject transitions that would move a swap backwards
pub(crate) fn check_transition(current: SwapStatus, next: SwapStatus) -> RelayerResult<()> {
    if current.can_transition_to(next) {
        Ok(())
    } else {
        Err(RelayerError::InvalidStateTransition {
            from: current,
            to: next,
        })
    }
}

/// Open the configured store backend
pub async fn connect(config: &DatabaseConfig) -> RelayerResult<Arc<dyn SwapStateStore>> {
    match config.backend {
        DatabaseBackend::Postgres => {
            let store = PgSwapStore::new(config).await?;
            store.run_migrations().await?;
            Ok(Arc::new(store))
        }
        DatabaseBackend::Memory => {
            tracing::warn!("Using in-memory swap store; state is lost on restart");
            Ok(Arc::new(MemorySwapStore::new()))
        }
    }
}
