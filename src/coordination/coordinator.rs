//! Swap lifecycle coordinator
//!
//! Drives each swap through `UNSIGNED -> SIGNED -> SUBMITTED -> CONFIRMED`,
//! with `FAILED` reachable from any non-terminal state. All status changes
//! go through the store's compare-and-set, so several coordinators can share
//! one store: whichever wins `UNSIGNED -> SIGNED` is the only one that
//! broadcasts.

use crate::chain::{ChainClient, ToolResult};
use crate::config::RelayerConfig;
use crate::error::{RelayerError, RelayerResult, ToolError};
use crate::metrics;
use crate::state::SwapStateStore;
use crate::swap::{BurnEvent, Signature, Swap, SwapStatus, MAX_SIGNATURE_LEN};

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum RegisterOutcome {
    Registered(Swap),
    /// A swap with this transaction hash was already recorded
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureOutcome {
    Recorded { count: usize },
    /// This signer had already signed; nothing was written
    Duplicate { count: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    BelowThreshold { count: usize },
    /// Another worker owns the swap, or it is already past quorum
    AlreadyHandled { status: SwapStatus },
    Submitted { mint_tx_hash: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Confirmed,
    Pending,
    NotSubmitted { status: SwapStatus },
}

/// Result of one pass of a periodic driver
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: usize,
}

pub struct SwapCoordinator {
    store: Arc<dyn SwapStateStore>,
    chain: Arc<dyn ChainClient>,
    /// Limit applied to every chain tool call
    tool_timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
    max_concurrent_finalize: usize,
}

impl SwapCoordinator {
    pub fn new(
        store: Arc<dyn SwapStateStore>,
        chain: Arc<dyn ChainClient>,
        config: &RelayerConfig,
    ) -> Self {
        Self {
            store,
            chain,
            tool_timeout: config.tool_timeout(),
            max_retries: config.max_retries.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            max_concurrent_finalize: config.max_concurrent_finalize.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn SwapStateStore> {
        &self.store
    }

    async fn with_timeout<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = ToolResult<T>>,
    ) -> ToolResult<T> {
        match tokio::time::timeout(self.tool_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                operation: operation.to_string(),
            }),
        }
    }

    /// Record a burn as a new UNSIGNED swap with its generated mint tx.
    ///
    /// Redelivered burns are logged and ignored.
    pub async fn register_swap(&self, event: &BurnEvent) -> RelayerResult<RegisterOutcome> {
        event.validate()?;
        let tx_hash = event.swap_id();

        if self.store.get_swap(tx_hash).await?.is_some() {
            info!(tx_hash, "Ignoring duplicate burn event");
            metrics::record_duplicate_burn();
            return Ok(RegisterOutcome::Duplicate);
        }

        let unsigned_tx = self
            .with_timeout(
                "generate unsigned transaction",
                self.chain.generate_unsigned_transaction(
                    &event.eth_tx_hash,
                    &event.sender_address,
                    &event.amount,
                    &event.recipient_address,
                ),
            )
            .await?;

        let swap = Swap::from_burn(event, unsigned_tx);
        match self.store.create_swap(&swap).await {
            Ok(()) => {
                info!(
                    tx_hash,
                    amount = %swap.amount,
                    recipient = %swap.recipient_address,
                    "Registered swap"
                );
                metrics::record_swap_registered();
                Ok(RegisterOutcome::Registered(swap))
            }
            Err(RelayerError::DuplicateSwap { .. }) => {
                info!(tx_hash, "Burn event registered concurrently elsewhere");
                metrics::record_duplicate_burn();
                Ok(RegisterOutcome::Duplicate)
            }
            Err(e) => Err(e),
        }
    }

    /// Accept one co-signer's signature for a swap still collecting them
    pub async fn record_signature(
        &self,
        tx_hash: &str,
        user: &str,
        signature: &str,
    ) -> RelayerResult<SignatureOutcome> {
        if user.trim().is_empty() {
            return Err(RelayerError::InvalidSignature {
                user: user.to_string(),
                reason: "empty signer identity".to_string(),
            });
        }
        if signature.trim().is_empty() || signature.len() > MAX_SIGNATURE_LEN {
            return Err(RelayerError::InvalidSignature {
                user: user.to_string(),
                reason: format!("payload length {} out of range", signature.len()),
            });
        }

        let swap = self
            .store
            .get_swap(tx_hash)
            .await?
            .ok_or_else(|| RelayerError::UnknownSwap {
                tx_hash: tx_hash.to_string(),
            })?;

        if !swap.status.accepts_signatures() {
            debug!(tx_hash, user, status = %swap.status, "Rejecting late signature");
            return Err(RelayerError::AlreadyFinalized {
                tx_hash: tx_hash.to_string(),
                status: swap.status,
            });
        }

        let inserted = self
            .store
            .append_signature(&Signature::new(tx_hash, user, signature))
            .await?;

        // A finalize may have won between the status check and the append.
        // The row stays as audit, but the signer is told it came too late.
        if let Some(current) = self.store.get_swap(tx_hash).await? {
            if !current.status.accepts_signatures() {
                debug!(
                    tx_hash,
                    user,
                    status = %current.status,
                    "Swap finalized during signature append"
                );
                return Err(RelayerError::AlreadyFinalized {
                    tx_hash: tx_hash.to_string(),
                    status: current.status,
                });
            }
        }

        let count = self.store.count_signatures(tx_hash).await?;
        metrics::record_signature(inserted);

        if inserted {
            info!(tx_hash, user, count, "Recorded signature");
            Ok(SignatureOutcome::Recorded { count })
        } else {
            debug!(tx_hash, user, "Duplicate signature ignored");
            Ok(SignatureOutcome::Duplicate { count })
        }
    }

    /// Broadcast the multisig transaction once `threshold` signatures exist.
    ///
    /// Only the caller that wins `UNSIGNED -> SIGNED` broadcasts; every other
    /// concurrent caller gets `AlreadyHandled`. A failed broadcast moves the
    /// swap to FAILED and is returned as `Broadcast`. A swap already SIGNED is
    /// never re-broadcast; if its owner died it is only recovered by `expire_stale`.
    pub async fn try_finalize(
        &self,
        tx_hash: &str,
        threshold: usize,
    ) -> RelayerResult<FinalizeOutcome> {
        let swap = self
            .store
            .get_swap(tx_hash)
            .await?
            .ok_or_else(|| RelayerError::UnknownSwap {
                tx_hash: tx_hash.to_string(),
            })?;

        if swap.status != SwapStatus::Unsigned {
            return Ok(FinalizeOutcome::AlreadyHandled {
                status: swap.status,
            });
        }

        let signatures = self.store.list_signatures(tx_hash).await?;
        if signatures.len() < threshold {
            debug!(tx_hash, count = signatures.len(), threshold, "Below threshold");
            return Ok(FinalizeOutcome::BelowThreshold {
                count: signatures.len(),
            });
        }

        if let Err(e) = self
            .store
            .transition_status(tx_hash, SwapStatus::Unsigned, SwapStatus::Signed, None)
            .await
        {
            return match e {
                RelayerError::StaleTransition { actual, .. } => {
                    debug!(tx_hash, status = %actual, "Another worker is finalizing");
                    metrics::record_finalize_race_lost();
                    Ok(FinalizeOutcome::AlreadyHandled { status: actual })
                }
                other => Err(other),
            };
        }

        // First `threshold` in arrival order; which signers does not matter.
        let selected = &signatures[..threshold];
        let started = Instant::now();
        let result = self
            .with_timeout(
                "combine and broadcast",
                self.chain.combine_and_broadcast(&swap.unsigned_tx, selected),
            )
            .await;
        metrics::record_broadcast(result.is_ok(), started.elapsed().as_secs_f64());

        match result {
            Ok(mint_tx_hash) => {
                if let Err(e) = self
                    .store
                    .transition_status(
                        tx_hash,
                        SwapStatus::Signed,
                        SwapStatus::Submitted,
                        Some(&mint_tx_hash),
                    )
                    .await
                {
                    error!(
                        tx_hash,
                        mint_tx_hash = %mint_tx_hash,
                        "Broadcast succeeded but swap could not be marked submitted: {}",
                        e
                    );
                    // Keep the on-chain effect visible on the record.
                    if let Err(record_err) =
                        self.store.record_mint_hash(tx_hash, &mint_tx_hash).await
                    {
                        error!(tx_hash, "Could not record mint hash: {}", record_err);
                    }
                    return Err(e);
                }

                info!(tx_hash, mint_tx_hash = %mint_tx_hash, "Swap submitted");
                Ok(FinalizeOutcome::Submitted { mint_tx_hash })
            }
            Err(source) => {
                error!(tx_hash, "Broadcast failed, marking swap failed: {}", source);
                if let Err(e) = self
                    .store
                    .transition_status(tx_hash, SwapStatus::Signed, SwapStatus::Failed, None)
                    .await
                {
                    error!(tx_hash, "Could not mark swap failed: {}", e);
                }
                Err(RelayerError::Broadcast {
                    tx_hash: tx_hash.to_string(),
                    source,
                })
            }
        }
    }

    /// Finalize every UNSIGNED swap that has reached `threshold`
    pub async fn sweep_above_threshold(&self, threshold: usize) -> RelayerResult<PassReport> {
        let candidates = self.store.list_swaps_at_or_above_threshold(threshold).await?;
        if !candidates.is_empty() {
            debug!("{} swaps at or above threshold", candidates.len());
        }

        let results: Vec<_> = stream::iter(candidates)
            .map(|candidate| async move {
                let tx_hash = candidate.swap.transaction_hash;
                let result = self.try_finalize(&tx_hash, threshold).await;
                (tx_hash, result)
            })
            .buffer_unordered(self.max_concurrent_finalize)
            .collect()
            .await;

        let mut report = PassReport::default();
        for (tx_hash, result) in results {
            match result {
                Ok(FinalizeOutcome::Submitted { .. }) => report.succeeded.push(tx_hash),
                Ok(_) => report.skipped += 1,
                Err(e) => {
                    error!(tx_hash = %tx_hash, "Finalize failed: {}", e);
                    report.failed.push(tx_hash);
                }
            }
        }
        Ok(report)
    }

    async fn query_with_retry(&self, eth_tx_hash: &str) -> RelayerResult<bool> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = self
                .with_timeout("query swap status", self.chain.query_swap_status(eth_tx_hash))
                .await;

            match result {
                Ok(record) => return Ok(record.done),
                Err(e) => {
                    let e = RelayerError::ChainTool(e);
                    if !e.is_retryable() || attempts >= self.max_retries {
                        return Err(e);
                    }
                    warn!(
                        eth_tx_hash,
                        "Swap status query failed (attempt {}/{}): {}",
                        attempts,
                        self.max_retries,
                        e
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// Confirm a SUBMITTED swap once the chain reports it done
    pub async fn reconcile(&self, tx_hash: &str) -> RelayerResult<ReconcileOutcome> {
        let swap = self
            .store
            .get_swap(tx_hash)
            .await?
            .ok_or_else(|| RelayerError::UnknownSwap {
                tx_hash: tx_hash.to_string(),
            })?;

        if swap.status != SwapStatus::Submitted {
            return Ok(ReconcileOutcome::NotSubmitted {
                status: swap.status,
            });
        }

        if !self.query_with_retry(&swap.eth_tx_hash).await? {
            return Ok(ReconcileOutcome::Pending);
        }

        match self
            .store
            .transition_status(tx_hash, SwapStatus::Submitted, SwapStatus::Confirmed, None)
            .await
        {
            Ok(_) => {
                info!(tx_hash, "Swap confirmed");
                metrics::record_confirmed();
                Ok(ReconcileOutcome::Confirmed)
            }
            Err(RelayerError::StaleTransition { actual, .. }) => {
                Ok(ReconcileOutcome::NotSubmitted { status: actual })
            }
            Err(e) => Err(e),
        }
    }

    /// Reconcile every SUBMITTED swap
    pub async fn reconcile_all(&self) -> RelayerResult<PassReport> {
        let submitted = self.store.list_swaps_by_status(SwapStatus::Submitted).await?;

        let mut report = PassReport::default();
        for swap in submitted {
            match self.reconcile(&swap.transaction_hash).await {
                Ok(ReconcileOutcome::Confirmed) => report.succeeded.push(swap.transaction_hash),
                Ok(_) => report.skipped += 1,
                Err(e) => {
                    warn!(tx_hash = %swap.transaction_hash, "Reconcile failed: {}", e);
                    report.failed.push(swap.transaction_hash);
                }
            }
        }
        Ok(report)
    }

    /// Fail SIGNED or SUBMITTED swaps untouched for longer than `older_than`
    /// so an operator can review them.
    pub async fn expire_stale(&self, older_than: Duration) -> RelayerResult<PassReport> {
        let age = chrono::Duration::from_std(older_than)
            .map_err(|e| RelayerError::Config(format!("invalid timeout: {}", e)))?;
        let cutoff = Utc::now() - age;

        let stale = self
            .store
            .list_stale(&[SwapStatus::Signed, SwapStatus::Submitted], cutoff)
            .await?;

        let mut report = PassReport::default();
        for swap in stale {
            match self
                .store
                .transition_status(&swap.transaction_hash, swap.status, SwapStatus::Failed, None)
                .await
            {
                Ok(_) => {
                    error!(
                        tx_hash = %swap.transaction_hash,
                        status = %swap.status,
                        mint_tx_hash = ?swap.mint_transaction_hash,
                        "Swap timed out, marked failed for manual review"
                    );
                    metrics::record_expired(swap.status);
                    report.succeeded.push(swap.transaction_hash);
                }
                Err(e) if e.is_lost_race() => report.skipped += 1,
                Err(e) => {
                    warn!(tx_hash = %swap.transaction_hash, "Could not expire swap: {}", e);
                    report.failed.push(swap.transaction_hash);
                }
            }
        }
        Ok(report)
    }

    /// Co-sign every UNSIGNED swap `user` has not signed yet, using the local
    /// key `signer_key`. A signing failure only affects that swap.
    pub async fn cosign_pending(&self, user: &str, signer_key: &str) -> RelayerResult<PassReport> {
        let unsigned = self.store.list_swaps_by_status(SwapStatus::Unsigned).await?;

        let mut report = PassReport::default();
        for swap in unsigned {
            let tx_hash = swap.transaction_hash;
            let existing = self.store.list_signatures(&tx_hash).await?;
            if existing.iter().any(|s| s.user == user) {
                report.skipped += 1;
                continue;
            }

            let signature = match self
                .with_timeout("co-sign", self.chain.co_sign(&swap.unsigned_tx, signer_key))
                .await
            {
                Ok(signature) => signature,
                Err(source) => {
                    let e = RelayerError::Signing {
                        user: user.to_string(),
                        source,
                    };
                    warn!(tx_hash = %tx_hash, "{}", e);
                    metrics::record_signing_failure();
                    report.failed.push(tx_hash);
                    continue;
                }
            };

            match self.record_signature(&tx_hash, user, &signature).await {
                Ok(_) => report.succeeded.push(tx_hash),
                Err(e @ RelayerError::AlreadyFinalized { .. }) => {
                    debug!(tx_hash = %tx_hash, "{}", e);
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(tx_hash = %tx_hash, "Could not record own signature: {}", e);
                    report.failed.push(tx_hash);
                }
            }
        }
        Ok(report)
    }
}
