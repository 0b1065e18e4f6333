//! In-process swap store backed by `DashMap`
//!
//! Each operation holds the shard lock for its key for the whole
//! check-and-write, which gives the same insert-if-absent and
//! compare-and-set guarantees as the Postgres store within one process.

use super::{check_transition, SwapStateStore, SwapStats};
use crate::error::{RelayerError, RelayerResult};
use crate::swap::{QuorumCandidate, Signature, Swap, SwapStatus};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

#[derive(Default)]
pub struct MemorySwapStore {
    swaps: DashMap<String, Swap>,
    /// tx_hash -> signatures in arrival order
    signatures: DashMap<String, Vec<Signature>>,
}

impl MemorySwapStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted(mut swaps: Vec<Swap>) -> Vec<Swap> {
    swaps.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.transaction_hash.cmp(&b.transaction_hash))
    });
    swaps
}

#[async_trait]
impl SwapStateStore for MemorySwapStore {
    async fn create_swap(&self, swap: &Swap) -> RelayerResult<()> {
        match self.swaps.entry(swap.transaction_hash.clone()) {
            Entry::Occupied(_) => Err(RelayerError::DuplicateSwap {
                tx_hash: swap.transaction_hash.clone(),
            }),
            Entry::Vacant(slot) => {
                let mut record = swap.clone();
                record.status = SwapStatus::Unsigned;
                slot.insert(record);
                Ok(())
            }
        }
    }

    async fn get_swap(&self, tx_hash: &str) -> RelayerResult<Option<Swap>> {
        Ok(self.swaps.get(tx_hash).map(|s| s.value().clone()))
    }

    async fn append_signature(&self, signature: &Signature) -> RelayerResult<bool> {
        let mut entry = self
            .signatures
            .entry(signature.transaction_hash.clone())
            .or_default();

        if entry.iter().any(|s| s.user == signature.user) {
            debug!(
                tx_hash = %signature.transaction_hash,
                user = %signature.user,
                "Signature already present"
            );
            return Ok(false);
        }

        entry.push(signature.clone());
        Ok(true)
    }

    async fn count_signatures(&self, tx_hash: &str) -> RelayerResult<usize> {
        Ok(self.signatures.get(tx_hash).map(|s| s.len()).unwrap_or(0))
    }

    async fn list_signatures(&self, tx_hash: &str) -> RelayerResult<Vec<Signature>> {
        Ok(self
            .signatures
            .get(tx_hash)
            .map(|s| s.value().clone())
            .unwrap_or_default())
    }

    async fn list_swaps_by_status(&self, status: SwapStatus) -> RelayerResult<Vec<Swap>> {
        let swaps = self
            .swaps
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.value().clone())
            .collect();
        Ok(sorted(swaps))
    }

    async fn list_swaps_at_or_above_threshold(
        &self,
        threshold: usize,
    ) -> RelayerResult<Vec<QuorumCandidate>> {
        let unsigned = self.list_swaps_by_status(SwapStatus::Unsigned).await?;

        let mut candidates = Vec::new();
        for swap in unsigned {
            let signatures = self.list_signatures(&swap.transaction_hash).await?;
            if signatures.len() >= threshold {
                candidates.push(QuorumCandidate { swap, signatures });
            }
        }
        Ok(candidates)
    }

    async fn transition_status(
        &self,
        tx_hash: &str,
        expected: SwapStatus,
        next: SwapStatus,
        mint_tx_hash: Option<&str>,
    ) -> RelayerResult<Swap> {
        check_transition(expected, next)?;

        let mut swap = self
            .swaps
            .get_mut(tx_hash)
            .ok_or_else(|| RelayerError::UnknownSwap {
                tx_hash: tx_hash.to_string(),
            })?;

        if swap.status != expected {
            return Err(RelayerError::StaleTransition {
                tx_hash: tx_hash.to_string(),
                expected,
                actual: swap.status,
            });
        }

        swap.status = next;
        if let Some(hash) = mint_tx_hash {
            swap.mint_transaction_hash = Some(hash.to_string());
        }
        swap.updated_at = Utc::now();

        Ok(swap.clone())
    }

    async fn record_mint_hash(&self, tx_hash: &str, mint_tx_hash: &str) -> RelayerResult<()> {
        let mut swap = self
            .swaps
            .get_mut(tx_hash)
            .ok_or_else(|| RelayerError::UnknownSwap {
                tx_hash: tx_hash.to_string(),
            })?;

        if swap.mint_transaction_hash.is_none() {
            swap.mint_transaction_hash = Some(mint_tx_hash.to_string());
            swap.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_stale(
        &self,
        statuses: &[SwapStatus],
        older_than: DateTime<Utc>,
    ) -> RelayerResult<Vec<Swap>> {
        let swaps = self
            .swaps
            .iter()
            .filter(|s| statuses.contains(&s.status) && s.updated_at < older_than)
            .map(|s| s.value().clone())
            .collect();
        Ok(sorted(swaps))
    }

    async fn stats(&self) -> RelayerResult<SwapStats> {
        let mut stats = SwapStats::default();
        for swap in self.swaps.iter() {
            stats.add(swap.status, 1);
        }
        Ok(stats)
    }

    async fn health_check(&self) -> RelayerResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;
    use std::sync::Arc;

    fn sample_swap(tx_hash: &str) -> Swap {
        let now = Utc::now();
        Swap {
            transaction_hash: tx_hash.to_string(),
            eth_tx_hash: tx_hash.to_string(),
            sender_address: "0x2b8a9f3c1d4e5f60718293a4b5c6d7e8f9012345".to_string(),
            amount: BigUint::from(10u32).pow(30),
            recipient_address: "enigma1recipient".to_string(),
            nonce: BigUint::from(1u32),
            unsigned_tx: serde_json::json!({"msg": [tx_hash]}),
            status: SwapStatus::Unsigned,
            mint_transaction_hash: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_create_swap_rejects_duplicate() {
        let store = MemorySwapStore::new();
        store.create_swap(&sample_swap("0xa")).await.unwrap();

        let err = store.create_swap(&sample_swap("0xa")).await.unwrap_err();
        assert!(matches!(err, RelayerError::DuplicateSwap { .. }));
        assert_eq!(store.stats().await.unwrap().unsigned, 1);
    }

    #[tokio::test]
    async fn test_append_signature_is_idempotent_per_signer() {
        let store = MemorySwapStore::new();
        store.create_swap(&sample_swap("0xa")).await.unwrap();

        assert!(store
            .append_signature(&Signature::new("0xa", "alice", "sig-1"))
            .await
            .unwrap());
        assert!(!store
            .append_signature(&Signature::new("0xa", "alice", "sig-2"))
            .await
            .unwrap());
        assert!(store
            .append_signature(&Signature::new("0xa", "bob", "sig-3"))
            .await
            .unwrap());

        assert_eq!(store.count_signatures("0xa").await.unwrap(), 2);
        let sigs = store.list_signatures("0xa").await.unwrap();
        assert_eq!(sigs[0].user, "alice");
        assert_eq!(sigs[0].signature, "sig-1");
        assert_eq!(sigs[1].user, "bob");
    }

    #[tokio::test]
    async fn test_concurrent_signers_on_same_swap() {
        let store = Arc::new(MemorySwapStore::new());
        store.create_swap(&sample_swap("0xa")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let user = format!("signer-{}", i % 8);
                store
                    .append_signature(&Signature::new("0xa", &user, "sig"))
                    .await
                    .unwrap()
            }));
        }

        let inserted = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();

        assert_eq!(inserted, 8);
        assert_eq!(store.count_signatures("0xa").await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_threshold_query_only_returns_unsigned() {
        let store = MemorySwapStore::new();
        for hash in ["0xa", "0xb", "0xc"] {
            store.create_swap(&sample_swap(hash)).await.unwrap();
        }
        for user in ["alice", "bob"] {
            for hash in ["0xa", "0xb"] {
                store
                    .append_signature(&Signature::new(hash, user, "sig"))
                    .await
                    .unwrap();
            }
        }
        store
            .append_signature(&Signature::new("0xc", "alice", "sig"))
            .await
            .unwrap();
        store
            .transition_status("0xb", SwapStatus::Unsigned, SwapStatus::Signed, None)
            .await
            .unwrap();

        let candidates = store.list_swaps_at_or_above_threshold(2).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].swap.transaction_hash, "0xa");
        assert_eq!(candidates[0].signatures.len(), 2);

        assert_eq!(store.list_swaps_at_or_above_threshold(1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let store = MemorySwapStore::new();
        store.create_swap(&sample_swap("0xa")).await.unwrap();

        store
            .transition_status("0xa", SwapStatus::Unsigned, SwapStatus::Signed, None)
            .await
            .unwrap();

        let err = store
            .transition_status("0xa", SwapStatus::Unsigned, SwapStatus::Signed, None)
            .await
            .unwrap_err();
        assert!(err.is_lost_race());

        let swap = store
            .transition_status("0xa", SwapStatus::Signed, SwapStatus::Submitted, Some("MINT"))
            .await
            .unwrap();
        assert_eq!(swap.status, SwapStatus::Submitted);
        assert_eq!(swap.mint_transaction_hash.as_deref(), Some("MINT"));

        let err = store
            .transition_status("0xa", SwapStatus::Submitted, SwapStatus::Unsigned, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayerError::InvalidStateTransition { .. }));

        let err = store
            .transition_status("0xmissing", SwapStatus::Unsigned, SwapStatus::Signed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayerError::UnknownSwap { .. }));
    }

    #[tokio::test]
    async fn test_list_stale_filters_by_status_and_age() {
        let store = MemorySwapStore::new();
        let mut old = sample_swap("0xold");
        old.updated_at = Utc::now() - chrono::Duration::hours(2);
        store.create_swap(&old).await.unwrap();
        store.create_swap(&sample_swap("0xnew")).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(1);
        let stale = store
            .list_stale(&[SwapStatus::Unsigned], cutoff)
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].transaction_hash, "0xold");

        assert!(store
            .list_stale(&[SwapStatus::Submitted], cutoff)
            .await
            .unwrap()
            .is_empty());
    }
}
