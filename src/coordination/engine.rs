//! Periodic drivers for the swap lifecycle

use super::coordinator::SwapCoordinator;
use crate::config::{RelayerConfig, SignerConfig};
use crate::error::RelayerResult;

use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Identity and key this node co-signs with
#[derive(Debug, Clone)]
pub struct LocalSigner {
    pub user: String,
    pub key_name: String,
    pub interval: Duration,
}

impl LocalSigner {
    /// `None` unless co-signing is enabled
    pub fn from_config(config: &SignerConfig, key_name: &str) -> Option<Self> {
        config.enabled.then(|| Self {
            user: config.user.clone(),
            key_name: key_name.to_string(),
            interval: Duration::from_millis(config.interval_ms),
        })
    }
}

/// Runs the quorum sweep, reconciliation and optional co-signing on timers
pub struct CoordinationEngine {
    coordinator: Arc<SwapCoordinator>,
    config: RelayerConfig,
    signer: Option<LocalSigner>,
    /// Shutdown flag
    shutdown: Arc<RwLock<bool>>,
}

impl CoordinationEngine {
    pub fn new(
        coordinator: Arc<SwapCoordinator>,
        config: RelayerConfig,
        signer: Option<LocalSigner>,
    ) -> Self {
        Self {
            coordinator,
            config,
            signer,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Main loop
    pub async fn run(&self) -> RelayerResult<()> {
        let mut sweep_interval = interval(Duration::from_millis(self.config.sweep_interval_ms));
        sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut reconcile_interval =
            interval(Duration::from_millis(self.config.reconcile_interval_ms));
        reconcile_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Ticks forever but only acted on when a signer is configured.
        let mut sign_interval = interval(
            self.signer
                .as_ref()
                .map(|s| s.interval)
                .unwrap_or(Duration::from_secs(3600)),
        );
        sign_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            instance_id = %self.config.instance_id,
            threshold = self.config.threshold,
            co_signing = self.signer.is_some(),
            "Coordination engine started"
        );

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                _ = sweep_interval.tick() => {
                    self.sweep().await;
                }

                _ = reconcile_interval.tick() => {
                    self.reconcile().await;
                }

                _ = sign_interval.tick(), if self.signer.is_some() => {
                    self.cosign().await;
                }
            }
        }

        info!("Coordination engine stopped");
        Ok(())
    }

    async fn sweep(&self) {
        match self.coordinator.sweep_above_threshold(self.config.threshold).await {
            Ok(report) => {
                if !report.succeeded.is_empty() || !report.failed.is_empty() {
                    info!(
                        submitted = report.succeeded.len(),
                        failed = report.failed.len(),
                        "Quorum sweep finished"
                    );
                }
            }
            Err(e) => error!("Quorum sweep failed: {}", e),
        }
    }

    /// Confirm submitted swaps, expire stuck ones and refresh gauges
    async fn reconcile(&self) {
        match self.coordinator.reconcile_all().await {
            Ok(report) if !report.succeeded.is_empty() => {
                info!(confirmed = report.succeeded.len(), "Reconciled swaps");
            }
            Ok(_) => {}
            Err(e) => warn!("Reconciliation failed: {}", e),
        }

        match self
            .coordinator
            .expire_stale(self.config.submitted_timeout())
            .await
        {
            Ok(report) if !report.succeeded.is_empty() => {
                warn!(expired = report.succeeded.len(), "Expired stale swaps");
            }
            Ok(_) => {}
            Err(e) => warn!("Expiring stale swaps failed: {}", e),
        }

        match self.coordinator.store().stats().await {
            Ok(stats) => crate::metrics::record_swap_stats(&stats),
            Err(e) => debug!("Could not refresh swap gauges: {}", e),
        }
    }

    async fn cosign(&self) {
        let Some(signer) = &self.signer else {
            return;
        };

        match self
            .coordinator
            .cosign_pending(&signer.user, &signer.key_name)
            .await
        {
            Ok(report) if !report.succeeded.is_empty() || !report.failed.is_empty() => {
                info!(
                    signed = report.succeeded.len(),
                    failed = report.failed.len(),
                    "Co-signing pass finished"
                );
            }
            Ok(_) => {}
            Err(e) => error!("Co-signing pass failed: {}", e),
        }
    }

    /// Stop the engine after the current pass
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Coordination engine shutdown initiated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainClient;
    use crate::state::{MemorySwapStore, SwapStateStore};
    use crate::swap::{BurnEvent, SwapStatus};
    use serde_json::json;

    const BURN: &str = "0x5d8e2c1a9b3f4e6d7c8b9a0f1e2d3c4b5a69788796a5b4c3d2e1f0a9b8c7d6e5";

    fn config() -> RelayerConfig {
        RelayerConfig {
            instance_id: "engine-test".to_string(),
            threshold: 2,
            sweep_interval_ms: 10,
            reconcile_interval_ms: 10,
            max_concurrent_finalize: 2,
            tool_timeout_secs: 5,
            submitted_timeout_secs: 3600,
            max_retries: 1,
            retry_delay_ms: 1,
            health_check_interval_secs: 30,
        }
    }

    #[test]
    fn test_local_signer_requires_enabled() {
        let mut signer = SignerConfig {
            enabled: false,
            user: "operator".to_string(),
            interval_ms: 250,
        };
        assert!(LocalSigner::from_config(&signer, "key").is_none());

        signer.enabled = true;
        let local = LocalSigner::from_config(&signer, "key").unwrap();
        assert_eq!(local.user, "operator");
        assert_eq!(local.key_name, "key");
        assert_eq!(local.interval, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_engine_drives_swap_to_confirmed_and_stops() {
        let mut chain = MockChainClient::new();
        chain
            .expect_generate_unsigned_transaction()
            .returning(|_, _, _, _| Ok(json!({"type": "StdTx"})));
        chain
            .expect_co_sign()
            .returning(|_, _| Ok(r#"{"signature":"b3A="}"#.to_string()));
        chain
            .expect_combine_and_broadcast()
            .times(1)
            .returning(|_, _| Ok("MINT".to_string()));
        chain
            .expect_query_swap_status()
            .returning(|_| Ok(crate::chain::SwapQueryResult { done: true }));

        let store = Arc::new(MemorySwapStore::new());
        let coordinator = Arc::new(SwapCoordinator::new(store.clone(), Arc::new(chain), &config()));

        let event = BurnEvent {
            transaction_hash: None,
            eth_tx_hash: BURN.to_string(),
            sender_address: "0x2b8a9f3c1d4e5f60718293a4b5c6d7e8f9012345".to_string(),
            amount: 42u32.into(),
            recipient_address: "enigma1recipient".to_string(),
            nonce: 0u32.into(),
        };
        coordinator.register_swap(&event).await.unwrap();
        coordinator.record_signature(BURN, "remote", "sig").await.unwrap();

        let signer = LocalSigner {
            user: "operator".to_string(),
            key_name: "operator-key".to_string(),
            interval: Duration::from_millis(10),
        };
        let engine = Arc::new(CoordinationEngine::new(coordinator, config(), Some(signer)));
        let handle = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run().await })
        };

        let mut confirmed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if store.get_swap(BURN).await.unwrap().unwrap().status == SwapStatus::Confirmed {
                confirmed = true;
                break;
            }
        }
        assert!(confirmed);

        engine.stop().await;
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
