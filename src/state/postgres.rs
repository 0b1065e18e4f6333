//! PostgreSQL swap store

use super::{check_transition, SwapStateStore, SwapStats};
use crate::config::DatabaseConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::swap::{decimal, QuorumCandidate, Signature, Swap, SwapStatus};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use tracing::{debug, info};

const SWAP_COLUMNS: &str = r#"
    transaction_hash, eth_tx_hash, sender_address, amount, recipient_address, nonce,
    unsigned_tx, status, mint_transaction_hash, created_at, updated_at
"#;

/// Swap store over a Postgres pool
pub struct PgSwapStore {
    pool: PgPool,
}

impl PgSwapStore {
    /// Create a new store
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await
            .map_err(RelayerError::Database)?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swaps (
                transaction_hash TEXT PRIMARY KEY,
                eth_tx_hash TEXT NOT NULL,
                sender_address TEXT NOT NULL,
                amount TEXT NOT NULL,
                recipient_address TEXT NOT NULL,
                nonce TEXT NOT NULL,
                unsigned_tx JSONB NOT NULL,
                status VARCHAR(16) NOT NULL CHECK (status IN
                    ('UNSIGNED', 'SIGNED', 'SUBMITTED', 'CONFIRMED', 'FAILED')),
                mint_transaction_hash TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_swaps_status
            ON swaps (status, updated_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signatures (
                seq BIGSERIAL,
                transaction_hash TEXT NOT NULL REFERENCES swaps (transaction_hash),
                "user" TEXT NOT NULL,
                signature TEXT NOT NULL,
                received_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (transaction_hash, "user")
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_signatures_tx_seq
            ON signatures (transaction_hash, seq)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    async fn fetch_status(&self, tx_hash: &str) -> RelayerResult<Option<SwapStatus>> {
        let row = sqlx::query("SELECT status FROM swaps WHERE transaction_hash = $1")
            .bind(tx_hash)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.get::<String, _>("status").parse())
            .transpose()
    }
}

fn swap_from_row(row: &PgRow) -> RelayerResult<Swap> {
    let tx_hash: String = row.get("transaction_hash");
    let amount: String = row.get("amount");
    let nonce: String = row.get("nonce");
    let status: String = row.get("status");

    let parse = |field: &str, value: &str| {
        decimal::parse(value).ok_or_else(|| {
            RelayerError::Internal(format!("invalid {} for swap {}: {}", field, tx_hash, value))
        })
    };

    Ok(Swap {
        amount: parse("amount", &amount)?,
        nonce: parse("nonce", &nonce)?,
        status: status.parse()?,
        eth_tx_hash: row.get("eth_tx_hash"),
        sender_address: row.get("sender_address"),
        recipient_address: row.get("recipient_address"),
        unsigned_tx: row.get("unsigned_tx"),
        mint_transaction_hash: row.get("mint_transaction_hash"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        transaction_hash: tx_hash,
    })
}

fn signature_from_row(row: &PgRow) -> Signature {
    Signature {
        transaction_hash: row.get("transaction_hash"),
        user: row.get("user"),
        signature: row.get("signature"),
        received_at: row.get("received_at"),
    }
}

#[async_trait]
impl SwapStateStore for PgSwapStore {
    async fn create_swap(&self, swap: &Swap) -> RelayerResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO swaps
                (transaction_hash, eth_tx_hash, sender_address, amount, recipient_address,
                 nonce, unsigned_tx, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'UNSIGNED', $8, $8)
            ON CONFLICT (transaction_hash) DO NOTHING
            "#,
        )
        .bind(&swap.transaction_hash)
        .bind(&swap.eth_tx_hash)
        .bind(&swap.sender_address)
        .bind(swap.amount.to_string())
        .bind(&swap.recipient_address)
        .bind(swap.nonce.to_string())
        .bind(&swap.unsigned_tx)
        .bind(swap.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RelayerError::DuplicateSwap {
                tx_hash: swap.transaction_hash.clone(),
            });
        }
        Ok(())
    }

    async fn get_swap(&self, tx_hash: &str) -> RelayerResult<Option<Swap>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM swaps WHERE transaction_hash = $1",
            SWAP_COLUMNS
        ))
        .bind(tx_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(swap_from_row).transpose()
    }

    async fn append_signature(&self, signature: &Signature) -> RelayerResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO signatures (transaction_hash, "user", signature, received_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (transaction_hash, "user") DO NOTHING
            "#,
        )
        .bind(&signature.transaction_hash)
        .bind(&signature.user)
        .bind(&signature.signature)
        .bind(signature.received_at)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() == 1;
        if !inserted {
            debug!(
                tx_hash = %signature.transaction_hash,
                user = %signature.user,
                "Signature already present"
            );
        }
        Ok(inserted)
    }

    async fn count_signatures(&self, tx_hash: &str) -> RelayerResult<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM signatures WHERE transaction_hash = $1")
            .bind(tx_hash)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.get::<i64, _>("n") as usize)
    }

    async fn list_signatures(&self, tx_hash: &str) -> RelayerResult<Vec<Signature>> {
        let rows = sqlx::query(
            r#"
            SELECT transaction_hash, "user", signature, received_at
            FROM signatures
            WHERE transaction_hash = $1
            ORDER BY seq
            "#,
        )
        .bind(tx_hash)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(signature_from_row).collect())
    }

    async fn list_swaps_by_status(&self, status: SwapStatus) -> RelayerResult<Vec<Swap>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM swaps WHERE status = $1 ORDER BY created_at, transaction_hash",
            SWAP_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(swap_from_row).collect()
    }

    async fn list_swaps_at_or_above_threshold(
        &self,
        threshold: usize,
    ) -> RelayerResult<Vec<QuorumCandidate>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM swaps s
            WHERE s.status = 'UNSIGNED'
              AND (SELECT COUNT(*) FROM signatures g
                   WHERE g.transaction_hash = s.transaction_hash) >= $1
            ORDER BY s.created_at, s.transaction_hash
            "#,
            SWAP_COLUMNS
        ))
        .bind(threshold as i64)
        .fetch_all(&self.pool)
        .await?;

        let swaps = rows
            .iter()
            .map(swap_from_row)
            .collect::<RelayerResult<Vec<_>>>()?;
        if swaps.is_empty() {
            return Ok(Vec::new());
        }

        let hashes: Vec<String> = swaps.iter().map(|s| s.transaction_hash.clone()).collect();
        let sig_rows = sqlx::query(
            r#"
            SELECT transaction_hash, "user", signature, received_at
            FROM signatures
            WHERE transaction_hash = ANY($1)
            ORDER BY seq
            "#,
        )
        .bind(&hashes)
        .fetch_all(&self.pool)
        .await?;

        let mut by_swap: HashMap<String, Vec<Signature>> = HashMap::new();
        for row in &sig_rows {
            let sig = signature_from_row(row);
            by_swap
                .entry(sig.transaction_hash.clone())
                .or_default()
                .push(sig);
        }

        Ok(swaps
            .into_iter()
            .map(|swap| {
                let signatures = by_swap.remove(&swap.transaction_hash).unwrap_or_default();
                QuorumCandidate { swap, signatures }
            })
            .filter(|c| c.signatures.len() >= threshold)
            .collect())
    }

    async fn transition_status(
        &self,
        tx_hash: &str,
        expected: SwapStatus,
        next: SwapStatus,
        mint_tx_hash: Option<&str>,
    ) -> RelayerResult<Swap> {
        check_transition(expected, next)?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE swaps
            SET status = $3,
                mint_transaction_hash = COALESCE($4, mint_transaction_hash),
                updated_at = NOW()
            WHERE transaction_hash = $1 AND status = $2
            RETURNING {}
            "#,
            SWAP_COLUMNS
        ))
        .bind(tx_hash)
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(mint_tx_hash)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => swap_from_row(&row),
            None => match self.fetch_status(tx_hash).await? {
                Some(actual) => Err(RelayerError::StaleTransition {
                    tx_hash: tx_hash.to_string(),
                    expected,
                    actual,
                }),
                None => Err(RelayerError::UnknownSwap {
                    tx_hash: tx_hash.to_string(),
                }),
            },
        }
    }

    async fn record_mint_hash(&self, tx_hash: &str, mint_tx_hash: &str) -> RelayerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE swaps
            SET mint_transaction_hash = COALESCE(mint_transaction_hash, $2),
                updated_at = NOW()
            WHERE transaction_hash = $1
            "#,
        )
        .bind(tx_hash)
        .bind(mint_tx_hash)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RelayerError::UnknownSwap {
                tx_hash: tx_hash.to_string(),
            });
        }
        Ok(())
    }

    async fn list_stale(
        &self,
        statuses: &[SwapStatus],
        older_than: DateTime<Utc>,
    ) -> RelayerResult<Vec<Swap>> {
        let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM swaps
            WHERE status = ANY($1) AND updated_at < $2
            ORDER BY updated_at
            "#,
            SWAP_COLUMNS
        ))
        .bind(&statuses)
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(swap_from_row).collect()
    }

    async fn stats(&self) -> RelayerResult<SwapStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM swaps GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = SwapStats::default();
        for row in rows {
            let status: SwapStatus = row.get::<String, _>("status").parse()?;
            stats.add(status, row.get::<i64, _>("n") as u64);
        }
        Ok(stats)
    }

    async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(RelayerError::Database)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    //! Run with `DATABASE_URL=postgres://... cargo test -- --ignored`

    use super::*;
    use num_bigint::BigUint;

    async fn store() -> PgSwapStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = PgPoolOptions::new().connect(&url).await.unwrap();
        let store = PgSwapStore::from_pool(pool);
        store.run_migrations().await.unwrap();
        store
    }

    fn sample_swap() -> Swap {
        let tx_hash = format!("0x{}", uuid::Uuid::new_v4().simple());
        let now = Utc::now();
        Swap {
            eth_tx_hash: tx_hash.clone(),
            transaction_hash: tx_hash,
            sender_address: "0x2b8a9f3c1d4e5f60718293a4b5c6d7e8f9012345".to_string(),
            amount: "115792089237316195423570985008687907853269984665640564039457584007913129639936"
                .parse()
                .unwrap(),
            recipient_address: "enigma1recipient".to_string(),
            nonce: BigUint::from(9u32),
            unsigned_tx: serde_json::json!({"type": "StdTx"}),
            status: SwapStatus::Unsigned,
            mint_transaction_hash: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    #[ignore]
    async fn test_swap_lifecycle_round_trip() {
        let store = store().await;
        let swap = sample_swap();
        let hash = swap.transaction_hash.clone();

        store.create_swap(&swap).await.unwrap();
        let err = store.create_swap(&swap).await.unwrap_err();
        assert!(matches!(err, RelayerError::DuplicateSwap { .. }));

        let stored = store.get_swap(&hash).await.unwrap().unwrap();
        assert_eq!(stored.amount, swap.amount);
        assert_eq!(stored.nonce, swap.nonce);

        assert!(store
            .append_signature(&Signature::new(&hash, "alice", "sig-a"))
            .await
            .unwrap());
        assert!(!store
            .append_signature(&Signature::new(&hash, "alice", "sig-a"))
            .await
            .unwrap());
        assert!(store
            .append_signature(&Signature::new(&hash, "bob", "sig-b"))
            .await
            .unwrap());
        assert_eq!(store.count_signatures(&hash).await.unwrap(), 2);

        let candidates = store.list_swaps_at_or_above_threshold(2).await.unwrap();
        let candidate = candidates
            .iter()
            .find(|c| c.swap.transaction_hash == hash)
            .unwrap();
        assert_eq!(candidate.signatures[0].user, "alice");
        assert_eq!(candidate.signatures[1].user, "bob");

        store
            .transition_status(&hash, SwapStatus::Unsigned, SwapStatus::Signed, None)
            .await
            .unwrap();
        let err = store
            .transition_status(&hash, SwapStatus::Unsigned, SwapStatus::Signed, None)
            .await
            .unwrap_err();
        assert!(err.is_lost_race());

        let submitted = store
            .transition_status(&hash, SwapStatus::Signed, SwapStatus::Submitted, Some("MINT"))
            .await
            .unwrap();
        assert_eq!(submitted.mint_transaction_hash.as_deref(), Some("MINT"));
    }
}
