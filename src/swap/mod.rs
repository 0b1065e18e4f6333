//! Swap and signature records
//!
//! A swap is one burn on the source chain waiting to be minted on the
//! destination chain. Co-signer signatures accumulate against it until the
//! multisig threshold is met.

pub mod decimal;

use crate::error::{RelayerError, RelayerResult};

use alloy_primitives::{Address, B256};
use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Upper bound on a single co-signer payload
pub const MAX_SIGNATURE_LEN: usize = 64 * 1024;

/// Lifecycle of a swap. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwapStatus {
    Unsigned,
    Signed,
    Submitted,
    Confirmed,
    Failed,
}

impl SwapStatus {
    pub const ALL: [SwapStatus; 5] = [
        SwapStatus::Unsigned,
        SwapStatus::Signed,
        SwapStatus::Submitted,
        SwapStatus::Confirmed,
        SwapStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SwapStatus::Unsigned => "UNSIGNED",
            SwapStatus::Signed => "SIGNED",
            SwapStatus::Submitted => "SUBMITTED",
            SwapStatus::Confirmed => "CONFIRMED",
            SwapStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SwapStatus::Confirmed | SwapStatus::Failed)
    }

    /// Signatures are only collected before the multisig is broadcast
    pub fn accepts_signatures(&self) -> bool {
        matches!(self, SwapStatus::Unsigned | SwapStatus::Signed)
    }

    /// Legal single-step transitions
    pub fn can_transition_to(&self, next: SwapStatus) -> bool {
        match (self, next) {
            (SwapStatus::Unsigned, SwapStatus::Signed)
            | (SwapStatus::Signed, SwapStatus::Submitted)
            | (SwapStatus::Submitted, SwapStatus::Confirmed) => true,
            (current, SwapStatus::Failed) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwapStatus {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SwapStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| RelayerError::Internal(format!("unknown swap status: {}", s)))
    }
}

/// Burn observed on the source chain, as delivered by the watcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BurnEvent {
    /// Source-chain transaction id; defaults to `eth_tx_hash`
    #[serde(default)]
    pub transaction_hash: Option<String>,
    pub eth_tx_hash: String,
    pub sender_address: String,
    #[serde(with = "decimal")]
    pub amount: BigUint,
    pub recipient_address: String,
    #[serde(default, with = "decimal")]
    pub nonce: BigUint,
}

impl BurnEvent {
    pub fn swap_id(&self) -> &str {
        self.transaction_hash.as_deref().unwrap_or(&self.eth_tx_hash)
    }

    pub fn validate(&self) -> RelayerResult<()> {
        B256::from_str(&self.eth_tx_hash).map_err(|e| {
            RelayerError::InvalidBurnEvent(format!("ethTxHash {}: {}", self.eth_tx_hash, e))
        })?;
        Address::from_str(&self.sender_address).map_err(|e| {
            RelayerError::InvalidBurnEvent(format!("senderAddress {}: {}", self.sender_address, e))
        })?;
        if self.swap_id().trim().is_empty() {
            return Err(RelayerError::InvalidBurnEvent(
                "empty transactionHash".to_string(),
            ));
        }
        if self.recipient_address.trim().is_empty() {
            return Err(RelayerError::InvalidBurnEvent(
                "empty recipientAddress".to_string(),
            ));
        }
        Ok(())
    }
}

/// One burn-to-mint transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Swap {
    pub transaction_hash: String,
    pub eth_tx_hash: String,
    pub sender_address: String,
    #[serde(with = "decimal")]
    pub amount: BigUint,
    pub recipient_address: String,
    #[serde(with = "decimal")]
    pub nonce: BigUint,
    /// Chain-tool encoded mint transaction, opaque to the relayer
    pub unsigned_tx: serde_json::Value,
    pub status: SwapStatus,
    pub mint_transaction_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Swap {
    /// Build a fresh UNSIGNED swap from a burn and its generated mint tx
    pub fn from_burn(event: &BurnEvent, unsigned_tx: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            transaction_hash: event.swap_id().to_string(),
            eth_tx_hash: event.eth_tx_hash.clone(),
            sender_address: event.sender_address.clone(),
            amount: event.amount.clone(),
            recipient_address: event.recipient_address.clone(),
            nonce: event.nonce.clone(),
            unsigned_tx,
            status: SwapStatus::Unsigned,
            mint_transaction_hash: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One co-signer's contribution, unique on (transaction_hash, user)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    pub transaction_hash: String,
    pub user: String,
    pub signature: String,
    pub received_at: DateTime<Utc>,
}

impl Signature {
    pub fn new(transaction_hash: &str, user: &str, signature: &str) -> Self {
        Self {
            transaction_hash: transaction_hash.to_string(),
            user: user.to_string(),
            signature: signature.to_string(),
            received_at: Utc::now(),
        }
    }
}

/// An UNSIGNED swap whose signature count has reached the threshold
#[derive(Debug, Clone)]
pub struct QuorumCandidate {
    pub swap: Swap,
    /// Full signature set in arrival order
    pub signatures: Vec<Signature>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_only_transitions() {
        use SwapStatus::*;

        assert!(Unsigned.can_transition_to(Signed));
        assert!(Signed.can_transition_to(Submitted));
        assert!(Submitted.can_transition_to(Confirmed));
        for status in [Unsigned, Signed, Submitted] {
            assert!(status.can_transition_to(Failed));
        }

        assert!(!Signed.can_transition_to(Unsigned));
        assert!(!Submitted.can_transition_to(Signed));
        assert!(!Unsigned.can_transition_to(Submitted));
        assert!(!Confirmed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Unsigned));
    }

    #[test]
    fn test_status_parsed_by_membership() {
        assert_eq!("SUBMITTED".parse::<SwapStatus>().unwrap(), SwapStatus::Submitted);
        assert_eq!("confirmed".parse::<SwapStatus>().unwrap(), SwapStatus::Confirmed);
        assert!("2".parse::<SwapStatus>().is_err());
        assert!("PENDING".parse::<SwapStatus>().is_err());
    }

    #[test]
    fn test_burn_event_wire_shape() {
        let json = r#"{
            "ethTxHash": "0x5d8e2c1a9b3f4e6d7c8b9a0f1e2d3c4b5a69788796a5b4c3d2e1f0a9b8c7d6e5",
            "senderAddress": "0x2b8a9f3c1d4e5f60718293a4b5c6d7e8f9012345",
            "amount": "123456789012345678901234567890",
            "recipientAddress": "enigma1qxyz"
        }"#;
        let event: BurnEvent = serde_json::from_str(json).unwrap();
        event.validate().unwrap();

        assert_eq!(event.swap_id(), event.eth_tx_hash);
        assert_eq!(
            event.amount.to_string(),
            "123456789012345678901234567890"
        );
        assert_eq!(event.nonce, BigUint::default());
    }

    #[test]
    fn test_burn_event_rejects_bad_sender() {
        let event = BurnEvent {
            transaction_hash: None,
            eth_tx_hash: "0x5d8e2c1a9b3f4e6d7c8b9a0f1e2d3c4b5a69788796a5b4c3d2e1f0a9b8c7d6e5"
                .to_string(),
            sender_address: "not-an-address".to_string(),
            amount: BigUint::from(1u32),
            recipient_address: "enigma1qxyz".to_string(),
            nonce: BigUint::from(7u32),
        };
        let err = event.validate().unwrap_err();
        assert!(matches!(err, RelayerError::InvalidBurnEvent(_)));
    }

    #[test]
    fn test_swap_keeps_amount_and_nonce_distinct() {
        let event = BurnEvent {
            transaction_hash: Some("0xburn".to_string()),
            eth_tx_hash: "0x5d8e2c1a9b3f4e6d7c8b9a0f1e2d3c4b5a69788796a5b4c3d2e1f0a9b8c7d6e5"
                .to_string(),
            sender_address: "0x2b8a9f3c1d4e5f60718293a4b5c6d7e8f9012345".to_string(),
            amount: "340282366920938463463374607431768211456".parse().unwrap(),
            recipient_address: "enigma1qxyz".to_string(),
            nonce: BigUint::from(42u32),
        };
        let swap = Swap::from_burn(&event, serde_json::json!({"type": "StdTx"}));

        assert_eq!(swap.transaction_hash, "0xburn");
        assert_eq!(swap.status, SwapStatus::Unsigned);
        assert_eq!(swap.nonce, BigUint::from(42u32));

        let value = serde_json::to_value(&swap).unwrap();
        assert_eq!(value["amount"], "340282366920938463463374607431768211456");
        assert_eq!(value["nonce"], "42");
        assert_eq!(value["status"], "UNSIGNED");
    }
}
