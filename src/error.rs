//! Error types for the swap relayer

use crate::swap::SwapStatus;
use thiserror::Error;

/// Failure reported by, or while running, the external chain tool
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    /// The process could not be started or did not exit normally
    #[error("failed to invoke `{program} {command}`: {message}")]
    Invocation {
        program: String,
        command: String,
        message: String,
    },

    /// The tool ran and reported an application-level error
    #[error("`{command}` rejected with code {code}: {log}")]
    Application {
        command: String,
        code: i64,
        log: String,
    },

    #[error("malformed output from `{command}`: {message}")]
    MalformedOutput { command: String, message: String },

    #[error("timeout waiting for {operation}")]
    Timeout { operation: String },
}

impl ToolError {
    pub fn is_application(&self) -> bool {
        matches!(self, ToolError::Application { .. })
    }
}

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Swap {tx_hash} already registered")]
    DuplicateSwap { tx_hash: String },

    #[error("Swap {tx_hash} not found")]
    UnknownSwap { tx_hash: String },

    #[error("Swap {tx_hash} already finalized with status {status}")]
    AlreadyFinalized { tx_hash: String, status: SwapStatus },

    #[error("Chain tool error: {0}")]
    ChainTool(#[from] ToolError),

    #[error("Signing error for signer {user}: {source}")]
    Signing {
        user: String,
        #[source]
        source: ToolError,
    },

    #[error("Broadcast error for swap {tx_hash}: {source}")]
    Broadcast {
        tx_hash: String,
        #[source]
        source: ToolError,
    },

    #[error("Stale transition for swap {tx_hash}: expected {expected}, found {actual}")]
    StaleTransition {
        tx_hash: String,
        expected: SwapStatus,
        actual: SwapStatus,
    },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: SwapStatus, to: SwapStatus },

    #[error("Invalid burn event: {0}")]
    InvalidBurnEvent(String),

    #[error("Invalid signature from {user}: {reason}")]
    InvalidSignature { user: String, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayerError::Database(_) => true,
            RelayerError::ChainTool(e) => !e.is_application(),
            _ => false,
        }
    }

    /// Another worker won the guarded transition; not a failure to report
    pub fn is_lost_race(&self) -> bool {
        matches!(self, RelayerError::StaleTransition { .. })
    }

    /// Check if error should trigger operator attention
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::Broadcast { .. } | RelayerError::Database(_)
        )
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        let invocation = RelayerError::ChainTool(ToolError::Invocation {
            program: "enigmacli".to_string(),
            command: "query tokenswap get".to_string(),
            message: "No such file or directory".to_string(),
        });
        assert!(invocation.is_retryable());

        let rejected = RelayerError::ChainTool(ToolError::Application {
            command: "query tokenswap get".to_string(),
            code: 1,
            log: "not found".to_string(),
        });
        assert!(!rejected.is_retryable());

        let broadcast = RelayerError::Broadcast {
            tx_hash: "0xabc".to_string(),
            source: ToolError::Timeout {
                operation: "combine and broadcast".to_string(),
            },
        };
        assert!(!broadcast.is_retryable());
        assert!(broadcast.should_alert());
    }

    #[test]
    fn test_lost_race() {
        let stale = RelayerError::StaleTransition {
            tx_hash: "0xabc".to_string(),
            expected: SwapStatus::Unsigned,
            actual: SwapStatus::Signed,
        };
        assert!(stale.is_lost_race());
        assert!(!stale.is_retryable());
        assert_eq!(
            stale.to_string(),
            "Stale transition for swap 0xabc: expected UNSIGNED, found SIGNED"
        );
    }
}
