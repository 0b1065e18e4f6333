//! Configuration management for the swap relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chain_client: ChainClientConfig,
    #[serde(default)]
    pub signer: SignerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    /// Defaults to a random id per process
    #[serde(default)]
    pub instance_id: String,
    /// Signatures required by the multisig account
    pub threshold: usize,
    pub sweep_interval_ms: u64,
    pub reconcile_interval_ms: u64,
    #[serde(default = "default_max_concurrent_finalize")]
    pub max_concurrent_finalize: usize,
    /// Per-call limit on chain tool invocations
    pub tool_timeout_secs: u64,
    /// SIGNED/SUBMITTED swaps older than this are failed for manual review
    pub submitted_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub health_check_interval_secs: u64,
}

fn default_max_concurrent_finalize() -> usize {
    4
}

impl RelayerConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn submitted_timeout(&self) -> Duration {
        Duration::from_secs(self.submitted_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

/// Settings for the destination chain's command-line tool.
///
/// Passed explicitly into the adapter; nothing is read from the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainClientConfig {
    /// Tool binary, e.g. `enigmacli`
    pub program: String,
    /// Local key used for co-signing
    pub from_account: String,
    /// Bech32 address of the m-of-n account that mints
    pub multisig_address: String,
    /// Keyring name of the multisig account used by `tx multisign`
    pub multisig_key_name: String,
    pub keyring_backend: Option<String>,
    pub home: Option<PathBuf>,
    pub node: Option<String>,
    pub chain_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignerConfig {
    pub enabled: bool,
    /// Identity recorded with this node's signatures
    #[serde(default)]
    pub user: String,
    #[serde(default = "default_signer_interval_ms")]
    pub interval_ms: u64,
}

fn default_signer_interval_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("SWAP_RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse and validate a TOML document
    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let mut settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        if settings.relayer.instance_id.is_empty() {
            settings.relayer.instance_id = uuid::Uuid::new_v4().to_string();
        }

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.relayer.threshold == 0 {
            anyhow::bail!("relayer.threshold must be at least 1");
        }
        if self.relayer.max_concurrent_finalize == 0 {
            anyhow::bail!("relayer.max_concurrent_finalize must be at least 1");
        }
        if self.relayer.sweep_interval_ms == 0 || self.relayer.reconcile_interval_ms == 0 {
            anyhow::bail!("relayer sweep and reconcile intervals must be non-zero");
        }
        if self.signer.enabled && self.signer.interval_ms == 0 {
            anyhow::bail!("signer.interval_ms must be non-zero");
        }
        if self.chain_client.program.is_empty() {
            anyhow::bail!("chain_client.program is required");
        }
        if self.chain_client.multisig_address.is_empty() {
            anyhow::bail!("chain_client.multisig_address is required");
        }
        if self.database.backend == DatabaseBackend::Postgres && self.database.url.is_empty() {
            anyhow::bail!("database.url is required for the postgres backend");
        }
        if self.signer.enabled && self.signer.user.is_empty() {
            anyhow::bail!("signer.user is required when signing is enabled");
        }
        // Otherwise a swap could be expired while its broadcast is in flight.
        if self.relayer.submitted_timeout_secs <= self.relayer.tool_timeout_secs {
            anyhow::bail!(
                "relayer.submitted_timeout_secs ({}) must exceed relayer.tool_timeout_secs ({})",
                self.relayer.submitted_timeout_secs,
                self.relayer.tool_timeout_secs
            );
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[relayer]
threshold = 2
sweep_interval_ms = 1000
reconcile_interval_ms = 5000
tool_timeout_secs = 30
submitted_timeout_secs = 3600
max_retries = 3
retry_delay_ms = 500
health_check_interval_secs = 30

[database]
backend = "memory"

[api]
host = "127.0.0.1"
port = 8080

[metrics]
enabled = false
port = 9090

[chain_client]
program = "enigmacli"
from_account = "operator"
multisig_address = "${SWAP_TEST_MULTISIG}"
multisig_key_name = "multisig"
keyring_backend = "test"
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_parse_sample_config() {
        env::set_var("SWAP_TEST_MULTISIG", "enigma1multisig");
        let settings = Settings::parse(SAMPLE).unwrap();

        assert_eq!(settings.relayer.threshold, 2);
        assert_eq!(settings.relayer.max_concurrent_finalize, 4);
        assert!(!settings.relayer.instance_id.is_empty());
        assert_eq!(settings.database.backend, DatabaseBackend::Memory);
        assert_eq!(settings.chain_client.multisig_address, "enigma1multisig");
        assert_eq!(settings.chain_client.keyring_backend.as_deref(), Some("test"));
        assert!(!settings.signer.enabled);
        assert_eq!(settings.relayer.tool_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_zero_threshold() {
        env::set_var("SWAP_TEST_MULTISIG", "enigma1multisig");
        let doc = SAMPLE.replace("threshold = 2", "threshold = 0");
        let err = Settings::parse(&doc).unwrap_err();
        assert!(err.to_string().contains("threshold"));
    }

    #[test]
    fn test_rejects_expiry_shorter_than_tool_timeout() {
        env::set_var("SWAP_TEST_MULTISIG", "enigma1multisig");
        let doc = SAMPLE.replace("submitted_timeout_secs = 3600", "submitted_timeout_secs = 1");
        let err = Settings::parse(&doc).unwrap_err();
        assert!(err.to_string().contains("submitted_timeout_secs"));

        let doc = SAMPLE.replace("submitted_timeout_secs = 3600", "submitted_timeout_secs = 30");
        assert!(Settings::parse(&doc).is_err());
    }

    #[test]
    fn test_postgres_backend_requires_url() {
        env::set_var("SWAP_TEST_MULTISIG", "enigma1multisig");
        let doc = SAMPLE.replace(r#"backend = "memory""#, r#"backend = "postgres""#);
        assert!(Settings::parse(&doc).is_err());
    }
}
