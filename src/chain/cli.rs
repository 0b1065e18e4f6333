//! Chain client that drives the destination chain's CLI
//!
//! Works with any Cosmos-SDK style tool exposing `tx tokenswap create`,
//! `query tokenswap get`, `tx sign`, `tx multisign` and `tx broadcast`.

use super::output::{parse_broadcast, parse_json, parse_query};
use super::{ChainClient, SwapQueryResult, ToolResult};
use crate::config::ChainClientConfig;
use crate::error::{RelayerError, RelayerResult, ToolError};
use crate::swap::Signature;

use async_trait::async_trait;
use num_bigint::BigUint;
use std::path::Path;
use tempfile::{NamedTempFile, TempDir};
use tokio::process::Command;
use tracing::{debug, info};

/// Shells out to the configured chain tool
pub struct CliChainClient {
    config: ChainClientConfig,
    /// Scratch space for transaction and signature files
    work_dir: TempDir,
}

impl CliChainClient {
    pub fn new(config: ChainClientConfig) -> RelayerResult<Self> {
        let work_dir = tempfile::Builder::new()
            .prefix("swap-relayer-")
            .tempdir()
            .map_err(|e| RelayerError::Internal(format!("create work dir: {}", e)))?;

        info!(
            "Chain client using `{}` for multisig {}",
            config.program, config.multisig_address
        );

        Ok(Self { config, work_dir })
    }

    /// Flags understood by every subcommand
    fn global_flags(&self) -> Vec<String> {
        let mut flags = Vec::new();
        if let Some(home) = &self.config.home {
            flags.push("--home".to_string());
            flags.push(home.display().to_string());
        }
        if let Some(node) = &self.config.node {
            flags.push("--node".to_string());
            flags.push(node.clone());
        }
        flags
    }

    /// Flags for subcommands that touch keys or build transactions
    fn tx_flags(&self) -> Vec<String> {
        let mut flags = self.global_flags();
        if let Some(backend) = &self.config.keyring_backend {
            flags.push("--keyring-backend".to_string());
            flags.push(backend.clone());
        }
        if let Some(chain_id) = &self.config.chain_id {
            flags.push("--chain-id".to_string());
            flags.push(chain_id.clone());
        }
        flags
    }

    pub(crate) fn generate_args(
        &self,
        eth_tx_hash: &str,
        sender_address: &str,
        amount: &BigUint,
        recipient_address: &str,
    ) -> Vec<String> {
        let mut args = vec![
            "tx".to_string(),
            "tokenswap".to_string(),
            "create".to_string(),
            eth_tx_hash.to_string(),
            sender_address.to_string(),
            amount.to_str_radix(10),
            recipient_address.to_string(),
            format!("--from={}", self.config.multisig_address),
            "--generate-only".to_string(),
        ];
        args.extend(self.tx_flags());
        args
    }

    pub(crate) fn sign_args(&self, unsigned_file: &Path, signer: &str) -> Vec<String> {
        let mut args = vec![
            "tx".to_string(),
            "sign".to_string(),
            unsigned_file.display().to_string(),
            "--multisig".to_string(),
            self.config.multisig_address.clone(),
            format!("--from={}", signer),
            "--yes".to_string(),
        ];
        args.extend(self.tx_flags());
        args
    }

    pub(crate) fn multisign_args(&self, unsigned_file: &Path, sig_files: &[&Path]) -> Vec<String> {
        let mut args = vec![
            "tx".to_string(),
            "multisign".to_string(),
            unsigned_file.display().to_string(),
            self.config.multisig_key_name.clone(),
        ];
        args.extend(sig_files.iter().map(|p| p.display().to_string()));
        args.push("--yes".to_string());
        args.extend(self.tx_flags());
        args
    }

    /// Write `contents` to a fresh file in the work dir
    async fn stage(&self, prefix: &str, contents: &[u8]) -> ToolResult<NamedTempFile> {
        let file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".json")
            .tempfile_in(self.work_dir.path())
            .map_err(|e| self.invocation_error("stage file", e.to_string()))?;

        tokio::fs::write(file.path(), contents)
            .await
            .map_err(|e| self.invocation_error("stage file", e.to_string()))?;

        Ok(file)
    }

    fn invocation_error(&self, command: &str, message: String) -> ToolError {
        ToolError::Invocation {
            program: self.config.program.clone(),
            command: command.to_string(),
            message,
        }
    }

    /// Run the tool and return its stdout.
    ///
    /// A non-zero exit is the tool reporting an error; a missing exit code
    /// (signal) or spawn failure is an invocation failure.
    async fn run(&self, args: &[String]) -> ToolResult<String> {
        let command = command_label(args);
        debug!(program = %self.config.program, ?args, "Invoking chain tool");

        let output = Command::new(&self.config.program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.invocation_error(&command, e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        match output.status.code() {
            Some(code) => Err(ToolError::Application {
                command,
                code: code as i64,
                log: if stderr.is_empty() {
                    stdout.trim().to_string()
                } else {
                    stderr
                },
            }),
            None => Err(self.invocation_error(&command, format!("terminated: {}", output.status))),
        }
    }
}

/// Leading subcommand words, e.g. `tx tokenswap create`
fn command_label(args: &[String]) -> String {
    args.iter()
        .take_while(|a| !a.starts_with('-') && !a.contains('/') && !a.starts_with("0x"))
        .take(3)
        .cloned()
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl ChainClient for CliChainClient {
    async fn generate_unsigned_transaction(
        &self,
        eth_tx_hash: &str,
        sender_address: &str,
        amount: &BigUint,
        recipient_address: &str,
    ) -> ToolResult<serde_json::Value> {
        let args = self.generate_args(eth_tx_hash, sender_address, amount, recipient_address);
        let stdout = self.run(&args).await?;
        parse_json(&command_label(&args), &stdout)
    }

    async fn query_swap_status(&self, eth_tx_hash: &str) -> ToolResult<SwapQueryResult> {
        let mut args = vec![
            "query".to_string(),
            "tokenswap".to_string(),
            "get".to_string(),
            eth_tx_hash.to_string(),
            "--output".to_string(),
            "json".to_string(),
        ];
        args.extend(self.global_flags());

        let stdout = self.run(&args).await?;
        parse_query(&command_label(&args), &stdout)
    }

    async fn co_sign(
        &self,
        unsigned_tx: &serde_json::Value,
        signer: &str,
    ) -> ToolResult<String> {
        let unsigned = self
            .stage("unsigned-", unsigned_tx.to_string().as_bytes())
            .await?;

        let args = self.sign_args(unsigned.path(), signer);
        let stdout = self.run(&args).await?;

        // The signature document is stored verbatim; only check it is one.
        parse_json(&command_label(&args), &stdout)?;
        Ok(stdout.trim().to_string())
    }

    async fn combine_and_broadcast(
        &self,
        unsigned_tx: &serde_json::Value,
        signatures: &[Signature],
    ) -> ToolResult<String> {
        let unsigned = self
            .stage("unsigned-", unsigned_tx.to_string().as_bytes())
            .await?;

        // Signer identities are opaque and never become part of a path.
        let mut sig_files = Vec::with_capacity(signatures.len());
        for (i, sig) in signatures.iter().enumerate() {
            sig_files.push(
                self.stage(&format!("signed-{}-", i), sig.signature.as_bytes())
                    .await?,
            );
        }
        let sig_paths: Vec<&Path> = sig_files.iter().map(|f| f.path()).collect();

        let args = self.multisign_args(unsigned.path(), &sig_paths);
        let stdout = self.run(&args).await?;
        let signed_tx = parse_json(&command_label(&args), &stdout)?;

        let signed = self.stage("multisigned-", signed_tx.to_string().as_bytes()).await?;
        let mut args = vec![
            "tx".to_string(),
            "broadcast".to_string(),
            signed.path().display().to_string(),
            "--output".to_string(),
            "json".to_string(),
        ];
        args.extend(self.tx_flags());

        let stdout = self.run(&args).await?;
        let tx_hash = parse_broadcast(&command_label(&args), &stdout)?;

        info!(
            "Broadcast multisig tx {} with {} signatures",
            tx_hash,
            signatures.len()
        );
        Ok(tx_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(program: &str) -> ChainClientConfig {
        ChainClientConfig {
            program: program.to_string(),
            from_account: "operator".to_string(),
            multisig_address: "enigma1multisig".to_string(),
            multisig_key_name: "multisig".to_string(),
            keyring_backend: Some("test".to_string()),
            home: None,
            node: Some("tcp://localhost:26657".to_string()),
            chain_id: None,
        }
    }

    #[test]
    fn test_generate_args_keep_full_precision_amount() {
        let client = CliChainClient::new(config("enigmacli")).unwrap();
        let amount: BigUint = "98765432109876543210987654321".parse().unwrap();

        let args = client.generate_args("0xburn", "0xsender", &amount, "enigma1rcpt");
        assert_eq!(
            args,
            vec![
                "tx",
                "tokenswap",
                "create",
                "0xburn",
                "0xsender",
                "98765432109876543210987654321",
                "enigma1rcpt",
                "--from=enigma1multisig",
                "--generate-only",
                "--node",
                "tcp://localhost:26657",
                "--keyring-backend",
                "test",
            ]
        );
        assert_eq!(command_label(&args), "tx tokenswap create");
    }

    #[test]
    fn test_multisign_args_list_every_signature_file() {
        let client = CliChainClient::new(config("enigmacli")).unwrap();
        let a = Path::new("/tmp/a.json");
        let b = Path::new("/tmp/b.json");

        let args = client.multisign_args(Path::new("/tmp/unsigned.json"), &[a, b]);
        assert_eq!(&args[..4], &["tx", "multisign", "/tmp/unsigned.json", "multisig"]);
        assert_eq!(&args[4..7], &["/tmp/a.json", "/tmp/b.json", "--yes"]);
        assert_eq!(command_label(&args), "tx multisign");
    }

    #[tokio::test]
    async fn test_missing_program_is_invocation_failure() {
        let client = CliChainClient::new(config("/nonexistent/enigmacli")).unwrap();
        let err = client.query_swap_status("0xburn").await.unwrap_err();
        assert!(matches!(err, ToolError::Invocation { .. }), "{:?}", err);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_application_error() {
        let client = CliChainClient::new(config("false")).unwrap();
        let err = client.query_swap_status("0xburn").await.unwrap_err();
        assert!(err.is_application(), "{:?}", err);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unstructured_output_is_malformed() {
        // `echo` succeeds but prints its arguments rather than JSON.
        let client = CliChainClient::new(config("echo")).unwrap();
        let err = client.query_swap_status("0xburn").await.unwrap_err();
        assert!(matches!(err, ToolError::MalformedOutput { .. }), "{:?}", err);

        let err = client
            .co_sign(&json!({"type": "StdTx"}), "operator")
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::MalformedOutput { .. }), "{:?}", err);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_signer_identity_is_not_used_in_file_names() {
        let client = CliChainClient::new(config("echo")).unwrap();
        let signatures = vec![
            Signature::new("0xburn", "alice", r#"{"sig":"a"}"#),
            Signature::new("0xburn", "bob/../x", r#"{"sig":"b"}"#),
        ];

        // Staging succeeds, so the run reaches the tool and fails on its output.
        let err = client
            .combine_and_broadcast(&json!({"type": "StdTx"}), &signatures)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::MalformedOutput { .. }), "{:?}", err);

        let err = client
            .co_sign(&json!({"type": "StdTx"}), "ops/key")
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::MalformedOutput { .. }), "{:?}", err);
    }
}
