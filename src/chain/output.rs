//! Parsing of chain tool output
//!
//! The tool is always asked for JSON. An application error is one the tool
//! reports itself, either by exit code or by a non-zero `code` in its JSON.
//! Output that cannot be read is `MalformedOutput`, never a success.

use super::{SwapQueryResult, ToolResult};
use crate::error::ToolError;

use serde::Deserialize;
use serde_json::Value;

/// Result of `tx broadcast --output json`
#[derive(Debug, Deserialize)]
struct BroadcastResponse {
    #[serde(default)]
    txhash: String,
    #[serde(default)]
    code: i64,
    #[serde(default)]
    raw_log: String,
}

fn malformed(command: &str, message: impl Into<String>) -> ToolError {
    ToolError::MalformedOutput {
        command: command.to_string(),
        message: message.into(),
    }
}

/// Parse a JSON document, surfacing errors the tool embedded in it
pub fn parse_json(command: &str, stdout: &str) -> ToolResult<Value> {
    let stdout = stdout.trim();
    if stdout.is_empty() {
        return Err(malformed(command, "empty output"));
    }

    let value: Value = serde_json::from_str(stdout)
        .map_err(|e| malformed(command, format!("invalid JSON: {}", e)))?;

    check_reported_error(command, &value)?;
    Ok(value)
}

fn check_reported_error(command: &str, value: &Value) -> ToolResult<()> {
    let Some(obj) = value.as_object() else {
        return Ok(());
    };

    if let Some(code) = obj.get("code").and_then(Value::as_i64) {
        if code != 0 {
            let log = obj
                .get("raw_log")
                .or_else(|| obj.get("log"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            return Err(ToolError::Application {
                command: command.to_string(),
                code,
                log: log.to_string(),
            });
        }
    }

    if let Some(error) = obj.get("error").and_then(Value::as_str) {
        return Err(ToolError::Application {
            command: command.to_string(),
            code: 1,
            log: error.to_string(),
        });
    }

    Ok(())
}

pub fn parse_query(command: &str, stdout: &str) -> ToolResult<SwapQueryResult> {
    let value = parse_json(command, stdout)?;
    serde_json::from_value(value)
        .map_err(|e| malformed(command, format!("unexpected swap record: {}", e)))
}

/// Extract the transaction hash from a broadcast response
pub fn parse_broadcast(command: &str, stdout: &str) -> ToolResult<String> {
    let stdout = stdout.trim();
    if stdout.is_empty() {
        return Err(malformed(command, "empty output"));
    }

    let resp: BroadcastResponse = serde_json::from_str(stdout)
        .map_err(|e| malformed(command, format!("invalid JSON: {}", e)))?;

    if resp.code != 0 {
        return Err(ToolError::Application {
            command: command.to_string(),
            code: resp.code,
            log: resp.raw_log,
        });
    }
    if resp.txhash.is_empty() {
        return Err(malformed(command, "missing txhash"));
    }

    Ok(resp.txhash)
}
