use std::path::Path;

use serde::Deserialize;
use testwrap_contracts::TESTWRAP_POLICY_SCHEMA_VERSION;

use crate::error::{Result, WrapperError};

fn default_true() -> bool {
    true
}

fn default_schema_version() -> String {
    TESTWRAP_POLICY_SCHEMA_VERSION.to_string()
}

fn default_policy_id() -> String {
    "default".to_string()
}

fn default_kill_grace_ms() -> u64 {
    2_000
}

fn default_max_output_bytes() -> usize {
    64 * 1024 * 1024
}

fn validate_env_key(key: &str) -> Result<(), String> {
    if key.is_empty() {
        return Err("key must be non-empty".to_string());
    }
    if key.contains('=') {
        return Err("key must not contain '='".to_string());
    }
    if key.contains('\0') {
        return Err("key must not contain NUL".to_string());
    }
    Ok(())
}

#[derive(Debug, Clone, Deserialize)]
pub struct Policy {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    #[serde(default = "default_policy_id")]
    pub policy_id: String,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub env: Env,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Limits {
    /// Time between SIGTERM and SIGKILL once a test overruns its timeout.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    /// Per-stream capture cap; output beyond it is drained and dropped.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            kill_grace_ms: default_kill_grace_ms(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Env {
    #[serde(default = "default_true")]
    pub inherit_parent: bool,
    #[serde(default)]
    pub allow_keys: Vec<String>,
    #[serde(default)]
    pub deny_keys: Vec<String>,
}

impl Default for Env {
    fn default() -> Self {
        Env {
            inherit_parent: true,
            allow_keys: Vec::new(),
            deny_keys: Vec::new(),
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            schema_version: default_schema_version(),
            policy_id: default_policy_id(),
            limits: Limits::default(),
            env: Env::default(),
        }
    }
}

impl Policy {
    pub fn load(path: &Path) -> Result<Policy> {
        let txt = std::fs::read_to_string(path)
            .map_err(|e| WrapperError::io(format!("read policy: {}", path.display()), e))?;
        let pol: Policy = serde_json::from_str(&txt).map_err(|e| {
            WrapperError::InvalidPolicy(format!("parse policy JSON {}: {e}", path.display()))
        })?;
        pol.validate_basic().map_err(WrapperError::InvalidPolicy)?;
        Ok(pol)
    }

    pub fn validate_basic(&self) -> Result<(), String> {
        if self.schema_version.trim() != TESTWRAP_POLICY_SCHEMA_VERSION {
            return Err(format!(
                "policy.schema_version mismatch: expected {} got {:?}",
                TESTWRAP_POLICY_SCHEMA_VERSION, self.schema_version
            ));
        }
        if self.policy_id.trim().is_empty() {
            return Err("policy.policy_id must be non-empty".to_string());
        }
        if self.limits.kill_grace_ms > 600_000 {
            return Err(format!(
                "policy.limits.kill_grace_ms must be 0..600000 (got {})",
                self.limits.kill_grace_ms
            ));
        }
        if self.limits.max_output_bytes < 1024 {
            return Err(format!(
                "policy.limits.max_output_bytes must be >= 1024 (got {})",
                self.limits.max_output_bytes
            ));
        }
        for (idx, v) in self.env.allow_keys.iter().enumerate() {
            validate_env_key(v)
                .map_err(|e| format!("policy.env.allow_keys[{idx}] is invalid: {e}"))?;
        }
        for (idx, v) in self.env.deny_keys.iter().enumerate() {
            validate_env_key(v)
                .map_err(|e| format!("policy.env.deny_keys[{idx}] is invalid: {e}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_takes_defaults() {
        let pol: Policy = serde_json::from_str("{}").unwrap();
        pol.validate_basic().unwrap();
        assert!(pol.env.inherit_parent);
        assert_eq!(pol.limits.kill_grace_ms, 2_000);
    }

    #[test]
    fn rejects_schema_mismatch() {
        let pol: Policy =
            serde_json::from_str(r#"{"schema_version":"testwrap.policy@9.9.9"}"#).unwrap();
        let err = pol.validate_basic().unwrap_err();
        assert!(err.contains("schema_version mismatch"), "{err}");
    }

    #[test]
    fn rejects_malformed_env_keys() {
        let pol: Policy = serde_json::from_str(r#"{"env":{"deny_keys":["A=B"]}}"#).unwrap();
        let err = pol.validate_basic().unwrap_err();
        assert!(err.contains("policy.env.deny_keys[0]"), "{err}");

        let pol: Policy = serde_json::from_str(r#"{"env":{"allow_keys":[""]}}"#).unwrap();
        assert!(pol.validate_basic().is_err());
    }

    #[test]
    fn rejects_tiny_output_cap() {
        let pol: Policy =
            serde_json::from_str(r#"{"limits":{"max_output_bytes":10}}"#).unwrap();
        assert!(pol.validate_basic().is_err());
    }
}
