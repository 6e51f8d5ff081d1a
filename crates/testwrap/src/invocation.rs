//! The fully-resolved test invocation handed over by the orchestrator.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use testwrap_contracts::TESTWRAP_INVOCATION_SCHEMA_VERSION;
use testwrap_runner_common::LaunchStrategy;

use crate::error::{Result, WrapperError};
use crate::runfiles::RunfilesPolicy;

pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_WORKSPACE: &str = "__main__";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeclaredRunfile {
    pub logical: String,
    pub real: PathBuf,
}

/// Immutable once built; every per-run value is derived from it.
#[derive(Debug, Clone)]
pub struct TestInvocation {
    pub exe: PathBuf,
    pub args: Vec<String>,
    pub test_args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub runfiles: Vec<DeclaredRunfile>,
    pub runfiles_policy: RunfilesPolicy,
    pub shard_count: u32,
    pub timeout: Duration,
    pub strategy: Option<LaunchStrategy>,
    pub target: String,
    pub workspace: String,
    pub output_dir: Option<PathBuf>,
}

fn default_schema_version() -> String {
    TESTWRAP_INVOCATION_SCHEMA_VERSION.to_string()
}

fn default_shard_count() -> u32 {
    1
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InvocationDoc {
    #[serde(default = "default_schema_version")]
    schema_version: String,
    exe: PathBuf,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    test_args: Vec<String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    data: Vec<DeclaredRunfile>,
    #[serde(default)]
    runfiles: RunfilesPolicy,
    #[serde(default = "default_shard_count")]
    shard_count: u32,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
    #[serde(default)]
    strategy: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    workspace: Option<String>,
    #[serde(default)]
    output_dir: Option<PathBuf>,
}

impl TestInvocation {
    /// A single-shard invocation with default policy, for callers that fill in the rest.
    pub fn new(exe: impl Into<PathBuf>) -> Self {
        let exe = exe.into();
        TestInvocation {
            target: default_target_for(&exe),
            exe,
            args: Vec::new(),
            test_args: Vec::new(),
            cwd: None,
            runfiles: Vec::new(),
            runfiles_policy: RunfilesPolicy::default(),
            shard_count: 1,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            strategy: None,
            workspace: DEFAULT_WORKSPACE.to_string(),
            output_dir: None,
        }
    }

    pub fn load(path: &Path) -> Result<TestInvocation> {
        let bytes = std::fs::read(path)
            .map_err(|e| WrapperError::io(format!("read invocation: {}", path.display()), e))?;
        Self::from_json_slice(&bytes).map_err(|e| match e {
            WrapperError::InvalidInvocation(msg) => {
                WrapperError::InvalidInvocation(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<TestInvocation> {
        let doc: InvocationDoc = serde_json::from_slice(bytes)
            .map_err(|e| WrapperError::InvalidInvocation(format!("parse JSON: {e}")))?;
        if doc.schema_version.trim() != TESTWRAP_INVOCATION_SCHEMA_VERSION {
            return Err(WrapperError::InvalidInvocation(format!(
                "schema_version mismatch: expected {} got {:?}",
                TESTWRAP_INVOCATION_SCHEMA_VERSION, doc.schema_version
            )));
        }
        let strategy = match doc.strategy.as_deref() {
            Some(raw) => Some(
                LaunchStrategy::from_str(raw)
                    .map_err(|e| WrapperError::InvalidInvocation(e.to_string()))?,
            ),
            None => None,
        };
        let inv = TestInvocation {
            target: doc.target.unwrap_or_else(|| default_target_for(&doc.exe)),
            exe: doc.exe,
            args: doc.args,
            test_args: doc.test_args,
            cwd: doc.cwd,
            runfiles: doc.data,
            runfiles_policy: doc.runfiles,
            shard_count: doc.shard_count,
            timeout: Duration::from_secs(doc.timeout_secs),
            strategy,
            workspace: doc
                .workspace
                .unwrap_or_else(|| DEFAULT_WORKSPACE.to_string()),
            output_dir: doc.output_dir,
        };
        inv.validate()?;
        Ok(inv)
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(WrapperError::InvalidInvocation(msg));
        if self.exe.as_os_str().is_empty() {
            return bad("exe must be non-empty".to_string());
        }
        if self.shard_count == 0 {
            return bad("shard_count must be >= 1".to_string());
        }
        if self.timeout.is_zero() {
            return bad("timeout must be > 0".to_string());
        }
        if !self.runfiles_policy.manifest && !self.runfiles_policy.directory {
            return bad("runfiles policy must enable manifest, directory, or both".to_string());
        }
        for (idx, a) in self.all_args().enumerate() {
            if a.contains('\0') {
                return bad(format!("argument {idx} contains NUL"));
            }
        }
        if self.target.trim().is_empty() {
            return bad("target must be non-empty".to_string());
        }
        Ok(())
    }

    /// Static arguments followed by the user's extra arguments.
    pub fn all_args(&self) -> impl Iterator<Item = &String> + '_ {
        self.args.iter().chain(self.test_args.iter())
    }

    pub fn combined_args(&self) -> Vec<String> {
        self.all_args().cloned().collect()
    }
}

fn default_target_for(exe: &Path) -> String {
    exe.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "test".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_document() {
        let inv = TestInvocation::from_json_slice(br#"{"exe":"/bin/true"}"#).unwrap();
        assert_eq!(inv.exe, PathBuf::from("/bin/true"));
        assert_eq!(inv.shard_count, 1);
        assert_eq!(inv.target, "true");
        assert_eq!(inv.workspace, DEFAULT_WORKSPACE);
        assert!(inv.runfiles_policy.manifest);
        assert!(!inv.runfiles_policy.directory);
        assert_eq!(inv.strategy, None);
    }

    #[test]
    fn parses_full_document_in_order() {
        let doc = br#"{
            "schema_version": "testwrap.invocation@0.1.0",
            "exe": "foo/testargs.sh",
            "args": ["foo", "a b", "", "bar"],
            "test_args": ["baz"],
            "data": [
                {"logical": "ws/foo/b.txt", "real": "/src/foo/b.txt"},
                {"logical": "ws/foo/a.txt", "real": "/src/foo/a.txt"}
            ],
            "runfiles": {"manifest": true, "directory": true},
            "shard_count": 3,
            "timeout_secs": 12,
            "strategy": "script",
            "target": "//foo:testargs_test"
        }"#;
        let inv = TestInvocation::from_json_slice(doc).unwrap();
        assert_eq!(
            inv.combined_args(),
            vec!["foo", "a b", "", "bar", "baz"]
        );
        assert_eq!(inv.runfiles[0].logical, "ws/foo/b.txt");
        assert_eq!(inv.runfiles[1].logical, "ws/foo/a.txt");
        assert_eq!(inv.shard_count, 3);
        assert_eq!(inv.timeout, Duration::from_secs(12));
        assert_eq!(inv.strategy, Some(LaunchStrategy::Interpreter));
        assert_eq!(inv.target, "//foo:testargs_test");
    }

    #[test]
    fn rejects_zero_shards_and_empty_policy() {
        let err = TestInvocation::from_json_slice(br#"{"exe":"t","shard_count":0}"#).unwrap_err();
        assert!(err.to_string().contains("shard_count"), "{err}");

        let err = TestInvocation::from_json_slice(
            br#"{"exe":"t","runfiles":{"manifest":false,"directory":false}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("runfiles policy"), "{err}");
    }

    #[test]
    fn rejects_unknown_strategy_and_fields() {
        let err =
            TestInvocation::from_json_slice(br#"{"exe":"t","strategy":"vm"}"#).unwrap_err();
        assert!(matches!(err, WrapperError::InvalidInvocation(_)));

        let err = TestInvocation::from_json_slice(br#"{"exe":"t","shards":2}"#).unwrap_err();
        assert!(matches!(err, WrapperError::InvalidInvocation(_)));
    }
}
