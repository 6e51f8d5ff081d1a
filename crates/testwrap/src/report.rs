use std::path::Path;

use serde::Serialize;
use testwrap_contracts::TESTWRAP_REPORT_SCHEMA_VERSION;

use crate::error::{Result, WrapperError};
use crate::launcher::{ExecutionResult, Outcome};

#[derive(Debug, Clone, Serialize)]
pub struct WrapperReport {
    pub schema_version: String,
    pub target: String,
    pub strategy: String,
    pub exit_code: u8,
    pub runfiles: RunfilesReport,
    pub shards: Vec<ShardReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunfilesReport {
    pub root: String,
    pub entries: usize,
    pub manifest_sha256: String,
    pub manifest: bool,
    pub directory: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardReport {
    pub index: u32,
    pub total: u32,
    pub outcome: String,
    pub exit_status: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub duration_ms: u64,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub out_dir: String,
    pub xml_file: String,
    pub log_file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub undeclared_outputs_manifest: Option<String>,
}

impl ShardReport {
    pub fn from_result(index: u32, total: u32, res: &ExecutionResult) -> ShardReport {
        ShardReport {
            index,
            total,
            outcome: res.outcome.as_str().to_string(),
            exit_status: res.exit_status,
            signal: match res.outcome {
                Outcome::Signaled { signal } => Some(signal),
                _ => None,
            },
            duration_ms: u64::try_from(res.duration.as_millis()).unwrap_or(u64::MAX),
            stdout_lines: res.stdout_lines.clone(),
            stderr_lines: res.stderr_lines.clone(),
            stdout_truncated: res.stdout_truncated,
            stderr_truncated: res.stderr_truncated,
            out_dir: String::new(),
            xml_file: String::new(),
            log_file: String::new(),
            undeclared_outputs_manifest: None,
        }
    }
}

impl WrapperReport {
    pub fn new(target: &str, strategy: &str, runfiles: RunfilesReport) -> WrapperReport {
        WrapperReport {
            schema_version: TESTWRAP_REPORT_SCHEMA_VERSION.to_string(),
            target: target.to_string(),
            strategy: strategy.to_string(),
            exit_code: 0,
            runfiles,
            shards: Vec::new(),
        }
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        let mut out = serde_json::to_vec_pretty(self).map_err(|e| {
            WrapperError::io("serialize report", std::io::Error::other(e))
        })?;
        out.push(b'\n');
        Ok(out)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| WrapperError::io(format!("create {}", parent.display()), e))?;
        }
        std::fs::write(path, self.to_json_bytes()?)
            .map_err(|e| WrapperError::io(format!("write report: {}", path.display()), e))
    }
}
