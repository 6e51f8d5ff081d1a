use std::path::{Path, PathBuf};

use testwrap_contracts::{
    ENV_TEST_SHARD_INDEX, ENV_TEST_SHARD_STATUS_FILE, ENV_TEST_TOTAL_SHARDS,
    SHARD_STATUS_FILE_NAME,
};

use crate::error::{Result, WrapperError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardState {
    pub index: u32,
    pub total: u32,
    /// Private output directory for this shard; the status file lives here.
    pub out_dir: PathBuf,
    pub status_file: PathBuf,
}

impl ShardState {
    pub fn is_sharded(&self) -> bool {
        self.total > 1
    }

    /// `shard_<n>_of_<total>` with a 1-based `n`, or empty for unsharded runs.
    pub fn label(&self) -> String {
        if self.is_sharded() {
            format!("shard_{}_of_{}", self.index + 1, self.total)
        } else {
            String::new()
        }
    }

    /// Creates the status file's directory and removes a status file left by an
    /// earlier run. Writing the file is up to the test.
    pub fn prepare(&self) -> Result<()> {
        let dir = self
            .status_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.out_dir.clone());
        std::fs::create_dir_all(&dir).map_err(|source| WrapperError::ShardSetupError {
            index: self.index,
            dir: dir.clone(),
            source,
        })?;
        match std::fs::remove_file(&self.status_file) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(WrapperError::ShardSetupError {
                    index: self.index,
                    dir,
                    source,
                })
            }
        }
        tracing::debug!(
            index = self.index,
            total = self.total,
            dir = %dir.display(),
            "prepared shard status directory"
        );
        Ok(())
    }

    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        if !self.is_sharded() {
            return Vec::new();
        }
        vec![
            (
                ENV_TEST_SHARD_STATUS_FILE,
                self.status_file.display().to_string(),
            ),
            (ENV_TEST_SHARD_INDEX, self.index.to_string()),
            (ENV_TEST_TOTAL_SHARDS, self.total.to_string()),
        ]
    }
}

/// One state per shard index in `0..total`, each with its own output directory.
pub fn plan_shards(total: u32, output_root: &Path) -> Result<Vec<ShardState>> {
    if total == 0 {
        return Err(WrapperError::InvalidInvocation(
            "shard_count must be >= 1".to_string(),
        ));
    }
    let shards = (0..total)
        .map(|index| {
            let out_dir = if total > 1 {
                output_root.join(format!("shard_{}_of_{}", index + 1, total))
            } else {
                output_root.to_path_buf()
            };
            ShardState {
                index,
                total,
                status_file: out_dir.join(SHARD_STATUS_FILE_NAME),
                out_dir,
            }
        })
        .collect();
    Ok(shards)
}
