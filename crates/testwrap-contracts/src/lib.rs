//! Shared, version-pinned protocol identifiers.
//!
//! These constants are the single source of truth for the names and numbers that
//! other tools depend on byte-for-byte: environment variables exported to test
//! processes, reserved wrapper exit codes, and schema strings that appear in
//! machine-readable I/O.

pub const TESTWRAP_INVOCATION_SCHEMA_VERSION: &str = "testwrap.invocation@0.1.0";
pub const TESTWRAP_POLICY_SCHEMA_VERSION: &str = "testwrap.policy@0.1.0";
pub const TESTWRAP_REPORT_SCHEMA_VERSION: &str = "testwrap.report@0.1.0";

pub const ENV_HOME: &str = "HOME";
pub const ENV_USER: &str = "USER";
pub const ENV_TEST_SRCDIR: &str = "TEST_SRCDIR";
pub const ENV_TEST_TMPDIR: &str = "TEST_TMPDIR";
pub const ENV_TEST_TARGET: &str = "TEST_TARGET";
pub const ENV_TEST_WORKSPACE: &str = "TEST_WORKSPACE";
pub const ENV_TEST_TIMEOUT: &str = "TEST_TIMEOUT";
pub const ENV_TEST_UNDECLARED_OUTPUTS_DIR: &str = "TEST_UNDECLARED_OUTPUTS_DIR";
pub const ENV_XML_OUTPUT_FILE: &str = "XML_OUTPUT_FILE";

pub const ENV_RUNFILES_DIR: &str = "RUNFILES_DIR";
pub const ENV_RUNFILES_MANIFEST_FILE: &str = "RUNFILES_MANIFEST_FILE";
pub const ENV_RUNFILES_MANIFEST_ONLY: &str = "RUNFILES_MANIFEST_ONLY";

pub const ENV_TEST_SHARD_STATUS_FILE: &str = "TEST_SHARD_STATUS_FILE";
pub const ENV_TEST_SHARD_INDEX: &str = "TEST_SHARD_INDEX";
pub const ENV_TEST_TOTAL_SHARDS: &str = "TEST_TOTAL_SHARDS";

pub const ENV_TEST_UNDECLARED_OUTPUTS_MANIFEST: &str = "TEST_UNDECLARED_OUTPUTS_MANIFEST";
pub const ENV_TEST_UNDECLARED_OUTPUTS_ANNOTATIONS: &str = "TEST_UNDECLARED_OUTPUTS_ANNOTATIONS";
pub const ENV_TEST_UNUSED_RUNFILES_LOG_FILE: &str = "TEST_UNUSED_RUNFILES_LOG_FILE";
pub const ENV_TEST_INFRASTRUCTURE_FAILURE_FILE: &str = "TEST_INFRASTRUCTURE_FAILURE_FILE";

/// Prefix shared by every wrapper setting read from the environment.
pub const WRAPPER_ENV_PREFIX: &str = "TESTWRAP_";

/// Orchestrator/wrapper bookkeeping variables. A test process must never see these.
pub const INTERNAL_ONLY_ENV_KEYS: &[&str] = &[
    ENV_TEST_UNDECLARED_OUTPUTS_MANIFEST,
    ENV_TEST_UNDECLARED_OUTPUTS_ANNOTATIONS,
    ENV_TEST_UNUSED_RUNFILES_LOG_FILE,
    ENV_TEST_INFRASTRUCTURE_FAILURE_FILE,
];

/// Variables that are always present and non-empty in a test process.
pub const PUBLIC_ENV_KEYS: &[&str] = &[ENV_HOME, ENV_TEST_SRCDIR, ENV_TEST_TMPDIR, ENV_USER];

pub fn is_internal_only_env_key(key: &str) -> bool {
    key.starts_with(WRAPPER_ENV_PREFIX) || INTERNAL_ONLY_ENV_KEYS.contains(&key)
}

pub const RUNFILES_MANIFEST_FILE_NAME: &str = "MANIFEST";
pub const SHARD_STATUS_FILE_NAME: &str = "test.shard";
pub const TEST_XML_FILE_NAME: &str = "test.xml";
pub const TEST_LOG_FILE_NAME: &str = "test.log";
pub const UNDECLARED_OUTPUTS_DIR_NAME: &str = "undeclared_outputs";
pub const UNDECLARED_OUTPUTS_MANIFEST_DIR_NAME: &str = "test.outputs_manifest";
pub const UNDECLARED_OUTPUTS_MANIFEST_FILE_NAME: &str = "MANIFEST";

pub const EXIT_PASS: u8 = 0;
pub const EXIT_TIMEOUT: u8 = 124;
pub const EXIT_SETUP_FAILURE: u8 = 125;
pub const EXIT_LAUNCH_FAILURE: u8 = 127;
pub const EXIT_SIGNAL_BASE: i32 = 128;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_only_keys_include_wrapper_settings() {
        assert!(is_internal_only_env_key("TEST_UNDECLARED_OUTPUTS_MANIFEST"));
        assert!(is_internal_only_env_key("TESTWRAP_LAUNCH_STRATEGY"));
        assert!(!is_internal_only_env_key("TEST_TMPDIR"));
        assert!(!is_internal_only_env_key("HOME"));
    }

    #[test]
    fn public_keys_are_never_internal() {
        for key in PUBLIC_ENV_KEYS {
            assert!(!is_internal_only_env_key(key), "{key}");
        }
    }
}
