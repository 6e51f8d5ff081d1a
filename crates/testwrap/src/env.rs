//! Builds the exact environment a test process starts with.
//!
//! Everything the builder looks at is passed in through [`EnvInputs`]; it never
//! reads the wrapper's own process environment, so the result is a pure function
//! of its inputs.

use std::collections::btree_map;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use testwrap_contracts::{
    is_internal_only_env_key, ENV_HOME, ENV_RUNFILES_DIR, ENV_RUNFILES_MANIFEST_FILE,
    ENV_RUNFILES_MANIFEST_ONLY, ENV_TEST_SHARD_INDEX, ENV_TEST_SHARD_STATUS_FILE,
    ENV_TEST_SRCDIR, ENV_TEST_TARGET, ENV_TEST_TIMEOUT, ENV_TEST_TMPDIR,
    ENV_TEST_TOTAL_SHARDS, ENV_TEST_UNDECLARED_OUTPUTS_DIR, ENV_TEST_WORKSPACE, ENV_USER,
    ENV_XML_OUTPUT_FILE, PUBLIC_ENV_KEYS,
};

use crate::error::{Result, WrapperError};
use crate::outputs::OutputLayout;
use crate::policy;
use crate::runfiles::RunfilesTree;
use crate::shard::ShardState;

/// Keys only the wrapper decides; inherited values are dropped so a stale
/// parent value never contradicts the current policy or shard.
const WRAPPER_OWNED_KEYS: &[&str] = &[
    ENV_RUNFILES_DIR,
    ENV_RUNFILES_MANIFEST_FILE,
    ENV_RUNFILES_MANIFEST_ONLY,
    ENV_TEST_SHARD_STATUS_FILE,
    ENV_TEST_SHARD_INDEX,
    ENV_TEST_TOTAL_SHARDS,
];

const USER_FALLBACK_KEYS: &[&str] = &["USER", "LOGNAME", "USERNAME"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentSet {
    vars: BTreeMap<String, String>,
}

impl EnvironmentSet {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.vars.iter()
    }

    fn set(&mut self, key: &str, value: impl Into<String>) {
        self.vars.insert(key.to_string(), value.into());
    }
}

impl FromIterator<(String, String)> for EnvironmentSet {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        EnvironmentSet {
            vars: iter.into_iter().collect(),
        }
    }
}

pub struct EnvInputs<'a> {
    pub parent: &'a BTreeMap<String, String>,
    pub policy: &'a policy::Env,
    pub runfiles: &'a RunfilesTree,
    pub shard: &'a ShardState,
    pub layout: &'a OutputLayout,
    pub target: &'a str,
    pub workspace: &'a str,
    pub timeout: Duration,
    /// Identity used when the parent environment names no user.
    pub fallback_user: &'a str,
}

fn inherits(policy: &policy::Env, key: &str) -> bool {
    if !policy.inherit_parent {
        return false;
    }
    if is_internal_only_env_key(key) || WRAPPER_OWNED_KEYS.contains(&key) {
        return false;
    }
    if policy.deny_keys.iter().any(|k| k == key) {
        return false;
    }
    policy.allow_keys.is_empty() || policy.allow_keys.iter().any(|k| k == key)
}

fn resolve_user(parent: &BTreeMap<String, String>, fallback: &str) -> String {
    USER_FALLBACK_KEYS
        .iter()
        .filter_map(|k| parent.get(*k))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .or_else(|| Some(fallback.trim()).filter(|v| !v.is_empty()))
        .unwrap_or("nobody")
        .to_string()
}

fn require_absolute(key: &str, p: &Path) -> Result<()> {
    if p.is_absolute() {
        Ok(())
    } else {
        Err(WrapperError::InvalidInvocation(format!(
            "{key} must be an absolute path, got {}",
            p.display()
        )))
    }
}

pub fn build_environment(inputs: &EnvInputs<'_>) -> Result<EnvironmentSet> {
    let mut env = EnvironmentSet::default();

    for (k, v) in inputs.parent {
        if inherits(inputs.policy, k) {
            env.set(k, v.clone());
        }
    }

    let tmp = &inputs.layout.tmp_dir;
    require_absolute(ENV_TEST_TMPDIR, tmp)?;
    require_absolute(ENV_TEST_SRCDIR, &inputs.runfiles.root)?;

    env.set(ENV_TEST_TMPDIR, tmp.display().to_string());
    env.set(ENV_HOME, tmp.display().to_string());
    env.set(ENV_TEST_SRCDIR, inputs.runfiles.root.display().to_string());
    env.set(ENV_USER, resolve_user(inputs.parent, inputs.fallback_user));
    env.set(ENV_TEST_TARGET, inputs.target);
    env.set(ENV_TEST_WORKSPACE, inputs.workspace);
    env.set(ENV_TEST_TIMEOUT, inputs.timeout.as_secs().max(1).to_string());
    env.set(
        ENV_TEST_UNDECLARED_OUTPUTS_DIR,
        inputs.layout.undeclared_outputs_dir.display().to_string(),
    );
    env.set(
        ENV_XML_OUTPUT_FILE,
        inputs.layout.xml_output_file.display().to_string(),
    );

    for (k, v) in inputs.runfiles.env_vars() {
        env.set(k, v);
    }
    for (k, v) in inputs.shard.env_vars() {
        env.set(k, v);
    }

    for key in PUBLIC_ENV_KEYS {
        if env.get(key).map_or(true, str::is_empty) {
            return Err(WrapperError::InvalidInvocation(format!(
                "{key} would be empty in the test environment"
            )));
        }
    }
    debug_assert!(!env.iter().any(|(k, _)| is_internal_only_env_key(k)));

    tracing::trace!(
        vars = env.len(),
        shard = inputs.shard.index,
        "built test environment"
    );
    Ok(env)
}

/// Snapshot of this process's environment, lossily decoded.
pub fn parent_env_snapshot() -> BTreeMap<String, String> {
    std::env::vars_os()
        .map(|(k, v)| {
            (
                k.to_string_lossy().into_owned(),
                v.to_string_lossy().into_owned(),
            )
        })
        .collect()
}

/// Identity of the user running the wrapper when no variable names one.
pub fn current_user_fallback() -> String {
    #[cfg(unix)]
    {
        let uid = unsafe { libc::getuid() };
        format!("uid{uid}")
    }
    #[cfg(not(unix))]
    {
        "unknown".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::DeclaredRunfile;
    use crate::runfiles::{resolve, RunfilesManifest, RunfilesPolicy};
    use crate::shard::plan_shards;
    use testwrap_contracts::{
        ENV_TEST_UNDECLARED_OUTPUTS_MANIFEST, ENV_TEST_UNUSED_RUNFILES_LOG_FILE,
    };

    struct Fixture {
        _tmp: tempfile::TempDir,
        tree: RunfilesTree,
        shards: Vec<ShardState>,
        layouts: Vec<OutputLayout>,
    }

    fn fixture(total: u32, policy: RunfilesPolicy) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(tmp.path()).unwrap();
        let data = root.join("data.txt");
        std::fs::write(&data, "x").unwrap();
        let manifest = RunfilesManifest::from_declared(&[DeclaredRunfile {
            logical: "ws/data.txt".to_string(),
            real: data,
        }])
        .unwrap();
        let tree = resolve(&manifest, &root.join("t.runfiles"), policy).unwrap();
        let shards = plan_shards(total, &root.join("out")).unwrap();
        let layouts = shards
            .iter()
            .map(|s| {
                let l = OutputLayout::for_shard(s);
                l.create().unwrap();
                l
            })
            .collect();
        Fixture {
            _tmp: tmp,
            tree,
            shards,
            layouts,
        }
    }

    fn build(
        fx: &Fixture,
        shard: usize,
        parent: &BTreeMap<String, String>,
        pol: &policy::Env,
        fallback_user: &str,
    ) -> Result<EnvironmentSet> {
        build_environment(&EnvInputs {
            parent,
            policy: pol,
            runfiles: &fx.tree,
            shard: &fx.shards[shard],
            layout: &fx.layouts[shard],
            target: "//foo:t",
            workspace: "ws",
            timeout: Duration::from_secs(60),
            fallback_user,
        })
    }

    fn parent(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn public_variables_are_present_and_absolute() {
        let fx = fixture(1, RunfilesPolicy::default());
        let env = build(&fx, 0, &parent(&[]), &policy::Env::default(), "uid0").unwrap();
        for key in PUBLIC_ENV_KEYS {
            assert!(!env.get(key).unwrap().is_empty(), "{key}");
        }
        let src = Path::new(env.get(ENV_TEST_SRCDIR).unwrap());
        let tmp = Path::new(env.get(ENV_TEST_TMPDIR).unwrap());
        assert!(src.is_absolute() && src.is_dir());
        assert!(src.join("MANIFEST").is_file());
        assert!(tmp.is_absolute() && tmp.is_dir());
        assert!(Path::new(env.get(ENV_HOME).unwrap()).is_absolute());
        assert_eq!(env.get(ENV_USER), Some("uid0"));
        assert_eq!(env.get(ENV_TEST_TIMEOUT), Some("60"));
    }

    #[test]
    fn internal_variables_never_forwarded() {
        let fx = fixture(1, RunfilesPolicy::default());
        let p = parent(&[
            (ENV_TEST_UNDECLARED_OUTPUTS_MANIFEST, "/secret/MANIFEST"),
            (ENV_TEST_UNUSED_RUNFILES_LOG_FILE, "/secret/unused"),
            ("TESTWRAP_LAUNCH_STRATEGY", "native"),
            ("HOME", "/home/real"),
            ("PATH", "/usr/bin"),
        ]);
        let pol = policy::Env {
            inherit_parent: true,
            allow_keys: vec![
                ENV_TEST_UNDECLARED_OUTPUTS_MANIFEST.to_string(),
                "PATH".to_string(),
            ],
            deny_keys: Vec::new(),
        };
        let env = build(&fx, 0, &p, &pol, "u").unwrap();
        assert!(!env.contains(ENV_TEST_UNDECLARED_OUTPUTS_MANIFEST));
        assert!(!env.contains(ENV_TEST_UNUSED_RUNFILES_LOG_FILE));
        assert!(!env.contains("TESTWRAP_LAUNCH_STRATEGY"));
        assert_eq!(env.get("PATH"), Some("/usr/bin"));
        assert_ne!(env.get(ENV_HOME), Some("/home/real"));
    }

    #[test]
    fn deny_keys_and_inherit_flag_are_honored() {
        let fx = fixture(1, RunfilesPolicy::default());
        let p = parent(&[("SECRET_TOKEN", "x"), ("LANG", "C")]);
        let pol = policy::Env {
            inherit_parent: true,
            allow_keys: Vec::new(),
            deny_keys: vec!["SECRET_TOKEN".to_string()],
        };
        let env = build(&fx, 0, &p, &pol, "u").unwrap();
        assert!(!env.contains("SECRET_TOKEN"));
        assert_eq!(env.get("LANG"), Some("C"));

        let pol = policy::Env {
            inherit_parent: false,
            ..policy::Env::default()
        };
        let env = build(&fx, 0, &p, &pol, "u").unwrap();
        assert!(!env.contains("LANG"));
    }

    #[test]
    fn user_comes_from_parent_before_fallback() {
        let fx = fixture(1, RunfilesPolicy::default());
        let env = build(
            &fx,
            0,
            &parent(&[("LOGNAME", "alice")]),
            &policy::Env::default(),
            "uid7",
        )
        .unwrap();
        assert_eq!(env.get(ENV_USER), Some("alice"));

        let env = build(&fx, 0, &parent(&[("USER", " ")]), &policy::Env::default(), "")
            .unwrap();
        assert_eq!(env.get(ENV_USER), Some("nobody"));
    }

    #[test]
    fn shard_variables_only_when_sharded() {
        let fx = fixture(2, RunfilesPolicy::default());
        let env = build(&fx, 1, &parent(&[]), &policy::Env::default(), "u").unwrap();
        assert_eq!(env.get(ENV_TEST_SHARD_INDEX), Some("1"));
        assert_eq!(env.get(ENV_TEST_TOTAL_SHARDS), Some("2"));
        let status = Path::new(env.get(ENV_TEST_SHARD_STATUS_FILE).unwrap());
        assert!(status.parent().unwrap().is_dir());

        let fx = fixture(1, RunfilesPolicy::default());
        let p = parent(&[(ENV_TEST_SHARD_INDEX, "5"), (ENV_TEST_TOTAL_SHARDS, "9")]);
        let env = build(&fx, 0, &p, &policy::Env::default(), "u").unwrap();
        assert!(!env.contains(ENV_TEST_SHARD_INDEX));
        assert!(!env.contains(ENV_TEST_TOTAL_SHARDS));
    }

    #[test]
    fn runfiles_variables_follow_policy_not_parent() {
        let fx = fixture(
            1,
            RunfilesPolicy {
                manifest: true,
                directory: true,
            },
        );
        let p = parent(&[(ENV_RUNFILES_MANIFEST_ONLY, "1")]);
        let env = build(&fx, 0, &p, &policy::Env::default(), "u").unwrap();
        assert!(!env.contains(ENV_RUNFILES_MANIFEST_ONLY));
        assert!(env.contains(ENV_RUNFILES_MANIFEST_FILE));
        assert_eq!(env.get(ENV_RUNFILES_DIR), env.get(ENV_TEST_SRCDIR));

        let fx = fixture(1, RunfilesPolicy::default());
        let env = build(&fx, 0, &parent(&[]), &policy::Env::default(), "u").unwrap();
        assert_eq!(env.get(ENV_RUNFILES_MANIFEST_ONLY), Some("1"));
        assert!(env.contains(ENV_RUNFILES_DIR));
    }
}
