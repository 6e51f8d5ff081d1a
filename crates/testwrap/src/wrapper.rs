//! One wrapper run: setup, per-shard launch, and teardown.
//!
//! Every fallible setup step (runfiles, shard directories, environments) runs
//! before the first child is spawned, so a bad invocation never starts a test.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use testwrap_runner_common::LaunchStrategy;

use crate::env::{self, EnvInputs, EnvironmentSet};
use crate::error::{Result, WrapperError};
use crate::invocation::TestInvocation;
use crate::launcher::{self, ExecutionResult};
use crate::outputs::{self, OutputLayout};
use crate::policy::Policy;
use crate::report::{RunfilesReport, ShardReport, WrapperReport};
use crate::runfiles::{self, RunfilesManifest, RunfilesTree};
use crate::shard::{self, ShardState};
use crate::strategy::{Launcher, Marshalled};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub strategy: LaunchStrategy,
    pub interpreter: Option<PathBuf>,
    pub policy: Policy,
    /// Shards allowed to run at once; 0 is treated as 1.
    pub jobs: usize,
    /// Keep the temporary output root when the invocation names none.
    pub keep_outputs: bool,
    pub parent_env: BTreeMap<String, String>,
    pub fallback_user: String,
}

impl RunOptions {
    pub fn new(strategy: LaunchStrategy) -> RunOptions {
        RunOptions {
            strategy,
            interpreter: None,
            policy: Policy::default(),
            jobs: 1,
            keep_outputs: false,
            parent_env: BTreeMap::new(),
            fallback_user: env::current_user_fallback(),
        }
    }
}

#[derive(Debug)]
pub struct ShardRun {
    pub shard: ShardState,
    pub layout: OutputLayout,
    pub result: ExecutionResult,
}

#[derive(Debug)]
pub struct WrapperRun {
    pub exit_code: u8,
    pub output_root: PathBuf,
    pub runfiles: RunfilesTree,
    pub shards: Vec<ShardRun>,
    pub report: WrapperReport,
    /// Owns the temporary output root; dropping it removes the directory.
    _temp_root: Option<tempfile::TempDir>,
}

impl WrapperRun {
    pub fn passed(&self) -> bool {
        self.exit_code == testwrap_contracts::EXIT_PASS
    }
}

/// Directory-safe form of a target label: `//pkg:test` becomes `pkg_test`.
pub fn sanitize_target(target: &str) -> String {
    let s: String = target
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let s = s.trim_start_matches(['_', '.']);
    if s.is_empty() {
        "test".to_string()
    } else {
        s.to_string()
    }
}

fn prepare_output_root(
    inv: &TestInvocation,
    keep: bool,
) -> Result<(PathBuf, Option<tempfile::TempDir>)> {
    let (root, temp) = match &inv.output_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                WrapperError::io(format!("create output dir: {}", dir.display()), e)
            })?;
            (dir.clone(), None)
        }
        None => {
            let tmp = tempfile::Builder::new()
                .prefix("testwrap-")
                .disable_cleanup(keep)
                .tempdir()
                .map_err(|e| WrapperError::io("create temporary output root", e))?;
            (tmp.path().to_path_buf(), Some(tmp))
        }
    };
    let root = std::fs::canonicalize(&root)
        .map_err(|e| WrapperError::io(format!("canonicalize {}", root.display()), e))?;
    if keep && temp.is_some() {
        tracing::info!(root = %root.display(), "keeping temporary output root");
    }
    Ok((root, temp))
}

struct PreparedShard {
    shard: ShardState,
    layout: OutputLayout,
    env: EnvironmentSet,
}

pub fn run(inv: &TestInvocation, opts: &RunOptions) -> Result<WrapperRun> {
    let _span = tracing::info_span!(
        "testwrap.run",
        test_target = %inv.target,
        strategy = %opts.strategy,
        shards = inv.shard_count
    )
    .entered();

    inv.validate()?;
    opts.policy
        .validate_basic()
        .map_err(WrapperError::InvalidPolicy)?;

    let launcher = Launcher::new(opts.strategy, opts.interpreter.as_deref())?;
    let exe = launcher::resolve_executable(&inv.exe)?;
    let marshalled = launcher.marshal_arguments(&exe, &inv.combined_args());
    if let Marshalled::Interpreter(line) = &marshalled {
        tracing::debug!(command_line = %line.text, "interpreter command line");
    }

    let (output_root, temp_root) = prepare_output_root(inv, opts.keep_outputs)?;

    let manifest = RunfilesManifest::from_declared(&inv.runfiles)?;
    let runfiles_root = output_root.join(format!("{}.runfiles", sanitize_target(&inv.target)));
    let tree = runfiles::resolve(&manifest, &runfiles_root, inv.runfiles_policy)?;

    let mut prepared = Vec::new();
    for shard in shard::plan_shards(inv.shard_count, &output_root)? {
        shard.prepare()?;
        let layout = OutputLayout::for_shard(&shard);
        layout.create()?;
        let env = launcher.build_environment(&EnvInputs {
            parent: &opts.parent_env,
            policy: &opts.policy.env,
            runfiles: &tree,
            shard: &shard,
            layout: &layout,
            target: &inv.target,
            workspace: &inv.workspace,
            timeout: inv.timeout,
            fallback_user: &opts.fallback_user,
        })?;
        prepared.push(PreparedShard { shard, layout, env });
    }

    let cwd = inv.cwd.clone().unwrap_or_else(|| tree.root.clone());
    let results = run_shards(&launcher, &marshalled, &prepared, &cwd, inv, opts)?;

    let mut report = WrapperReport::new(
        &inv.target,
        launcher.strategy().as_str(),
        RunfilesReport {
            root: tree.root.display().to_string(),
            entries: tree.manifest.entries().len(),
            manifest_sha256: tree.manifest_sha256.clone(),
            manifest: tree.policy.manifest,
            directory: tree.policy.directory,
        },
    );

    let mut shards = Vec::with_capacity(prepared.len());
    let mut exit_code = testwrap_contracts::EXIT_PASS;
    for (p, result) in prepared.into_iter().zip(results) {
        outputs::write_test_log(&p.layout, &result)?;
        outputs::write_fallback_xml(&p.layout, &inv.target, &result)?;
        let wrote_manifest = outputs::write_undeclared_outputs_manifest(&p.layout)?;

        let mut sr = ShardReport::from_result(p.shard.index, p.shard.total, &result);
        sr.out_dir = p.layout.out_dir.display().to_string();
        sr.xml_file = p.layout.xml_output_file.display().to_string();
        sr.log_file = p.layout.log_file.display().to_string();
        sr.undeclared_outputs_manifest =
            wrote_manifest.then(|| p.layout.undeclared_outputs_manifest.display().to_string());
        report.shards.push(sr);

        if exit_code == testwrap_contracts::EXIT_PASS && !result.passed() {
            exit_code = result.wrapper_exit_code();
        }
        shards.push(ShardRun {
            shard: p.shard,
            layout: p.layout,
            result,
        });
    }
    report.exit_code = exit_code;

    tracing::info!(exit_code, "wrapper run finished");
    Ok(WrapperRun {
        exit_code,
        output_root,
        runfiles: tree,
        shards,
        report,
        _temp_root: temp_root,
    })
}

/// Runs every prepared shard on up to `jobs` worker threads. Results come back
/// in shard order; the first launch error (by shard index) wins.
fn run_shards(
    launcher: &Launcher,
    marshalled: &Marshalled,
    prepared: &[PreparedShard],
    cwd: &Path,
    inv: &TestInvocation,
    opts: &RunOptions,
) -> Result<Vec<ExecutionResult>> {
    let jobs = opts.jobs.max(1).min(prepared.len().max(1));
    let next = AtomicUsize::new(0);
    let slots: Mutex<Vec<Option<Result<ExecutionResult>>>> =
        Mutex::new((0..prepared.len()).map(|_| None).collect());

    std::thread::scope(|scope| {
        for _ in 0..jobs {
            scope.spawn(|| loop {
                let idx = next.fetch_add(1, Ordering::SeqCst);
                let Some(p) = prepared.get(idx) else {
                    break;
                };
                let _span = tracing::debug_span!("shard", index = p.shard.index).entered();
                let res = launcher.launch(
                    marshalled,
                    &p.env,
                    Some(cwd),
                    inv.timeout,
                    &opts.policy.limits,
                );
                if let Ok(mut guard) = slots.lock() {
                    guard[idx] = Some(res);
                }
            });
        }
    });

    let slots = slots
        .into_inner()
        .map_err(|_| WrapperError::io("collect shard results", std::io::ErrorKind::Other.into()))?;
    let mut out = Vec::with_capacity(slots.len());
    for (idx, slot) in slots.into_iter().enumerate() {
        match slot {
            Some(res) => out.push(res?),
            None => {
                return Err(WrapperError::io(
                    format!("shard {idx} produced no result"),
                    std::io::ErrorKind::Other.into(),
                ))
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_labels_become_directory_names() {
        assert_eq!(sanitize_target("//pkg/sub:my_test"), "pkg_sub_my_test");
        assert_eq!(sanitize_target("plain-name.sh"), "plain-name.sh");
        assert_eq!(sanitize_target("//"), "test");
        assert_eq!(sanitize_target("..//x"), "x");
    }

    #[test]
    fn temporary_root_is_removed_unless_kept() {
        let inv = TestInvocation::new("/bin/true");
        let (root, temp) = prepare_output_root(&inv, false).unwrap();
        assert!(root.is_dir());
        drop(temp);
        assert!(!root.exists());

        let (root, temp) = prepare_output_root(&inv, true).unwrap();
        drop(temp);
        assert!(root.is_dir());
        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn invalid_policy_is_rejected_before_anything_runs() {
        let inv = TestInvocation::new("/bin/true");
        let mut opts = RunOptions::new(LaunchStrategy::Native);
        opts.policy.limits.max_output_bytes = 1;
        let err = run(&inv, &opts).unwrap_err();
        assert!(matches!(err, WrapperError::InvalidPolicy(_)), "{err}");
    }
}
