//! Runfiles: the data dependencies a test declares, exposed through a manifest
//! file and, when the policy asks for it, a symlink tree.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use testwrap_contracts::{
    ENV_RUNFILES_DIR, ENV_RUNFILES_MANIFEST_FILE, ENV_RUNFILES_MANIFEST_ONLY,
    RUNFILES_MANIFEST_FILE_NAME,
};

use crate::error::{Result, WrapperError};
use crate::invocation::DeclaredRunfile;

fn default_true() -> bool {
    true
}

/// Which materializations are produced. Both bits may be set at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RunfilesPolicy {
    #[serde(default = "default_true")]
    pub manifest: bool,
    #[serde(default)]
    pub directory: bool,
}

impl Default for RunfilesPolicy {
    fn default() -> Self {
        RunfilesPolicy {
            manifest: true,
            directory: false,
        }
    }
}

impl RunfilesPolicy {
    pub fn manifest_only(self) -> bool {
        self.manifest && !self.directory
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub logical: String,
    pub real: PathBuf,
}

/// Declared runfiles in declaration order; logical paths are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunfilesManifest {
    entries: Vec<ManifestEntry>,
}

fn validate_logical_path(logical: &str) -> Result<(), String> {
    if logical.is_empty() {
        return Err("logical path must be non-empty".to_string());
    }
    if logical.contains(' ') || logical.contains('\n') || logical.contains('\r') {
        return Err("logical path must not contain spaces or newlines".to_string());
    }
    if logical == RUNFILES_MANIFEST_FILE_NAME {
        return Err(format!("{RUNFILES_MANIFEST_FILE_NAME} is reserved"));
    }
    let p = Path::new(logical);
    if p.is_absolute() || logical.starts_with('/') || logical.starts_with('\\') {
        return Err("logical path must be relative".to_string());
    }
    for c in p.components() {
        match c {
            Component::Normal(_) => {}
            _ => return Err("logical path must not contain '.', '..' or a root".to_string()),
        }
    }
    Ok(())
}

impl RunfilesManifest {
    pub fn from_declared(declared: &[DeclaredRunfile]) -> Result<RunfilesManifest> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut entries = Vec::with_capacity(declared.len());
        for d in declared {
            validate_logical_path(&d.logical).map_err(|reason| WrapperError::InvalidRunfile {
                logical: d.logical.clone(),
                reason,
            })?;
            if !seen.insert(d.logical.as_str()) {
                return Err(WrapperError::InvalidRunfile {
                    logical: d.logical.clone(),
                    reason: "declared more than once".to_string(),
                });
            }
            entries.push(ManifestEntry {
                logical: d.logical.clone(),
                real: d.real.clone(),
            });
        }
        Ok(RunfilesManifest { entries })
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// `<logical> <real>\n` per entry. Real paths are written unescaped.
    pub fn render(&self) -> Result<String> {
        let mut out = String::new();
        for e in &self.entries {
            let real = e.real.to_str().ok_or_else(|| WrapperError::InvalidRunfile {
                logical: e.logical.clone(),
                reason: format!("real path is not valid UTF-8: {}", e.real.display()),
            })?;
            if real.contains('\n') || real.contains('\r') {
                return Err(WrapperError::InvalidRunfile {
                    logical: e.logical.clone(),
                    reason: "real path must not contain newlines".to_string(),
                });
            }
            out.push_str(&e.logical);
            out.push(' ');
            out.push_str(real);
            out.push('\n');
        }
        Ok(out)
    }

    /// Reads manifest text the way consumers do: split each line on the first space.
    pub fn parse(text: &str) -> Vec<(String, String)> {
        text.lines()
            .filter(|l| !l.is_empty())
            .map(|l| match l.split_once(' ') {
                Some((logical, real)) => (logical.to_string(), real.to_string()),
                None => (l.to_string(), String::new()),
            })
            .collect()
    }

    /// Checks every real path exists and rewrites it as an absolute canonical path.
    pub fn resolve_real_paths(&self) -> Result<RunfilesManifest> {
        let mut entries = Vec::with_capacity(self.entries.len());
        for e in &self.entries {
            let real = std::fs::canonicalize(&e.real).map_err(|_| {
                WrapperError::MissingDependency {
                    logical: e.logical.clone(),
                    real: e.real.clone(),
                }
            })?;
            entries.push(ManifestEntry {
                logical: e.logical.clone(),
                real,
            });
        }
        Ok(RunfilesManifest { entries })
    }
}

/// A materialized runfiles root, shared read-only by every shard.
#[derive(Debug, Clone)]
pub struct RunfilesTree {
    pub root: PathBuf,
    pub manifest_file: PathBuf,
    pub policy: RunfilesPolicy,
    pub manifest: RunfilesManifest,
    pub manifest_sha256: String,
}

impl RunfilesTree {
    /// Variables this tree contributes to the child's environment.
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![(ENV_RUNFILES_DIR, self.root.display().to_string())];
        if self.policy.manifest {
            out.push((
                ENV_RUNFILES_MANIFEST_FILE,
                self.manifest_file.display().to_string(),
            ));
        }
        if self.policy.manifest_only() {
            out.push((ENV_RUNFILES_MANIFEST_ONLY, "1".to_string()));
        }
        out
    }
}

/// Builds the runfiles root. The manifest file is always written so the root is
/// self-describing; the symlink tree is only built under the directory policy.
pub fn resolve(
    manifest: &RunfilesManifest,
    root: &Path,
    policy: RunfilesPolicy,
) -> Result<RunfilesTree> {
    let _span = tracing::debug_span!(
        "runfiles.resolve",
        root = %root.display(),
        entries = manifest.entries().len(),
        manifest = policy.manifest,
        directory = policy.directory
    )
    .entered();

    let resolved = manifest.resolve_real_paths()?;

    std::fs::create_dir_all(root).map_err(|e| {
        WrapperError::io(format!("create runfiles root: {}", root.display()), e)
    })?;
    let root = std::fs::canonicalize(root).map_err(|e| {
        WrapperError::io(format!("canonicalize runfiles root: {}", root.display()), e)
    })?;

    let text = resolved.render()?;
    let manifest_file = root.join(RUNFILES_MANIFEST_FILE_NAME);
    std::fs::write(&manifest_file, text.as_bytes()).map_err(|e| {
        WrapperError::io(
            format!("write runfiles manifest: {}", manifest_file.display()),
            e,
        )
    })?;

    if policy.directory {
        for e in resolved.entries() {
            link_runfile(&root, e)?;
        }
    } else {
        tracing::debug!("manifest-only policy, no runfiles tree built");
    }

    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let manifest_sha256 = hex_lower(&hasher.finalize());

    Ok(RunfilesTree {
        root,
        manifest_file,
        policy,
        manifest: resolved,
        manifest_sha256,
    })
}

fn link_runfile(root: &Path, entry: &ManifestEntry) -> Result<()> {
    let dst = root.join(&entry.logical);
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            WrapperError::io(format!("create runfiles dir: {}", parent.display()), e)
        })?;
    }
    if dst.symlink_metadata().is_ok() {
        std::fs::remove_file(&dst).map_err(|e| {
            WrapperError::io(format!("replace runfile link: {}", dst.display()), e)
        })?;
    }
    symlink_or_copy(&entry.real, &dst).map_err(|e| {
        WrapperError::io(
            format!(
                "link runfile {} -> {}",
                dst.display(),
                entry.real.display()
            ),
            e,
        )
    })
}

#[cfg(unix)]
fn symlink_or_copy(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(src, dst)
}

#[cfg(windows)]
fn symlink_or_copy(src: &Path, dst: &Path) -> std::io::Result<()> {
    let linked = if src.is_dir() {
        std::os::windows::fs::symlink_dir(src, dst)
    } else {
        std::os::windows::fs::symlink_file(src, dst)
    };
    match linked {
        Ok(()) => Ok(()),
        Err(_) if src.is_file() => std::fs::copy(src, dst).map(|_| ()),
        Err(e) => Err(e),
    }
}

#[cfg(not(any(unix, windows)))]
fn symlink_or_copy(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::copy(src, dst).map(|_| ())
}

pub(crate) fn hex_lower(bytes: &[u8]) -> String {
    const LUT: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(LUT[(b >> 4) as usize] as char);
        out.push(LUT[(b & 0x0F) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declared(pairs: &[(&str, &Path)]) -> Vec<DeclaredRunfile> {
        pairs
            .iter()
            .map(|(l, r)| DeclaredRunfile {
                logical: l.to_string(),
                real: r.to_path_buf(),
            })
            .collect()
    }

    #[test]
    fn rejects_unsafe_or_duplicate_logical_paths() {
        let real = Path::new("/tmp");
        for bad in ["", "/abs", "a/../b", "./a", "has space", "MANIFEST", "a\nb"] {
            let err = RunfilesManifest::from_declared(&declared(&[(bad, real)])).unwrap_err();
            assert!(
                matches!(err, WrapperError::InvalidRunfile { .. }),
                "{bad:?}: {err}"
            );
        }
        let err = RunfilesManifest::from_declared(&declared(&[("a", real), ("a", real)]))
            .unwrap_err();
        assert!(err.to_string().contains("more than once"), "{err}");
    }

    #[test]
    fn render_preserves_declaration_order_and_spaces_in_real_paths() {
        let m = RunfilesManifest::from_declared(&declared(&[
            ("ws/z.txt", Path::new("/data/z.txt")),
            ("ws/a.txt", Path::new("/data dir/a.txt")),
        ]))
        .unwrap();
        let text = m.render().unwrap();
        assert_eq!(text, "ws/z.txt /data/z.txt\nws/a.txt /data dir/a.txt\n");
        let parsed = RunfilesManifest::parse(&text);
        assert_eq!(parsed[1].0, "ws/a.txt");
        assert_eq!(parsed[1].1, "/data dir/a.txt");
    }

    #[test]
    fn missing_real_path_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let m = RunfilesManifest::from_declared(&declared(&[(
            "ws/gone.txt",
            &tmp.path().join("gone.txt"),
        )]))
        .unwrap();
        let err = resolve(&m, &tmp.path().join("rf"), RunfilesPolicy::default()).unwrap_err();
        match err {
            WrapperError::MissingDependency { logical, .. } => assert_eq!(logical, "ws/gone.txt"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!tmp.path().join("rf").exists());
    }

    #[test]
    fn manifest_only_policy_writes_manifest_without_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("passing.sh");
        std::fs::write(&data, "exit 0\n").unwrap();
        let m = RunfilesManifest::from_declared(&declared(&[("ws/foo/passing.sh", &data)]))
            .unwrap();
        let tree = resolve(&m, &tmp.path().join("t.runfiles"), RunfilesPolicy::default()).unwrap();

        assert!(tree.manifest_file.is_file());
        assert!(tree.root.is_absolute());
        assert!(!tree.root.join("ws/foo/passing.sh").exists());
        let text = std::fs::read_to_string(&tree.manifest_file).unwrap();
        let parsed = RunfilesManifest::parse(&text);
        assert!(parsed[0].0.ends_with("foo/passing.sh"));
        assert!(Path::new(&parsed[0].1).is_absolute());
        assert_eq!(tree.manifest_sha256.len(), 64);

        let vars = tree.env_vars();
        assert!(vars.contains(&(ENV_RUNFILES_MANIFEST_ONLY, "1".to_string())));
        assert!(vars.iter().any(|(k, _)| *k == ENV_RUNFILES_DIR));
        assert!(vars.iter().any(|(k, _)| *k == ENV_RUNFILES_MANIFEST_FILE));
    }

    #[cfg(unix)]
    #[test]
    fn directory_policy_builds_symlink_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data.txt");
        std::fs::write(&data, "hello").unwrap();
        let m = RunfilesManifest::from_declared(&declared(&[("ws/nested/data.txt", &data)]))
            .unwrap();
        let policy = RunfilesPolicy {
            manifest: false,
            directory: true,
        };
        let tree = resolve(&m, &tmp.path().join("t.runfiles"), policy).unwrap();
        let linked = tree.root.join("ws/nested/data.txt");
        assert_eq!(std::fs::read_to_string(linked).unwrap(), "hello");

        let vars = tree.env_vars();
        assert!(!vars.iter().any(|(k, _)| *k == ENV_RUNFILES_MANIFEST_ONLY));
        assert!(!vars.iter().any(|(k, _)| *k == ENV_RUNFILES_MANIFEST_FILE));
        assert!(tree.manifest_file.is_file());
    }

    #[test]
    fn digest_is_stable_for_identical_manifests() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("d");
        std::fs::write(&data, "x").unwrap();
        let m = RunfilesManifest::from_declared(&declared(&[("ws/d", &data)])).unwrap();
        let a = resolve(&m, &tmp.path().join("a"), RunfilesPolicy::default()).unwrap();
        let b = resolve(&m, &tmp.path().join("b"), RunfilesPolicy::default()).unwrap();
        assert_eq!(a.manifest_sha256, b.manifest_sha256);
    }
}
