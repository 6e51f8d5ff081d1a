use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use anyhow::Result;

pub const ENV_INTERPRETER: &str = "TESTWRAP_INTERPRETER";

#[cfg(unix)]
const WELL_KNOWN_INTERPRETERS: &[&str] = &["/bin/sh", "/usr/bin/sh"];
#[cfg(not(unix))]
const WELL_KNOWN_INTERPRETERS: &[&str] = &[];

#[cfg(unix)]
const PATH_INTERPRETER_NAMES: &[&str] = &["sh"];
#[cfg(not(unix))]
const PATH_INTERPRETER_NAMES: &[&str] = &["sh.exe", "bash.exe"];

/// Locates the shell used by the interpreter-mediated launcher.
pub fn default_interpreter(explicit: Option<&Path>) -> Result<PathBuf> {
    let env_value = std::env::var_os(ENV_INTERPRETER);
    let path_value = std::env::var_os("PATH");
    default_interpreter_from(explicit, env_value.as_deref(), path_value.as_deref())
}

pub fn default_interpreter_from(
    explicit: Option<&Path>,
    env_value: Option<&OsStr>,
    path_value: Option<&OsStr>,
) -> Result<PathBuf> {
    let mut checked: Vec<PathBuf> = Vec::new();

    if let Some(p) = explicit {
        if p.is_file() {
            return Ok(p.to_path_buf());
        }
        anyhow::bail!("interpreter does not exist: {}", p.display());
    }

    if let Some(raw) = env_value.filter(|v| !v.is_empty()) {
        let p = PathBuf::from(raw);
        checked.push(p.clone());
        if p.is_file() {
            return Ok(p);
        }
    }

    for cand in WELL_KNOWN_INTERPRETERS {
        let p = PathBuf::from(cand);
        checked.push(p.clone());
        if p.is_file() {
            return Ok(p);
        }
    }

    if let Some(path_value) = path_value {
        for dir in std::env::split_paths(path_value) {
            for name in PATH_INTERPRETER_NAMES {
                let cand = dir.join(name);
                checked.push(cand.clone());
                if cand.is_file() {
                    return Ok(cand);
                }
            }
        }
    }

    let checked = checked
        .into_iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "could not locate a shell interpreter for the interpreter launch strategy\n\nlooked for:\n{checked}\n\nfix:\n  - pass --interpreter <path>, or\n  - set {ENV_INTERPRETER}=<path>, or\n  - use --strategy=native"
    );
}
