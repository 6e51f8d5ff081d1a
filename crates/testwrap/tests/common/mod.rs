#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

pub fn make_temp_dir(prefix: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    for n in 0..10_000u32 {
        let p = base.join(format!("testwrap-{prefix}-{pid}-{n}"));
        if std::fs::create_dir(&p).is_ok() {
            return std::fs::canonicalize(&p).expect("canonicalize temp dir");
        }
    }
    panic!("failed to create temp dir under {}", base.display());
}

/// Writes an executable `/bin/sh` script.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt as _;
    let p = dir.join(name);
    std::fs::write(&p, format!("#!/bin/sh\n{body}\n")).expect("write script");
    std::fs::set_permissions(&p, std::fs::Permissions::from_mode(0o755)).expect("chmod script");
    p
}

/// Runs the built `testwrap` binary with a small, predictable parent environment.
pub fn testwrap(args: &[&str], extra_env: &[(&str, &str)]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_testwrap"));
    cmd.args(args);
    cmd.env_clear();
    cmd.env("PATH", "/usr/bin:/bin");
    cmd.env("USER", "tester");
    for (k, v) in extra_env {
        cmd.env(k, v);
    }
    cmd.output().expect("spawn testwrap")
}

pub fn stdout_lines(out: &Output) -> Vec<String> {
    String::from_utf8_lossy(&out.stdout)
        .lines()
        .map(str::to_string)
        .collect()
}

pub fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

/// Value of `key=...` in lines printed by a test script.
pub fn kv<'a>(lines: &'a [String], key: &str) -> Option<&'a str> {
    let prefix = format!("{key}=");
    lines.iter().find_map(|l| l.strip_prefix(prefix.as_str()))
}
