//! Per-shard output files: scratch dir, undeclared outputs, XML and log.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use testwrap_contracts::{
    TEST_LOG_FILE_NAME, TEST_XML_FILE_NAME, UNDECLARED_OUTPUTS_DIR_NAME,
    UNDECLARED_OUTPUTS_MANIFEST_DIR_NAME, UNDECLARED_OUTPUTS_MANIFEST_FILE_NAME,
};

use crate::error::{Result, WrapperError};
use crate::launcher::{ExecutionResult, Outcome};
use crate::shard::ShardState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    pub out_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub undeclared_outputs_dir: PathBuf,
    /// Lives outside `undeclared_outputs_dir` so the test never sees it.
    pub undeclared_outputs_manifest: PathBuf,
    pub xml_output_file: PathBuf,
    pub log_file: PathBuf,
}

impl OutputLayout {
    pub fn for_shard(shard: &ShardState) -> OutputLayout {
        let out = &shard.out_dir;
        OutputLayout {
            out_dir: out.clone(),
            tmp_dir: out.join("tmp"),
            undeclared_outputs_dir: out.join(UNDECLARED_OUTPUTS_DIR_NAME),
            undeclared_outputs_manifest: out
                .join(UNDECLARED_OUTPUTS_MANIFEST_DIR_NAME)
                .join(UNDECLARED_OUTPUTS_MANIFEST_FILE_NAME),
            xml_output_file: out.join(TEST_XML_FILE_NAME),
            log_file: out.join(TEST_LOG_FILE_NAME),
        }
    }

    /// Creates the directories the test is promised, empty. Files left in
    /// `out_dir` by an earlier run are removed so they are never reported as
    /// this run's.
    pub fn create(&self) -> Result<()> {
        std::fs::create_dir_all(&self.out_dir).map_err(|e| {
            WrapperError::io(format!("create output dir: {}", self.out_dir.display()), e)
        })?;
        for file in [
            &self.xml_output_file,
            &self.undeclared_outputs_manifest,
            &self.log_file,
        ] {
            remove_file_if_exists(file)?;
        }
        for dir in [&self.tmp_dir, &self.undeclared_outputs_dir] {
            reset_dir(dir)?;
        }
        Ok(())
    }
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "removed stale output");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(WrapperError::io(
            format!("remove stale output: {}", path.display()),
            e,
        )),
    }
}

fn reset_dir(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(WrapperError::io(
                format!("clear output dir: {}", dir.display()),
                e,
            ))
        }
    }
    std::fs::create_dir_all(dir)
        .map_err(|e| WrapperError::io(format!("create output dir: {}", dir.display()), e))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndeclaredOutput {
    pub rel_path: String,
    pub size: u64,
    pub mime: &'static str,
}

fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("txt" | "log") => "text/plain",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("html" | "htm") => "text/html",
        Some("csv") => "text/csv",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("gz") => "application/gzip",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Regular files under `dir`, sorted by relative path.
pub fn collect_undeclared_outputs(dir: &Path) -> Result<Vec<UndeclaredOutput>> {
    let mut out = Vec::new();
    if !dir.is_dir() {
        return Ok(out);
    }
    for entry in walkdir::WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| {
            let source = e
                .into_io_error()
                .unwrap_or_else(|| std::io::ErrorKind::Other.into());
            WrapperError::io(format!("walk undeclared outputs: {}", dir.display()), source)
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        let rel_path = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let size = entry
            .metadata()
            .map(|m| m.len())
            .map_err(|e| {
                let source = e
                    .into_io_error()
                    .unwrap_or_else(|| std::io::ErrorKind::Other.into());
                WrapperError::io(format!("stat {}", entry.path().display()), source)
            })?;
        out.push(UndeclaredOutput {
            rel_path,
            size,
            mime: guess_mime(entry.path()),
        });
    }
    out.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(out)
}

/// Writes `<relpath>\t<size>\t<mime>` lines; returns `false` and writes nothing
/// when the test left no outputs.
pub fn write_undeclared_outputs_manifest(layout: &OutputLayout) -> Result<bool> {
    let outputs = collect_undeclared_outputs(&layout.undeclared_outputs_dir)?;
    if outputs.is_empty() {
        return Ok(false);
    }
    let mut text = String::new();
    for o in &outputs {
        let _ = writeln!(text, "{}\t{}\t{}", o.rel_path, o.size, o.mime);
    }
    let path = &layout.undeclared_outputs_manifest;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            WrapperError::io(format!("create {}", parent.display()), e)
        })?;
    }
    std::fs::write(path, text).map_err(|e| {
        WrapperError::io(format!("write undeclared outputs manifest: {}", path.display()), e)
    })?;
    tracing::debug!(files = outputs.len(), path = %path.display(), "wrote undeclared outputs manifest");
    Ok(true)
}

fn escape_attr(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c if is_xml_char(c) => out.push(c),
            _ => {}
        }
    }
    out
}

fn is_xml_char(c: char) -> bool {
    matches!(c, '\t' | '\n' | '\r') || (c >= ' ' && c != '\u{FFFE}' && c != '\u{FFFF}')
}

/// CDATA body; a literal `]]>` is split across two sections.
fn cdata(s: &str) -> String {
    let clean: String = s.chars().filter(|c| is_xml_char(*c)).collect();
    format!("<![CDATA[{}]]>", clean.replace("]]>", "]]]]><![CDATA[>"))
}

pub fn render_fallback_xml(name: &str, result: &ExecutionResult) -> String {
    let secs = format_secs(result.duration);
    let failures = u32::from(!result.passed());
    let name = escape_attr(name);

    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    let _ = writeln!(
        xml,
        "<testsuites>\n<testsuite name=\"{name}\" tests=\"1\" failures=\"0\" errors=\"{failures}\">"
    );
    let _ = writeln!(
        xml,
        "<testcase name=\"{name}\" status=\"run\" duration=\"{secs}\" time=\"{secs}\">"
    );
    match result.outcome {
        Outcome::Passed => {}
        Outcome::Failed { exit_code } => {
            let _ = writeln!(xml, "<error message=\"exited with error code {exit_code}\"></error>");
        }
        Outcome::Signaled { signal } => {
            let _ = writeln!(xml, "<error message=\"terminated by signal {signal}\"></error>");
        }
        Outcome::TimedOut => {
            xml.push_str("<error message=\"timed out\"></error>\n");
        }
    }
    xml.push_str("</testcase>\n<system-out>");
    let mut captured = result.stdout_lines.join("\n");
    if !result.stderr_lines.is_empty() {
        if !captured.is_empty() {
            captured.push('\n');
        }
        captured.push_str(&result.stderr_lines.join("\n"));
    }
    if !captured.is_empty() {
        xml.push_str(&cdata(&captured));
    }
    xml.push_str("</system-out>\n</testsuite>\n</testsuites>\n");
    xml
}

fn format_secs(d: Duration) -> String {
    format!("{}.{:03}", d.as_secs(), d.subsec_millis())
}

/// Writes the fallback XML unless the test produced its own. Returns whether a
/// file was written.
pub fn write_fallback_xml(layout: &OutputLayout, name: &str, result: &ExecutionResult) -> Result<bool> {
    let path = &layout.xml_output_file;
    if path.exists() {
        return Ok(false);
    }
    std::fs::write(path, render_fallback_xml(name, result))
        .map_err(|e| WrapperError::io(format!("write test xml: {}", path.display()), e))?;
    Ok(true)
}

pub fn write_test_log(layout: &OutputLayout, result: &ExecutionResult) -> Result<()> {
    let mut text = String::new();
    for line in result.stdout_lines.iter().chain(result.stderr_lines.iter()) {
        text.push_str(line);
        text.push('\n');
    }
    std::fs::write(&layout.log_file, text).map_err(|e| {
        WrapperError::io(format!("write test log: {}", layout.log_file.display()), e)
    })
}
