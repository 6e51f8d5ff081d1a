//! Argument marshalling for the two launch strategies.
//!
//! The native path hands the argument vector to the OS as-is. The interpreter
//! path joins the arguments into command-line text for `sh -c`, and the shell's
//! own word splitting and quote removal decide what the test finally sees: an
//! argument with a space becomes two, an empty argument disappears, and quote or
//! backslash characters are consumed. That divergence is a pinned behavior of the
//! interpreter launcher and is not compensated for here.

use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};

/// Argument vector for the native launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeArgv {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl NativeArgv {
    pub fn os_args(&self) -> Vec<&OsStr> {
        self.args.iter().map(OsStr::new).collect()
    }
}

/// Command-line text for the interpreter launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub text: String,
}

pub fn marshal_native(program: &Path, args: &[String]) -> NativeArgv {
    NativeArgv {
        program: program.to_path_buf(),
        args: args.to_vec(),
    }
}

/// `exec <program> <arg> <arg> ...`. Only the program path is quoted; the
/// arguments are joined with single spaces exactly as given.
pub fn marshal_interpreter(program: &Path, args: &[String]) -> CommandLine {
    let mut text = String::from("exec ");
    text.push_str(&posix_single_quote(&program.to_string_lossy()));
    for a in args {
        text.push(' ');
        text.push_str(a);
    }
    CommandLine { text }
}

fn posix_single_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenizeError {
    Unterminated(char),
    /// A character whose meaning depends on shell state (expansions, operators).
    Unsupported(char),
}

impl fmt::Display for TokenizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenizeError::Unterminated(q) => write!(f, "unterminated {q} quote"),
            TokenizeError::Unsupported(c) => {
                write!(f, "{c:?} is interpreted by the shell and cannot be predicted")
            }
        }
    }
}

impl std::error::Error for TokenizeError {}

const UNQUOTED_UNSUPPORTED: &[char] = &[
    '$', '`', ';', '&', '|', '<', '>', '(', ')', '*', '?', '[',
];

/// Word splitting and quote removal as a POSIX shell performs them on
/// `sh -c` text with no expansions in play.
pub fn interpreter_tokenize(text: &str) -> Result<Vec<String>, TokenizeError> {
    let mut words = Vec::new();
    let mut cur = String::new();
    let mut in_word = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' => {
                if in_word {
                    words.push(std::mem::take(&mut cur));
                    in_word = false;
                }
            }
            // An unquoted newline ends the command; whatever follows is another one.
            '\n' => {
                if chars.clone().all(|c| matches!(c, ' ' | '\t' | '\n')) {
                    break;
                }
                return Err(TokenizeError::Unsupported('\n'));
            }
            '#' if !in_word => {
                while chars.next_if(|c| *c != '\n').is_some() {}
            }
            '~' if !in_word => return Err(TokenizeError::Unsupported('~')),
            '\\' => match chars.next() {
                Some('\n') => {}
                Some(next) => {
                    cur.push(next);
                    in_word = true;
                }
                None => {
                    cur.push('\\');
                    in_word = true;
                }
            },
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => cur.push(c),
                        None => return Err(TokenizeError::Unterminated('\'')),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.peek().copied() {
                            Some(n @ ('$' | '`' | '"' | '\\')) => {
                                chars.next();
                                cur.push(n);
                            }
                            Some('\n') => {
                                chars.next();
                            }
                            _ => cur.push('\\'),
                        },
                        Some(c @ ('$' | '`')) => return Err(TokenizeError::Unsupported(c)),
                        Some(c) => cur.push(c),
                        None => return Err(TokenizeError::Unterminated('"')),
                    }
                }
            }
            c if UNQUOTED_UNSUPPORTED.contains(&c) => {
                return Err(TokenizeError::Unsupported(c));
            }
            c => {
                cur.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(cur);
    }
    Ok(words)
}

/// The arguments (after the program) a test observes under the interpreter launcher.
pub fn interpreter_observed_args(
    program: &Path,
    args: &[String],
) -> Result<Vec<String>, TokenizeError> {
    let line = marshal_interpreter(program, args);
    let mut words = interpreter_tokenize(&line.text)?;
    // "exec" and the program path.
    Ok(words.split_off(2.min(words.len())))
}
