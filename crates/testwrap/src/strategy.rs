//! The two launch strategies behind one value.
//!
//! `Native` execs the test binary with its argument vector. `Interpreter` hands a
//! command line to `<sh> -c`. Both share environment construction and process
//! control; only argument marshalling and the spawned program differ.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use testwrap_runner_common::os_paths::default_interpreter;
use testwrap_runner_common::LaunchStrategy;

use crate::args::{self, CommandLine, NativeArgv, TokenizeError};
use crate::env::{self, EnvInputs, EnvironmentSet};
use crate::error::{Result, WrapperError};
use crate::launcher::{self, ExecutionResult, LaunchSpec};
use crate::policy::Limits;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marshalled {
    Native(NativeArgv),
    Interpreter(CommandLine),
}

impl Marshalled {
    /// The arguments (without the program) the child will observe.
    pub fn expected_child_args(&self) -> Result<Vec<String>, TokenizeError> {
        match self {
            Marshalled::Native(argv) => Ok(argv.args.clone()),
            Marshalled::Interpreter(line) => {
                let mut words = args::interpreter_tokenize(&line.text)?;
                Ok(words.split_off(2.min(words.len())))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Launcher {
    strategy: LaunchStrategy,
    interpreter: Option<PathBuf>,
}

impl Launcher {
    /// Locates the interpreter up front so a missing shell is a launch error
    /// before any shard starts.
    pub fn new(strategy: LaunchStrategy, interpreter: Option<&Path>) -> Result<Launcher> {
        let interpreter = match strategy {
            LaunchStrategy::Native => None,
            LaunchStrategy::Interpreter => {
                let p = default_interpreter(interpreter).map_err(|e| WrapperError::LaunchError {
                    program: interpreter.map(Path::to_path_buf).unwrap_or_else(|| "sh".into()),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, format!("{e:#}")),
                })?;
                tracing::debug!(interpreter = %p.display(), "using interpreter launcher");
                Some(p)
            }
        };
        Ok(Launcher {
            strategy,
            interpreter,
        })
    }

    pub fn strategy(&self) -> LaunchStrategy {
        self.strategy
    }

    pub fn interpreter(&self) -> Option<&Path> {
        self.interpreter.as_deref()
    }

    pub fn marshal_arguments(&self, exe: &Path, args: &[String]) -> Marshalled {
        match self.strategy {
            LaunchStrategy::Native => Marshalled::Native(args::marshal_native(exe, args)),
            LaunchStrategy::Interpreter => {
                Marshalled::Interpreter(args::marshal_interpreter(exe, args))
            }
        }
    }

    pub fn build_environment(&self, inputs: &EnvInputs<'_>) -> Result<EnvironmentSet> {
        env::build_environment(inputs)
    }

    pub fn launch(
        &self,
        marshalled: &Marshalled,
        env: &EnvironmentSet,
        cwd: Option<&Path>,
        timeout: Duration,
        limits: &Limits,
    ) -> Result<ExecutionResult> {
        let (program, argv): (&Path, Vec<&OsStr>) = match marshalled {
            Marshalled::Native(argv) => (argv.program.as_path(), argv.os_args()),
            Marshalled::Interpreter(line) => {
                let sh = self.interpreter.as_deref().ok_or_else(|| WrapperError::LaunchError {
                    program: PathBuf::from("sh"),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "launcher was built without an interpreter",
                    ),
                })?;
                (sh, vec![OsStr::new("-c"), OsStr::new(line.text.as_str())])
            }
        };
        launcher::launch(&LaunchSpec {
            program,
            args: argv,
            env,
            cwd,
            timeout,
            kill_grace: Duration::from_millis(limits.kill_grace_ms),
            max_output_bytes: limits.max_output_bytes,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt as _;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    /// A test binary that prints each argument between brackets, one per line.
    fn arg_printer(dir: &Path) -> PathBuf {
        let p = dir.join("print_args.sh");
        std::fs::write(
            &p,
            "#!/bin/sh\nfor a in \"$@\"; do printf '[%s]\\n' \"$a\"; done\n",
        )
        .unwrap();
        std::fs::set_permissions(&p, std::fs::Permissions::from_mode(0o755)).unwrap();
        p
    }

    fn run(strategy: LaunchStrategy, args: &[String]) -> (Marshalled, ExecutionResult) {
        let tmp = tempfile::tempdir().unwrap();
        let exe = arg_printer(tmp.path());
        let launcher = Launcher::new(strategy, None).unwrap();
        let m = launcher.marshal_arguments(&exe, args);
        let env: EnvironmentSet = [("PATH".to_string(), "/usr/bin:/bin".to_string())]
            .into_iter()
            .collect();
        let res = launcher
            .launch(&m, &env, None, Duration::from_secs(30), &Limits::default())
            .unwrap();
        (m, res)
    }

    fn observed(res: &ExecutionResult) -> Vec<String> {
        res.stdout_lines
            .iter()
            .map(|l| l.trim_start_matches('[').trim_end_matches(']').to_string())
            .collect()
    }

    #[test]
    fn native_child_sees_arguments_verbatim() {
        let args = strings(&["foo", "a b", "", "bar", "baz", "\"x y\"", "\"\"", "qux"]);
        let (m, res) = run(LaunchStrategy::Native, &args);
        assert!(res.passed(), "{:?}", res.stderr_lines);
        assert_eq!(observed(&res), args);
        assert_eq!(m.expected_child_args().unwrap(), args);
    }

    #[test]
    fn interpreter_child_matches_the_tokenizer_model() {
        let args = strings(&["foo", "a b", "", "bar", "baz", "\"x y\"", "\"\"", "qux"]);
        let (m, res) = run(LaunchStrategy::Interpreter, &args);
        assert!(res.passed(), "{:?}", res.stderr_lines);
        let seen = observed(&res);
        assert_eq!(
            seen,
            strings(&["foo", "a", "b", "bar", "baz", "x y", "", "qux"])
        );
        assert_eq!(m.expected_child_args().unwrap(), seen);
    }

    #[test]
    fn interpreter_model_agrees_with_sh_on_escapes() {
        let args = strings(&["'single quoted'", "back\\ slash", "\"d\\\\q\"", "#tail"]);
        let (m, res) = run(LaunchStrategy::Interpreter, &args);
        assert!(res.passed(), "{:?}", res.stderr_lines);
        assert_eq!(m.expected_child_args().unwrap(), observed(&res));

        // sh execs at the end of the first line, so "b" and "c" never reach the test.
        let args = strings(&["a\nb", "c"]);
        let (m, res) = run(LaunchStrategy::Interpreter, &args);
        assert!(res.passed(), "{:?}", res.stderr_lines);
        assert_eq!(observed(&res), strings(&["a"]));
        assert_eq!(
            m.expected_child_args(),
            Err(TokenizeError::Unsupported('\n'))
        );
    }

    #[test]
    fn native_launcher_has_no_interpreter() {
        let l = Launcher::new(LaunchStrategy::Native, None).unwrap();
        assert!(l.interpreter().is_none());
        let l = Launcher::new(LaunchStrategy::Interpreter, None).unwrap();
        assert!(l.interpreter().is_some());
    }
}
