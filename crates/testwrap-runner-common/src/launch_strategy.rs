use std::fmt;
use std::str::FromStr;

use anyhow::Context;

pub const ENV_LAUNCH_STRATEGY: &str = "TESTWRAP_LAUNCH_STRATEGY";

/// How the test executable is started.
///
/// `Native` hands the argument vector to the OS unchanged. `Interpreter` builds a
/// command-line text and runs it through a shell-like interpreter, which
/// re-tokenizes it with its own quoting rules. The two are allowed to disagree
/// about what the child observes as its arguments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LaunchStrategy {
    #[default]
    Native,
    Interpreter,
}

impl LaunchStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            LaunchStrategy::Native => "native",
            LaunchStrategy::Interpreter => "interpreter",
        }
    }
}

impl fmt::Display for LaunchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct LaunchStrategyParseError {
    value: String,
}

impl fmt::Display for LaunchStrategyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid launch strategy {:?} (expected one of: native, interpreter)",
            self.value
        )
    }
}

impl std::error::Error for LaunchStrategyParseError {}

impl FromStr for LaunchStrategy {
    type Err = LaunchStrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.to_ascii_lowercase();
        match s.as_str() {
            "native" | "exe" => Ok(LaunchStrategy::Native),
            "interpreter" | "script" | "shell" => Ok(LaunchStrategy::Interpreter),
            _ => Err(LaunchStrategyParseError { value: s }),
        }
    }
}

#[cfg(feature = "clap")]
impl clap::ValueEnum for LaunchStrategy {
    fn value_variants<'a>() -> &'a [Self] {
        const ALL: [LaunchStrategy; 2] = [LaunchStrategy::Native, LaunchStrategy::Interpreter];
        &ALL
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        match self {
            LaunchStrategy::Native => {
                Some(clap::builder::PossibleValue::new("native").alias("exe"))
            }
            LaunchStrategy::Interpreter => Some(
                clap::builder::PossibleValue::new("interpreter")
                    .alias("script")
                    .alias("shell"),
            ),
        }
    }
}

fn read_launch_strategy_env() -> anyhow::Result<Option<LaunchStrategy>> {
    let Ok(raw) = std::env::var(ENV_LAUNCH_STRATEGY) else {
        return Ok(None);
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let strategy = LaunchStrategy::from_str(&raw)
        .with_context(|| format!("invalid environment variable {ENV_LAUNCH_STRATEGY}={raw:?}"))?;
    Ok(Some(strategy))
}

/// Precedence: command line, then environment, then the invocation file, then `native`.
pub fn resolve_launch_strategy_with_env(
    cli_strategy: Option<LaunchStrategy>,
    env_strategy: Option<LaunchStrategy>,
    invocation_strategy: Option<LaunchStrategy>,
) -> LaunchStrategy {
    let resolved = cli_strategy
        .or(env_strategy)
        .or(invocation_strategy)
        .unwrap_or_default();
    tracing::debug!(
        cli = ?cli_strategy,
        env = ?env_strategy,
        invocation = ?invocation_strategy,
        resolved = %resolved,
        "resolved launch strategy"
    );
    resolved
}

pub fn resolve_launch_strategy(
    cli_strategy: Option<LaunchStrategy>,
    invocation_strategy: Option<LaunchStrategy>,
) -> anyhow::Result<LaunchStrategy> {
    let env_strategy = read_launch_strategy_env()?;
    Ok(resolve_launch_strategy_with_env(
        cli_strategy,
        env_strategy,
        invocation_strategy,
    ))
}
