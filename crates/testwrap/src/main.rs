use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use testwrap::policy::Policy;
use testwrap::{DeclaredRunfile, RunOptions, RunfilesPolicy, TestInvocation, WrapperError};
use testwrap_contracts::EXIT_SETUP_FAILURE;
use testwrap_runner_common::{resolve_launch_strategy, LaunchStrategy};
use tracing_subscriber::EnvFilter;

const ENV_LOG: &str = "TESTWRAP_LOG";

#[derive(Parser)]
#[command(name = "testwrap")]
#[command(about = "Runs one test target in an isolated, reproducible environment.", long_about = None)]
struct Cli {
    /// Invocation descriptor (JSON). Mutually exclusive with --exe.
    #[arg(long, conflicts_with = "exe")]
    invocation: Option<PathBuf>,

    #[arg(long)]
    exe: Option<PathBuf>,

    /// Static argument; repeatable, order preserved.
    #[arg(long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,

    /// Extra argument appended after the static ones; repeatable.
    #[arg(long = "test-arg", allow_hyphen_values = true)]
    test_args: Vec<String>,

    /// Data dependency as `<logical>=<real>`; repeatable.
    #[arg(long = "data", value_parser = parse_data)]
    data: Vec<DeclaredRunfile>,

    #[arg(long)]
    shard_count: Option<u32>,

    #[arg(long)]
    timeout_secs: Option<u64>,

    #[arg(long)]
    cwd: Option<PathBuf>,

    #[arg(long)]
    target: Option<String>,

    #[arg(long)]
    workspace: Option<String>,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long, value_enum)]
    strategy: Option<LaunchStrategy>,

    /// Shell used by the interpreter strategy.
    #[arg(long)]
    interpreter: Option<PathBuf>,

    #[arg(long, overrides_with = "no_runfiles_manifest")]
    runfiles_manifest: bool,

    #[arg(long, overrides_with = "runfiles_manifest")]
    no_runfiles_manifest: bool,

    #[arg(long)]
    runfiles_directory: bool,

    #[arg(long)]
    policy: Option<PathBuf>,

    #[arg(long, default_value_t = 1)]
    jobs: usize,

    #[arg(long)]
    keep_outputs: bool,

    /// Write the JSON report here.
    #[arg(long)]
    report: Option<PathBuf>,
}

fn parse_data(raw: &str) -> std::result::Result<DeclaredRunfile, String> {
    let (logical, real) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected <logical>=<real>, got {raw:?}"))?;
    if logical.is_empty() || real.is_empty() {
        return Err(format!("expected <logical>=<real>, got {raw:?}"));
    }
    Ok(DeclaredRunfile {
        logical: logical.to_string(),
        real: PathBuf::from(real),
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> ExitCode {
    init_tracing();
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{}", error_line(&err));
            let code = err
                .downcast_ref::<WrapperError>()
                .map(WrapperError::exit_code)
                .unwrap_or(EXIT_SETUP_FAILURE);
            ExitCode::from(code)
        }
    }
}

fn error_line(err: &anyhow::Error) -> String {
    match err.downcast_ref::<WrapperError>() {
        Some(e) => format!("testwrap: [{}] {err:#}", e.kind()),
        None => format!("testwrap: {err:#}"),
    }
}

fn invocation_from_cli(cli: &Cli) -> Result<TestInvocation> {
    let mut inv = match (&cli.invocation, &cli.exe) {
        (Some(path), _) => TestInvocation::load(path)?,
        (None, Some(exe)) => {
            let mut inv = TestInvocation::new(exe.clone());
            inv.args = cli.args.clone();
            inv.runfiles = cli.data.clone();
            inv.runfiles_policy = RunfilesPolicy {
                manifest: !cli.no_runfiles_manifest,
                directory: cli.runfiles_directory,
            };
            inv
        }
        (None, None) => anyhow::bail!("set one of --invocation or --exe"),
    };

    inv.test_args.extend(cli.test_args.iter().cloned());
    if let Some(n) = cli.shard_count {
        inv.shard_count = n;
    }
    if let Some(secs) = cli.timeout_secs {
        inv.timeout = Duration::from_secs(secs);
    }
    if let Some(cwd) = &cli.cwd {
        inv.cwd = Some(cwd.clone());
    }
    if let Some(t) = &cli.target {
        inv.target = t.clone();
    }
    if let Some(w) = &cli.workspace {
        inv.workspace = w.clone();
    }
    if let Some(d) = &cli.output_dir {
        inv.output_dir = Some(d.clone());
    }
    if cli.invocation.is_some() {
        if cli.runfiles_manifest || cli.no_runfiles_manifest {
            inv.runfiles_policy.manifest = cli.runfiles_manifest;
        }
        if cli.runfiles_directory {
            inv.runfiles_policy.directory = true;
        }
    }
    inv.validate()?;
    Ok(inv)
}

fn relay_output(run: &testwrap::WrapperRun) -> Result<()> {
    let stdout = std::io::stdout();
    let stderr = std::io::stderr();
    let mut out = stdout.lock();
    let mut err = stderr.lock();
    for s in &run.shards {
        for line in &s.result.stdout_lines {
            writeln!(out, "{line}").context("relay test stdout")?;
        }
        for line in &s.result.stderr_lines {
            writeln!(err, "{line}").context("relay test stderr")?;
        }
    }
    out.flush().context("flush stdout")?;
    Ok(())
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let inv = invocation_from_cli(&cli)?;
    let strategy = resolve_launch_strategy(cli.strategy, inv.strategy)?;
    let policy = match &cli.policy {
        Some(path) => Policy::load(path)?,
        None => Policy::default(),
    };

    let mut opts = RunOptions::new(strategy);
    opts.interpreter = cli.interpreter.clone();
    opts.policy = policy;
    opts.jobs = cli.jobs;
    opts.keep_outputs = cli.keep_outputs;
    opts.parent_env = testwrap::env::parent_env_snapshot();

    let run = testwrap::run(&inv, &opts)?;
    relay_output(&run)?;

    if let Some(path) = &cli.report {
        run.report
            .write(path)
            .with_context(|| format!("write report: {}", path.display()))?;
    }
    if cli.keep_outputs {
        eprintln!("testwrap: outputs kept in {}", run.output_root.display());
    }

    Ok(ExitCode::from(run.exit_code))
}
