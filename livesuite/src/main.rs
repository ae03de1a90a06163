//! livesuite - live end-to-end harness for the gateway.
//!
//! Isolates the gateway config, starts the gateway, runs the case
//! catalogue and writes artifacts under `<out>/<run_id>/`.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Result, anyhow};
use clap::Parser;
use livesuite::options::{
    BurstPolicy, CommandSpec, RunOptions, SubjectMode, normalize_admin_key, normalize_retries,
    normalize_timeout_secs,
};
use livesuite::runner::Runner;
use livesuite_common::{LogConfig, init_logging};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "livesuite")]
#[command(author, version, about = "Live end-to-end test harness for the API gateway")]
struct Cli {
    /// Gateway config file; never modified, a copy is handed to the gateway
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Admin key for the login bootstrap
    #[arg(long, value_name = "KEY")]
    admin_key: Option<String>,

    /// Directory holding one subdirectory per run
    #[arg(long, value_name = "DIR")]
    out: Option<PathBuf>,

    /// Port for the gateway (0 picks a free one)
    #[arg(long)]
    port: Option<u16>,

    /// Per-request timeout in seconds (non-positive uses the default)
    #[arg(long, value_name = "SECS", allow_negative_numbers = true)]
    timeout: Option<i64>,

    /// Retries for retryable requests (negative means none)
    #[arg(long, allow_negative_numbers = true)]
    retries: Option<i64>,

    /// Skip the preflight steps
    #[arg(long)]
    no_preflight: bool,

    /// Run directories to keep (0 disables pruning)
    #[arg(long, value_name = "N", allow_negative_numbers = true)]
    keep: Option<i64>,

    /// Command that starts the gateway
    #[arg(long, value_name = "CMD", conflicts_with = "attach")]
    subject_cmd: Option<String>,

    /// Test a gateway that is already running at this base URL
    #[arg(long, value_name = "URL")]
    attach: Option<String>,

    /// Preflight step; repeat to replace the default list
    #[arg(long = "preflight", value_name = "CMD")]
    preflight: Vec<String>,

    /// Requests sent beyond the advertised queue capacity
    #[arg(long)]
    burst_headroom: Option<usize>,

    /// Minimum size of the over-capacity burst
    #[arg(long)]
    burst_min: Option<usize>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Also write JSON logs to this file
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

impl Cli {
    /// Overlay explicit flags on top of environment-derived options.
    fn apply(self, mut options: RunOptions) -> Result<RunOptions> {
        if let Some(config) = self.config {
            options.config_path = config;
        }
        if let Some(key) = self.admin_key {
            options.admin_key = normalize_admin_key(&key);
        }
        if let Some(out) = self.out {
            options.output_dir = out;
        }
        if let Some(port) = self.port {
            options.port = port;
        }
        if let Some(secs) = self.timeout {
            options.timeout = normalize_timeout_secs(secs);
        }
        if let Some(retries) = self.retries {
            options.retries = normalize_retries(retries);
        }
        options.no_preflight |= self.no_preflight;
        if let Some(keep) = self.keep {
            options.max_keep_runs = keep;
        }
        if let Some(line) = self.subject_cmd {
            let command = CommandSpec::parse(&line)
                .ok_or_else(|| anyhow!("--subject-cmd must not be empty"))?;
            options.subject = SubjectMode::Spawn(command);
        }
        if let Some(url) = self.attach {
            options.subject = SubjectMode::Attach(url.trim_end_matches('/').to_string());
        }
        if !self.preflight.is_empty() {
            options.preflight_steps = self
                .preflight
                .iter()
                .map(|line| {
                    CommandSpec::parse(line).ok_or_else(|| anyhow!("--preflight must not be empty"))
                })
                .collect::<Result<_>>()?;
        }
        let defaults = BurstPolicy::default();
        options.burst = BurstPolicy {
            headroom: self.burst_headroom.unwrap_or(defaults.headroom),
            minimum: self.burst_min.unwrap_or(defaults.minimum),
        };
        Ok(options)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env("info").with_stderr();
    if cli.verbose {
        log_config = log_config.with_level("debug");
    }
    if let Some(path) = &cli.log_file {
        log_config = log_config.with_file(path);
    }
    let _guards = match init_logging(&log_config) {
        Ok(guards) => guards,
        Err(e) => {
            eprintln!("failed to initialize logging: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli).await {
        Ok(()) => {
            println!("testsuite completed successfully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let env_options = RunOptions::from_env().map_err(|errors| {
        let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
        anyhow!("invalid environment: {}", joined.join("; "))
    })?;
    let options = cli.apply(env_options)?;
    debug!(
        config = %options.config_path.display(),
        out = %options.output_dir.display(),
        retries = options.retries,
        timeout_secs = options.timeout.as_secs(),
        no_preflight = options.no_preflight,
        "Resolved run options"
    );

    let runner = Runner::new(options)?;
    info!(run_dir = %runner.run_dir().display(), "Run directory");
    runner.run().await?;
    Ok(())
}
