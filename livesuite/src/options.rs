//! Run options: what the calling process hands to the runner.

use std::path::PathBuf;
use std::time::Duration;

use livesuite_common::config::{EnvError, EnvParser};

pub const DEFAULT_CONFIG_PATH: &str = "config.json";
pub const DEFAULT_OUTPUT_DIR: &str = "artifacts/testsuite";
pub const DEFAULT_ADMIN_KEY: &str = "admin";
/// Environment variable the subject service reads its admin key from.
pub const ADMIN_KEY_ENV: &str = "DS2API_ADMIN_KEY";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_RETRIES: u32 = 2;
pub const DEFAULT_KEEP_RUNS: i64 = 5;
pub const DEFAULT_SUBJECT_COMMAND: &str = "go run ./cmd/ds2api";

/// A program plus arguments, executed without a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Split a command line on whitespace. `None` for a blank line.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Checks run before the subject is started.
pub fn default_preflight_steps() -> Vec<CommandSpec> {
    vec![
        CommandSpec::new("go", ["test", "./...", "-count=1"]),
        CommandSpec::new("node", ["--check", "api/chat-stream.js"]),
        CommandSpec::new("node", ["--check", "api/helpers/stream-tool-sieve.js"]),
        CommandSpec::new(
            "node",
            [
                "--test",
                "api/helpers/stream-tool-sieve.test.js",
                "api/chat-stream.test.js",
                "api/compat/js_compat_test.js",
            ],
        ),
        CommandSpec::new("npm", ["run", "build", "--prefix", "webui"]),
    ]
}

/// How the runner obtains a subject to test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectMode {
    /// Launch the subject as a child process against the isolated config.
    Spawn(CommandSpec),
    /// Drive an already running subject at this base URL. Nothing is
    /// launched or stopped; config isolation still guards the original.
    Attach(String),
}

/// Sizing of the over-capacity burst in the threshold scenario.
///
/// The subject advertises `total` accounts, `max_inflight_per_account`
/// and `max_queue_size`; capacity is `total*inflight + queue`, or
/// `total*inflight` when that sum is not positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BurstPolicy {
    /// Requests sent beyond the advertised capacity.
    pub headroom: usize,
    /// Lower bound for the burst size.
    pub minimum: usize,
}

impl Default for BurstPolicy {
    fn default() -> Self {
        Self {
            headroom: 8,
            minimum: 8,
        }
    }
}

impl BurstPolicy {
    /// Advertised capacity, or `None` when the subject did not report a
    /// usable account/in-flight limit.
    pub fn capacity(total: i64, max_inflight: i64, max_queue: i64) -> Option<i64> {
        if total <= 0 || max_inflight <= 0 {
            return None;
        }
        let direct = total.saturating_mul(max_inflight);
        let with_queue = direct.saturating_add(max_queue);
        Some(if with_queue > 0 { with_queue } else { direct })
    }

    /// Number of concurrent requests to fire for a given capacity.
    pub fn burst_size(&self, capacity: i64) -> usize {
        let capacity = usize::try_from(capacity.max(0)).unwrap_or(usize::MAX);
        capacity.saturating_add(self.headroom).max(self.minimum)
    }
}

/// Everything the runner needs for one invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub config_path: PathBuf,
    pub admin_key: String,
    pub output_dir: PathBuf,
    /// 0 selects a free port.
    pub port: u16,
    /// Per-request timeout.
    pub timeout: Duration,
    pub retries: u32,
    pub no_preflight: bool,
    /// Run directories to keep; 0 or negative disables pruning.
    pub max_keep_runs: i64,
    pub subject: SubjectMode,
    pub preflight_steps: Vec<CommandSpec>,
    pub burst: BurstPolicy,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
            admin_key: DEFAULT_ADMIN_KEY.to_string(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            port: 0,
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
            no_preflight: false,
            max_keep_runs: DEFAULT_KEEP_RUNS,
            subject: SubjectMode::Spawn(
                CommandSpec::parse(DEFAULT_SUBJECT_COMMAND)
                    .unwrap_or_else(|| CommandSpec::new("go", ["run", "./cmd/ds2api"])),
            ),
            preflight_steps: default_preflight_steps(),
            burst: BurstPolicy::default(),
        }
    }
}

impl RunOptions {
    /// Defaults overlaid with `LIVESUITE_*` variables and the subject's
    /// admin key variable. Every invalid value is reported.
    pub fn from_env() -> Result<Self, Vec<EnvError>> {
        let defaults = Self::default();
        let mut parser = EnvParser::new();

        let config_path = parser.get_path("CONFIG", DEFAULT_CONFIG_PATH).into_value();
        let output_dir = parser.get_path("OUT", DEFAULT_OUTPUT_DIR).into_value();
        let port = parser.get_u32_range("PORT", 0, 0, u16::MAX as u32).into_value();
        let timeout_secs = parser
            .get_i64_range("TIMEOUT_SECS", DEFAULT_TIMEOUT.as_secs() as i64, i64::MIN, i64::MAX)
            .into_value();
        let retries = parser
            .get_i64_range("RETRIES", DEFAULT_RETRIES as i64, i64::MIN, i64::MAX)
            .into_value();
        let no_preflight = parser.get_bool("NO_PREFLIGHT", false).into_value();
        let max_keep_runs = parser
            .get_i64_range("KEEP_RUNS", DEFAULT_KEEP_RUNS, i64::MIN, i64::MAX)
            .into_value();
        let subject = parser
            .get_optional_string("SUBJECT_CMD")
            .into_value()
            .and_then(|line| CommandSpec::parse(&line))
            .map(SubjectMode::Spawn)
            .unwrap_or(defaults.subject);
        let admin_key = parser
            .get_foreign_string(ADMIN_KEY_ENV)
            .into_value()
            .unwrap_or_else(|| DEFAULT_ADMIN_KEY.to_string());

        let errors = parser.take_errors();
        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(Self {
            config_path,
            admin_key,
            output_dir,
            port: u16::try_from(port).unwrap_or(0),
            timeout: normalize_timeout_secs(timeout_secs),
            retries: normalize_retries(retries),
            no_preflight,
            max_keep_runs,
            subject,
            preflight_steps: defaults.preflight_steps,
            burst: defaults.burst,
        })
    }
}

/// Non-positive timeouts fall back to the default.
pub fn normalize_timeout_secs(secs: i64) -> Duration {
    if secs <= 0 {
        DEFAULT_TIMEOUT
    } else {
        Duration::from_secs(secs as u64)
    }
}

/// Negative retry counts mean no retries.
pub fn normalize_retries(retries: i64) -> u32 {
    u32::try_from(retries.max(0)).unwrap_or(u32::MAX)
}

/// Blank admin keys fall back to the subject's default.
pub fn normalize_admin_key(key: &str) -> String {
    let key = key.trim();
    if key.is_empty() {
        DEFAULT_ADMIN_KEY.to_string()
    } else {
        key.to_string()
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn set_env(key: &str, value: &str) {
        // SAFETY: serialized with #[serial]
        unsafe { std::env::set_var(key, value) };
    }

    fn remove_env(key: &str) {
        // SAFETY: serialized with #[serial]
        unsafe { std::env::remove_var(key) };
    }

    const VARS: &[&str] = &[
        "LIVESUITE_CONFIG",
        "LIVESUITE_OUT",
        "LIVESUITE_PORT",
        "LIVESUITE_TIMEOUT_SECS",
        "LIVESUITE_RETRIES",
        "LIVESUITE_NO_PREFLIGHT",
        "LIVESUITE_KEEP_RUNS",
        "LIVESUITE_SUBJECT_CMD",
        ADMIN_KEY_ENV,
    ];

    fn clear() {
        for var in VARS {
            remove_env(var);
        }
    }

    #[test]
    fn test_defaults() {
        let opts = RunOptions::default();
        assert_eq!(opts.config_path, PathBuf::from("config.json"));
        assert_eq!(opts.output_dir, PathBuf::from("artifacts/testsuite"));
        assert_eq!(opts.timeout, Duration::from_secs(120));
        assert_eq!(opts.retries, 2);
        assert_eq!(opts.max_keep_runs, 5);
        assert_eq!(opts.admin_key, "admin");
        assert_eq!(
            opts.subject,
            SubjectMode::Spawn(CommandSpec::new("go", ["run", "./cmd/ds2api"]))
        );
        assert_eq!(opts.preflight_steps.len(), 5);
    }

    #[test]
    #[serial]
    fn test_from_env_overlay_and_normalization() {
        clear();
        set_env("LIVESUITE_TIMEOUT_SECS", "-5");
        set_env("LIVESUITE_RETRIES", "-1");
        set_env("LIVESUITE_PORT", "8081");
        set_env("LIVESUITE_NO_PREFLIGHT", "yes");
        set_env("LIVESUITE_SUBJECT_CMD", "./target/debug/gateway --quiet");
        set_env(ADMIN_KEY_ENV, "  s3cret ");

        let opts = RunOptions::from_env().unwrap();
        assert_eq!(opts.timeout, DEFAULT_TIMEOUT);
        assert_eq!(opts.retries, 0);
        assert_eq!(opts.port, 8081);
        assert!(opts.no_preflight);
        assert_eq!(opts.admin_key, "s3cret");
        assert_eq!(
            opts.subject,
            SubjectMode::Spawn(CommandSpec::new("./target/debug/gateway", ["--quiet"]))
        );
        clear();
    }

    #[test]
    #[serial]
    fn test_from_env_reports_all_errors() {
        clear();
        set_env("LIVESUITE_PORT", "99999");
        set_env("LIVESUITE_RETRIES", "many");
        let errors = RunOptions::from_env().unwrap_err();
        assert_eq!(errors.len(), 2);
        clear();
    }

    #[test]
    fn test_normalizers() {
        assert_eq!(normalize_timeout_secs(0), DEFAULT_TIMEOUT);
        assert_eq!(normalize_timeout_secs(7), Duration::from_secs(7));
        assert_eq!(normalize_retries(-3), 0);
        assert_eq!(normalize_retries(4), 4);
        assert_eq!(normalize_admin_key("   "), "admin");
        assert_eq!(normalize_admin_key(" k "), "k");
    }

    #[test]
    fn test_command_spec_parse_and_display() {
        let cmd = CommandSpec::parse("  npm run build   --prefix webui ").unwrap();
        assert_eq!(cmd.program, "npm");
        assert_eq!(cmd.args, vec!["run", "build", "--prefix", "webui"]);
        assert_eq!(cmd.to_string(), "npm run build --prefix webui");
        assert!(CommandSpec::parse("   ").is_none());
    }

    // -------------------------------------------------------------------------
    // BurstPolicy tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_capacity_includes_queue() {
        assert_eq!(BurstPolicy::capacity(2, 2, 4), Some(8));
    }

    #[test]
    fn test_capacity_falls_back_without_queue() {
        assert_eq!(BurstPolicy::capacity(3, 2, -10), Some(6));
    }

    #[test]
    fn test_capacity_unknown_when_limits_missing() {
        assert_eq!(BurstPolicy::capacity(0, 2, 4), None);
        assert_eq!(BurstPolicy::capacity(2, 0, 4), None);
    }

    #[test]
    fn test_burst_size_headroom_and_floor() {
        let policy = BurstPolicy::default();
        assert_eq!(policy.burst_size(8), 16);
        assert_eq!(policy.burst_size(-4), 8);

        let policy = BurstPolicy {
            headroom: 2,
            minimum: 10,
        };
        assert_eq!(policy.burst_size(3), 10);
        assert_eq!(policy.burst_size(20), 22);
    }
}
