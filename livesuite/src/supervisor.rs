//! Subject process supervision.
//!
//! Lifecycle: `NotStarted -> Starting -> Ready -> Stopping -> Stopped`.
//! Starting is bounded by the readiness deadline, stopping by the grace
//! period followed by a forced kill. `stop` may be called from any state
//! and any number of times.

use std::fs::OpenOptions;
use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use livesuite_common::ErrorCategory;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

use crate::options::CommandSpec;
use crate::transport::{OutboundRequest, Transport};

/// Variables stripped from the inherited environment so the subject
/// cannot pick up another config source.
pub const STRIPPED_ENV: &[&str] = &[
    "PORT",
    "DS2API_CONFIG_PATH",
    "DS2API_AUTO_BUILD_WEBUI",
    "DS2API_CONFIG_JSON",
    "CONFIG_JSON",
];

/// Endpoints that must both answer 200 before the subject is ready.
pub const READINESS_PATHS: &[&str] = &["/healthz", "/readyz"];

// ── Supervisor State ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NotStarted,
    /// Child spawned, readiness not yet confirmed.
    Starting,
    Ready,
    /// Interrupt sent, waiting out the grace period.
    Stopping,
    Stopped,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

// ── Errors ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to allocate a free port: {0}")]
    PortAllocation(#[source] io::Error),

    #[error("failed to open server log {path}: {source}")]
    Log { path: PathBuf, source: io::Error },

    #[error("failed to start `{command}`: {source}")]
    Spawn { command: String, source: io::Error },

    #[error("server exited before becoming ready: {0}")]
    ExitedEarly(ExitStatus),

    #[error("server readiness timeout")]
    ReadinessTimeout(Duration),

    #[error("cannot start supervisor in state {0}")]
    WrongState(SupervisorState),
}

impl SupervisorError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Infrastructure
    }
}

// ── Configuration ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Deadline for both readiness endpoints to answer 200.
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
    /// Time allowed after the interrupt before a forced kill.
    pub stop_grace: Duration,
    /// Timeout of a single readiness probe.
    pub probe_timeout: Duration,
    /// Working directory for the child; the current one when `None`.
    pub work_dir: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(90),
            poll_interval: Duration::from_millis(500),
            stop_grace: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(5),
            work_dir: None,
        }
    }
}

/// Ask the OS for a free loopback port. The listener is released before
/// returning, so another process could still take the port.
pub fn allocate_port() -> Result<u16, SupervisorError> {
    let listener =
        TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(SupervisorError::PortAllocation)?;
    let port = listener
        .local_addr()
        .map_err(SupervisorError::PortAllocation)?
        .port();
    drop(listener);
    Ok(port)
}

/// Environment for the subject: `inherited` minus [`STRIPPED_ENV`], plus
/// the port, the isolated config path and the disabled asset build.
pub fn subject_env<I>(inherited: I, port: u16, config_path: &Path) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut env: Vec<(String, String)> = inherited
        .into_iter()
        .filter(|(key, _)| !STRIPPED_ENV.contains(&key.as_str()))
        .collect();
    env.push(("PORT".to_string(), port.to_string()));
    env.push((
        "DS2API_CONFIG_PATH".to_string(),
        config_path.display().to_string(),
    ));
    env.push(("DS2API_AUTO_BUILD_WEBUI".to_string(), "false".to_string()));
    env.push(("DS2API_CONFIG_JSON".to_string(), String::new()));
    env.push(("CONFIG_JSON".to_string(), String::new()));
    env
}

// ── Supervisor ──────────────────────────────────────────────────────────

/// Owns the subject child process for one run.
pub struct Supervisor {
    command: CommandSpec,
    transport: Arc<dyn Transport>,
    config: SupervisorConfig,
    state: SupervisorState,
    child: Option<Child>,
    base_url: Option<String>,
}

impl Supervisor {
    pub fn new(command: CommandSpec, transport: Arc<dyn Transport>, config: SupervisorConfig) -> Self {
        Self {
            command,
            transport,
            config,
            state: SupervisorState::NotStarted,
            child: None,
            base_url: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    fn transition(&mut self, next: SupervisorState) {
        debug!(from = %self.state, to = %next, "Supervisor state change");
        self.state = next;
    }

    /// Launch the subject on `port` (0 picks a free one) against
    /// `config_path`, sending its output to `log_path`, and wait until it
    /// is ready. Returns the base URL.
    pub async fn start(
        &mut self,
        port: u16,
        config_path: &Path,
        log_path: &Path,
    ) -> Result<String, SupervisorError> {
        if self.state != SupervisorState::NotStarted {
            return Err(SupervisorError::WrongState(self.state));
        }

        let port = if port == 0 { allocate_port()? } else { port };
        let base_url = format!("http://127.0.0.1:{port}");

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|source| SupervisorError::Log {
                path: log_path.to_path_buf(),
                source,
            })?;
        let log_err = log.try_clone().map_err(|source| SupervisorError::Log {
            path: log_path.to_path_buf(),
            source,
        })?;

        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .env_clear()
            .envs(subject_env(std::env::vars(), port, config_path))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);
        if let Some(dir) = &self.config.work_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            command: self.command.to_string(),
            source,
        })?;
        info!(command = %self.command, pid = child.id().unwrap_or(0), %base_url, "Subject process spawned");
        self.child = Some(child);
        self.base_url = Some(base_url.clone());
        self.transition(SupervisorState::Starting);

        self.wait_ready(&base_url).await?;
        self.transition(SupervisorState::Ready);
        info!(%base_url, "Subject is ready");
        Ok(base_url)
    }

    async fn wait_ready(&mut self, base_url: &str) -> Result<(), SupervisorError> {
        let deadline = Instant::now() + self.config.ready_timeout;
        loop {
            if let Some(child) = self.child.as_mut()
                && let Ok(Some(status)) = child.try_wait()
            {
                warn!(%status, "Subject exited during startup");
                return Err(SupervisorError::ExitedEarly(status));
            }

            if probe_ready(self.transport.as_ref(), base_url, self.config.probe_timeout).await {
                return Ok(());
            }

            if Instant::now() >= deadline {
                warn!(timeout = ?self.config.ready_timeout, "Subject did not become ready");
                return Err(SupervisorError::ReadinessTimeout(self.config.ready_timeout));
            }
            sleep(self.config.poll_interval).await;
        }
    }

    /// Interrupt the subject, wait out the grace period, then kill it.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            if self.state != SupervisorState::NotStarted {
                self.transition(SupervisorState::Stopped);
            }
            return;
        };
        self.transition(SupervisorState::Stopping);

        match child.id() {
            Some(pid) => {
                if !send_interrupt(pid) {
                    debug!(pid, "Interrupt not delivered");
                }
            }
            None => debug!("Subject already reaped"),
        }

        match timeout(self.config.stop_grace, child.wait()).await {
            Ok(Ok(status)) => info!(%status, "Subject exited"),
            Ok(Err(e)) => warn!(error = %e, "Failed to wait for subject"),
            Err(_) => {
                warn!(grace = ?self.config.stop_grace, "Subject ignored interrupt, killing");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill subject");
                }
            }
        }
        self.transition(SupervisorState::Stopped);
    }
}

/// One round of readiness probes: every path must answer 200.
async fn probe_ready(transport: &dyn Transport, base_url: &str, probe_timeout: Duration) -> bool {
    for path in READINESS_PATHS {
        let request = OutboundRequest::get(format!("{base_url}{path}"), probe_timeout);
        match transport.send(request).await {
            Ok(response) if response.status == 200 => {}
            Ok(response) => {
                debug!(path, status = response.status, "Readiness probe not ok");
                return false;
            }
            Err(e) => {
                debug!(path, error = %e, "Readiness probe failed");
                return false;
            }
        }
    }
    true
}

fn send_interrupt(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    match std::process::Command::new("kill")
        .arg("-INT")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) => status.success(),
        Err(e) => {
            debug!("Failed to send INT signal to process {}: {}", pid, e);
            false
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
