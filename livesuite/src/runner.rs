//! Run lifecycle: preflight, isolation, subject start, auth, cases,
//! integrity check, summary and retention.
//!
//! Only infrastructure failures end a run early. Every early exit still
//! writes a summary, and the subject is stopped on every path out of
//! [`Runner::run`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use livesuite_common::sse::value_text;
use livesuite_common::{
    CaseResult, ErrorCategory, RetryPolicy, RunEnvironment, RunStats, RunSummary, generate_run_id,
};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::artifacts::{self, ArtifactError, CASES_DIR};
use crate::engine::{CaseContext, CaseError, Engine, EngineConfig, RequestSpec};
use crate::isolation::{self, IsolatedConfig, IsolationError};
use crate::options::{RunOptions, SubjectMode};
use crate::preflight::{PreflightError, run_preflight};
use crate::scenarios::{CaseKind, RecoveryPolicy, Suite};
use crate::summary::{self, PREFLIGHT_LOG, SERVER_LOG, SUMMARY_MD};
use crate::supervisor::{Supervisor, SupervisorConfig, SupervisorError};
use crate::transport::{HttpTransport, Transport, TransportError};

/// Case ID of the throwaway context used for the admin login bootstrap.
pub const AUTH_CASE_ID: &str = "auth_prepare";

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to create {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("failed to build http client: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Preflight(#[from] PreflightError),

    #[error(transparent)]
    Isolation(#[from] IsolationError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("testsuite failed: {failed} case(s) failed, see {}", summary_path.display())]
    CasesFailed { failed: usize, summary_path: PathBuf },
}

impl RunError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::CasesFailed { .. } => ErrorCategory::Assertion,
            _ => ErrorCategory::Infrastructure,
        }
    }
}

/// Drives one harness invocation.
pub struct Runner {
    options: RunOptions,
    run_id: String,
    run_dir: PathBuf,
    transport: Arc<dyn Transport>,
    supervisor_config: SupervisorConfig,
    recovery: RecoveryPolicy,
    cases: Vec<CaseKind>,

    started_at: DateTime<Utc>,
    base_url: String,
    config_isolated: String,
    results: Vec<CaseResult>,
    warnings: Vec<String>,
}

impl Runner {
    pub fn new(options: RunOptions) -> Result<Self, RunError> {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new()?);
        Ok(Self::with_transport(options, transport))
    }

    /// Runner over a caller-supplied transport. The engine and the
    /// supervisor's readiness probes share it.
    pub fn with_transport(options: RunOptions, transport: Arc<dyn Transport>) -> Self {
        let run_id = generate_run_id();
        let run_dir = options.output_dir.join(&run_id);
        Self {
            options,
            run_id,
            run_dir,
            transport,
            supervisor_config: SupervisorConfig::default(),
            recovery: RecoveryPolicy::default(),
            cases: CaseKind::ALL.to_vec(),
            started_at: Utc::now(),
            base_url: String::new(),
            config_isolated: String::new(),
            results: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self.run_dir = self.options.output_dir.join(&self.run_id);
        self
    }

    pub fn with_supervisor_config(mut self, config: SupervisorConfig) -> Self {
        self.supervisor_config = config;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryPolicy) -> Self {
        self.recovery = recovery;
        self
    }

    /// Restrict the run to `cases`, in the given order.
    pub fn with_cases(mut self, cases: impl IntoIterator<Item = CaseKind>) -> Self {
        self.cases = cases.into_iter().collect();
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Execute the whole lifecycle. Returns the persisted summary when
    /// every case passed.
    pub async fn run(mut self) -> Result<RunSummary, RunError> {
        self.started_at = Utc::now();
        info!(run_id = %self.run_id, run_dir = %self.run_dir.display(), "Starting live test run");

        let mut supervisor = None;
        let outcome = self.run_stages(&mut supervisor).await;
        if let Some(supervisor) = supervisor.as_mut() {
            supervisor.stop().await;
        }

        match &outcome {
            Ok(summary) => info!(passed = summary.stats.passed, "Live test run passed"),
            Err(e) => error!(category = %e.category(), error = %e, "Live test run failed"),
        }
        outcome
    }

    async fn run_stages(
        &mut self,
        supervisor: &mut Option<Supervisor>,
    ) -> Result<RunSummary, RunError> {
        let cases_dir = self.run_dir.join(CASES_DIR);
        fs::create_dir_all(&cases_dir).map_err(|source| RunError::Io {
            path: cases_dir.clone(),
            source,
        })?;

        if self.options.no_preflight {
            debug!("Preflight skipped");
        } else if let Err(e) = run_preflight(&self.options.preflight_steps, &self.run_dir.join(PREFLIGHT_LOG)).await {
            return Err(self.abort(e.into()));
        }

        let isolated = match isolation::isolate(&self.options.config_path, &self.run_dir) {
            Ok(isolated) => isolated,
            Err(e) => return Err(self.abort(e.into())),
        };
        self.config_isolated = isolated.copy_path.display().to_string();

        self.base_url = match self.options.subject.clone() {
            SubjectMode::Spawn(command) => {
                let child = supervisor.insert(Supervisor::new(
                    command,
                    Arc::clone(&self.transport),
                    self.supervisor_config.clone(),
                ));
                match child
                    .start(self.options.port, &isolated.copy_path, &self.run_dir.join(SERVER_LOG))
                    .await
                {
                    Ok(base_url) => base_url,
                    Err(e) => return Err(self.abort(e.into())),
                }
            }
            SubjectMode::Attach(base_url) => {
                info!(%base_url, "Attaching to running subject");
                base_url
            }
        };

        let engine = Engine::new(
            Arc::clone(&self.transport),
            EngineConfig::new(&self.base_url, &self.run_id)
                .with_timeout(self.options.timeout)
                .with_retry(RetryPolicy::with_retries(self.options.retries)),
        );

        let admin_jwt = match self.prepare_auth(&engine).await {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Admin login failed, admin cases will run unauthenticated");
                self.warnings.push(format!("auth prepare failed: {e}"));
                String::new()
            }
        };

        let suite = Suite::new(&self.run_id, &self.options.admin_key, admin_jwt, isolated)
            .with_burst(self.options.burst)
            .with_recovery(self.recovery);

        for kind in self.cases.clone() {
            let ctx = engine.case(kind.id());
            info!(case_id = %kind, "Running case");
            let outcome = kind.run(&suite, &ctx).await;
            self.record_case(&ctx, outcome);
            self.warnings.extend(suite.take_warnings());
        }

        let integrity = suite.isolated.verify_untouched().err();
        if let Some(e) = &integrity {
            error!(error = %e, "Original config was modified during the run");
            self.warnings.push(e.to_string());
        }

        let summary = self.build_summary();
        if let Err(e) = summary::write_summary(&self.run_dir, &summary) {
            if integrity.is_none() {
                return Err(e.into());
            }
            warn!(error = %e, "Failed to write summary, reporting the integrity failure instead");
        }

        if let Err(e) = summary::prune_old_runs(&self.options.output_dir, self.options.max_keep_runs) {
            warn!(error = %e, "Failed to prune old runs");
            self.warnings.push(format!("prune old runs: {e}"));
        }

        if let Some(e) = integrity {
            return Err(e.into());
        }
        if summary.stats.failed > 0 {
            return Err(RunError::CasesFailed {
                failed: summary.stats.failed,
                summary_path: self.run_dir.join(SUMMARY_MD),
            });
        }
        Ok(summary)
    }

    /// Best-effort summary for a run that cannot continue.
    fn abort(&mut self, err: RunError) -> RunError {
        error!(error = %err, "Run aborted before cases completed");
        let summary = self.build_summary();
        if let Err(e) = summary::write_summary(&self.run_dir, &summary) {
            warn!(error = %e, "Failed to write summary for aborted run");
        }
        err
    }

    /// Log in with the admin key and return the bearer token.
    async fn prepare_auth(&self, engine: &Arc<Engine>) -> Result<String, CaseError> {
        let ctx = engine.case(AUTH_CASE_ID);
        let resp = ctx
            .execute(&RequestSpec::post(
                "/admin/login",
                json!({"admin_key": self.options.admin_key, "expire_hours": 24}),
            ))
            .await?;
        if resp.status != 200 {
            return Err(CaseError::protocol(format!(
                "admin login status={} body={}",
                resp.status,
                resp.text()
            )));
        }
        let token = value_text(&resp.json()["token"]);
        if token.is_empty() {
            return Err(CaseError::setup("empty admin jwt token"));
        }
        debug!("Admin token acquired");
        Ok(token)
    }

    /// Turn a finished case into its verdict and persist its artifacts.
    fn record_case(&mut self, ctx: &CaseContext, outcome: Result<(), CaseError>) {
        let error = outcome.err();
        if let Some(e) = &error {
            warn!(case_id = %ctx.case_id(), category = %e.category(), error = %e, "Case ended with an error");
            ctx.assert(e.assertion_name(), false, e.to_string());
        }

        let record = ctx.finish();
        let dir = artifacts::case_dir(&self.run_dir, ctx.case_id());
        let result = CaseResult {
            case_id: record.case_id.clone(),
            passed: error.is_none() && record.all_assertions_passed(),
            duration_ms: record.duration_ms,
            trace_ids: record.trace_ids.clone(),
            status_codes: record.status_codes(),
            error: error.map(|e| e.to_string()),
            artifact_path: dir.display().to_string(),
            assertions: record.assertions.clone(),
        };

        if let Err(e) = artifacts::write_case_artifacts(&dir, &record, &result) {
            warn!(case_id = %result.case_id, error = %e, "Failed to write case artifacts");
        }
        if result.passed {
            info!(case_id = %result.case_id, duration_ms = result.duration_ms, "Case passed");
        } else {
            warn!(case_id = %result.case_id, duration_ms = result.duration_ms, "Case failed");
        }
        self.results.push(result);
    }

    fn build_summary(&self) -> RunSummary {
        let ended_at = Utc::now();
        let duration_ms = (ended_at - self.started_at).num_milliseconds().max(0) as u64;
        let config_source = std::path::absolute(&self.options.config_path)
            .unwrap_or_else(|_| self.options.config_path.clone());

        RunSummary {
            run_id: self.run_id.clone(),
            started_at: self.started_at,
            ended_at,
            duration_ms,
            stats: RunStats::from_cases(&self.results),
            environment: RunEnvironment {
                os: std::env::consts::OS.to_string(),
                arch: std::env::consts::ARCH.to_string(),
                base_url: self.base_url.clone(),
                config_source: config_source.display().to_string(),
                config_isolated: self.config_isolated.clone(),
                server_log: self.run_dir.join(SERVER_LOG).display().to_string(),
                preflight_log: self.run_dir.join(PREFLIGHT_LOG).display().to_string(),
                retries: self.options.retries,
                timeout_seconds: self.options.timeout.as_secs(),
            },
            cases: self.results.clone(),
            warnings: self.warnings.clone(),
        }
    }
}
