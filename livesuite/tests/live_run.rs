//! Whole runs against the loopback fake gateway, in both subject modes.

mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{ADMIN_TOKEN, FakeGateway, gateway_config, init_test_logging};
use livesuite::isolation::content_hash;
use livesuite::supervisor::{Supervisor, SupervisorConfig, SupervisorError, SupervisorState};
use livesuite::{
    CaseKind, CommandSpec, HttpTransport, RunError, RunOptions, Runner, SubjectMode, Transport,
};
use serde_json::Value;
use tempfile::TempDir;

fn fast_supervisor() -> SupervisorConfig {
    SupervisorConfig {
        ready_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(25),
        stop_grace: Duration::from_secs(1),
        probe_timeout: Duration::from_millis(500),
        work_dir: None,
    }
}

fn options(dir: &Path, subject: SubjectMode) -> RunOptions {
    let config = dir.join("config.json");
    fs::write(&config, gateway_config()).unwrap();
    RunOptions {
        config_path: config,
        output_dir: dir.join("out"),
        no_preflight: true,
        retries: 0,
        timeout: Duration::from_secs(5),
        max_keep_runs: 0,
        subject,
        ..RunOptions::default()
    }
}

fn http() -> Arc<dyn Transport> {
    Arc::new(HttpTransport::new().unwrap())
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

const PASSING_CASES: [CaseKind; 7] = [
    CaseKind::HealthzOk,
    CaseKind::ReadyzOk,
    CaseKind::ModelsOpenai,
    CaseKind::AdminLoginVerify,
    CaseKind::ChatNonstreamBasic,
    CaseKind::ChatStreamBasic,
    CaseKind::ErrorContractMissingMessages,
];

#[tokio::test]
async fn test_attached_run_passes_and_leaves_artifacts() {
    init_test_logging();
    let gateway = FakeGateway::start().await;
    let tmp = TempDir::new().unwrap();
    let opts = options(tmp.path(), SubjectMode::Attach(gateway.base_url()));
    let original = fs::read(&opts.config_path).unwrap();

    let runner = Runner::with_transport(opts, http()).with_cases(PASSING_CASES);
    let run_dir = runner.run_dir().to_path_buf();
    let summary = runner.run().await.unwrap();

    assert_eq!(summary.stats.total, PASSING_CASES.len());
    assert_eq!(summary.stats.failed, 0);
    assert!(summary.warnings.is_empty(), "{:?}", summary.warnings);
    assert_eq!(summary.environment.base_url, gateway.base_url());

    let on_disk = read_json(&run_dir.join("summary.json"));
    assert_eq!(on_disk["stats"]["passed"], PASSING_CASES.len());
    assert!(fs::read_to_string(run_dir.join("summary.md")).unwrap().contains("chat_stream_basic"));

    let stream_dir = run_dir.join("cases/chat_stream_basic");
    for file in ["request.json", "response.headers", "response.body", "stream.raw", "assertions.json", "meta.json"] {
        assert!(stream_dir.join(file).is_file(), "missing {file}");
    }
    assert!(fs::read_to_string(stream_dir.join("stream.raw")).unwrap().contains("data: [DONE]"));

    // Admin token from the login bootstrap reaches the verify call.
    let verify = gateway.seen_path("/admin/verify");
    assert_eq!(
        verify[0].authorization.as_deref(),
        Some(format!("Bearer {ADMIN_TOKEN}").as_str())
    );
    assert_eq!(fs::read(tmp.path().join("config.json")).unwrap(), original);
    assert_eq!(
        content_hash(&fs::read(run_dir.join("tmp/config.json")).unwrap()),
        content_hash(&original)
    );
}

#[tokio::test]
async fn test_attached_run_reports_failing_cases() {
    init_test_logging();
    let gateway = FakeGateway::start().await;
    let tmp = TempDir::new().unwrap();
    let opts = options(tmp.path(), SubjectMode::Attach(gateway.base_url()));

    // The fake has no anthropic route, so that case fails with a 404.
    let runner = Runner::with_transport(opts, http())
        .with_cases([CaseKind::HealthzOk, CaseKind::AnthropicCountTokens]);
    let run_dir = runner.run_dir().to_path_buf();

    match runner.run().await.unwrap_err() {
        RunError::CasesFailed { failed, summary_path } => {
            assert_eq!(failed, 1);
            assert_eq!(summary_path, run_dir.join("summary.md"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let meta = read_json(&run_dir.join("cases/anthropic_count_tokens/meta.json"));
    assert_eq!(meta["status"], "failed");
    let md = fs::read_to_string(run_dir.join("summary.md")).unwrap();
    assert!(md.contains("anthropic_count_tokens"));
}

#[tokio::test]
async fn test_supervised_child_gets_isolated_env_and_is_stopped() {
    init_test_logging();
    let gateway = FakeGateway::start().await;
    let tmp = TempDir::new().unwrap();
    let log = tmp.path().join("server.log");
    let config = tmp.path().join("isolated.json");

    let mut supervisor = Supervisor::new(
        CommandSpec::new(
            "sh",
            ["-c", "echo \"port=$PORT config=$DS2API_CONFIG_PATH webui=$DS2API_AUTO_BUILD_WEBUI\"; exec sleep 30"],
        ),
        http(),
        fast_supervisor(),
    );

    // Readiness is answered by the fake listening on the same port.
    let base_url = supervisor.start(gateway.port(), &config, &log).await.unwrap();
    assert_eq!(base_url, gateway.base_url());
    assert_eq!(supervisor.state(), SupervisorState::Ready);
    assert!(!gateway.seen_path("/healthz").is_empty());
    assert!(!gateway.seen_path("/readyz").is_empty());
    // Readiness probes carry no trace.
    assert!(gateway.seen_path("/healthz")[0].query.is_none());

    // The child may still be running its echo when readiness is answered.
    for _ in 0..100 {
        if fs::read_to_string(&log).is_ok_and(|text| text.contains("webui=")) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    supervisor.stop().await;
    assert_eq!(supervisor.state(), SupervisorState::Stopped);

    let output = fs::read_to_string(&log).unwrap();
    assert!(output.contains(&format!("port={}", gateway.port())));
    assert!(output.contains(&format!("config={}", config.display())));
    assert!(output.contains("webui=false"));
}

#[tokio::test]
async fn test_supervisor_times_out_when_nothing_answers() {
    init_test_logging();
    let tmp = TempDir::new().unwrap();
    let mut config = fast_supervisor();
    config.ready_timeout = Duration::from_millis(300);

    let mut supervisor = Supervisor::new(
        CommandSpec::new("sleep", ["30"]),
        http(),
        config,
    );
    let err = supervisor
        .start(0, &tmp.path().join("config.json"), &tmp.path().join("server.log"))
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::ReadinessTimeout(_)));
    supervisor.stop().await;
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
}

#[tokio::test]
async fn test_spawned_run_stops_child_after_cases() {
    init_test_logging();
    let gateway = FakeGateway::start().await;
    let tmp = TempDir::new().unwrap();
    let mut opts = options(
        tmp.path(),
        SubjectMode::Spawn(CommandSpec::new("sleep", ["30"])),
    );
    opts.port = gateway.port();

    let runner = Runner::with_transport(opts, http())
        .with_supervisor_config(fast_supervisor())
        .with_cases([CaseKind::HealthzOk, CaseKind::ReadyzOk]);
    let run_dir = runner.run_dir().to_path_buf();

    let summary = runner.run().await.unwrap();
    assert_eq!(summary.stats.passed, 2);
    assert!(run_dir.join("server.log").is_file());
    assert_eq!(summary.environment.server_log, run_dir.join("server.log").display().to_string());
}
