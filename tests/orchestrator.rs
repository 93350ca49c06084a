//! 编排器端到端场景
//!
//! 后端与校验器均为脚本化替身；服务与搜索引擎由同一个 axum mock server 扮演。

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use xjp_tokenizer_deploy::config::{
    PathsConfig, RecoveryConfig, SearchEngineConfig, ServiceConfig, TimeoutConfig,
};
use xjp_tokenizer_deploy::domain::{
    CategoryResult, CheckResult, DeployMethod, DeploymentProgress, ErrorCategory, OpReport,
    OverallStatus, Phase, StepName, StepStatus, ValidationReport,
};
use xjp_tokenizer_deploy::infra::CommandRunner;
use xjp_tokenizer_deploy::services::{DeploymentBackend, Orchestrator, ValidationCollaborator};
use xjp_tokenizer_deploy::{DeployError, DeploymentConfig};

type Script = Box<dyn Fn() -> Result<OpReport, DeployError> + Send + Sync>;

/// 按操作名返回预设结果并记录调用顺序
#[derive(Default)]
struct ScriptedBackend {
    scripts: HashMap<&'static str, Script>,
    calls: Mutex<Vec<&'static str>>,
}

impl ScriptedBackend {
    fn on(mut self, op: &'static str, script: Script) -> Self {
        self.scripts.insert(op, script);
        self
    }

    fn answer(&self, op: &'static str) -> Result<OpReport, DeployError> {
        self.calls.lock().unwrap().push(op);
        match self.scripts.get(op) {
            Some(script) => script(),
            None => Ok(OpReport::ok()),
        }
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeploymentBackend for ScriptedBackend {
    fn method(&self) -> DeployMethod {
        DeployMethod::Docker
    }
    async fn validate_requirements(&self) -> Result<OpReport, DeployError> {
        self.answer("validate_requirements")
    }
    async fn install_dependencies(&self) -> Result<OpReport, DeployError> {
        self.answer("install_dependencies")
    }
    async fn configure_service(&self, _: &DeploymentConfig) -> Result<OpReport, DeployError> {
        self.answer("configure_service")
    }
    async fn start_service(&self) -> Result<OpReport, DeployError> {
        self.answer("start_service")
    }
    async fn verify_deployment(&self) -> Result<OpReport, DeployError> {
        self.answer("verify_deployment")
    }
    async fn stop_service(&self) -> Result<OpReport, DeployError> {
        self.answer("stop_service")
    }
    async fn cleanup(&self) -> Result<OpReport, DeployError> {
        self.answer("cleanup")
    }
}

/// 返回固定报告的校验器
struct StubValidator(ValidationReport);

#[async_trait]
impl ValidationCollaborator for StubValidator {
    async fn run_comprehensive_validation(&self, _: &DeploymentConfig) -> ValidationReport {
        self.0.clone()
    }
}

fn passing_validator() -> Arc<StubValidator> {
    Arc::new(StubValidator(ValidationReport::from_categories(vec![
        CategoryResult {
            category: "system".into(),
            checks: vec![CheckResult::passed("system", "memory", "plenty")],
        },
    ])))
}

/// mock tokenizer + 搜索引擎
async fn spawn_mock_server() -> u16 {
    let app = Router::new()
        .route(
            "/",
            get(|| async { Json(json!({ "name": "mock-search", "version": { "number": "8.11.0" } })) }),
        )
        .route(
            "/health",
            get(|| async { Json(json!({ "status": "healthy", "model": "mock-tokenizer" })) }),
        )
        .route(
            "/tokenize",
            post(|Json(body): Json<Value>| async move {
                let text = body["text"].as_str().unwrap_or_default().to_string();
                let tokens: Vec<&str> = text.split_whitespace().collect();
                Json(json!({ "tokens": tokens, "count": tokens.len() }))
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

fn test_config(root: &Path, port: u16) -> DeploymentConfig {
    test_config_for(root, port, DeployMethod::Docker)
}

fn test_config_for(root: &Path, port: u16, method: DeployMethod) -> DeploymentConfig {
    let mut service = ServiceConfig::default();
    service.host = "127.0.0.1".into();
    service.port = port;

    let mut engine = SearchEngineConfig::default();
    engine.host = "127.0.0.1".into();
    engine.port = port;

    DeploymentConfig::builder()
        .method(method)
        .service(service)
        .search_engine(engine)
        .paths(PathsConfig::under(root))
        .timeouts(TimeoutConfig {
            health_timeout_secs: 2,
            health_interval_ms: 50,
            probe_timeout_secs: 2,
            command_timeout_secs: 10,
        })
        .recovery(RecoveryConfig {
            connection_backoff_ms: 10,
            service_backoff_ms: 10,
            deployment_backoff_ms: 10,
        })
        .build()
        .unwrap()
}

fn orchestrator(
    config: DeploymentConfig,
    backend: Arc<ScriptedBackend>,
    validator: Arc<dyn ValidationCollaborator>,
) -> Orchestrator {
    Orchestrator::builder(config)
        .backend(backend)
        .validator(validator)
        .build()
}

#[tokio::test]
async fn happy_path_completes_all_phases() {
    let port = spawn_mock_server().await;
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::default());
    let orch = orchestrator(test_config(dir.path(), port), backend.clone(), passing_validator());

    let result = orch.deploy(Some("happy-1".into())).await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.deployment_id, "happy-1");
    assert_eq!(result.progress.percentage, 100.0);
    assert_eq!(result.progress.status, OverallStatus::Completed);
    assert_eq!(
        result.endpoints.get("liveness"),
        Some(&format!("http://127.0.0.1:{}/health", port))
    );
    assert_eq!(
        result.endpoints.get("functional"),
        Some(&format!("http://127.0.0.1:{}/tokenize", port))
    );
    assert_eq!(
        result.service_info.as_ref().and_then(|v| v["model"].as_str()),
        Some("mock-tokenizer")
    );

    let summary = result.summary_path.clone().unwrap();
    assert_eq!(summary, dir.path().join("log").join("deployment-happy-1.json"));
    let written: Value = serde_json::from_slice(&std::fs::read(&summary).unwrap()).unwrap();
    assert_eq!(written["phases_completed"].as_array().unwrap().len(), 6);

    let status = orch.get_deployment_status().await.unwrap();
    assert_eq!(status.current_phase, Phase::Completed);
    assert_eq!(status.phases_completed, Phase::SEQUENCE.to_vec());
    assert_eq!(status.errors_count, 0);
    assert!(status.metadata.contains_key("functional_result"));

    assert_eq!(
        backend.calls(),
        vec![
            "validate_requirements",
            "install_dependencies",
            "configure_service",
            "start_service",
            "verify_deployment",
        ]
    );
    let finished: Vec<_> = result
        .progress
        .steps
        .iter()
        .map(|s| s.finished_at.unwrap())
        .collect();
    assert!(finished.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn validation_failure_aborts_before_backend_runs() {
    let port = spawn_mock_server().await;
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::default());
    let validator = Arc::new(StubValidator(ValidationReport::from_categories(vec![
        CategoryResult {
            category: "paths".into(),
            checks: vec![
                CheckResult::failed("paths", "data_dir", "not writable"),
                CheckResult::failed("paths", "log_dir", "not writable"),
            ],
        },
    ])));
    let orch = orchestrator(test_config(dir.path(), port), backend.clone(), validator);

    let result = orch.deploy(None).await;

    assert!(!result.success);
    let error = result.error.unwrap();
    assert!(error.contains("paths/data_dir"));
    assert!(error.contains("paths/log_dir"));

    let status = orch.get_deployment_status().await.unwrap();
    assert_eq!(status.last_active_phase(), Some(Phase::Validation));
    // 只有四个目录，没有服务资源
    assert_eq!(status.resources_allocated, 4);
    assert!(!backend.calls().contains(&"start_service"));
    assert!(result
        .progress
        .steps
        .iter()
        .all(|s| s.status == StepStatus::NotStarted));
}

#[tokio::test]
async fn connection_fault_is_recovered_but_attempt_fails() {
    let port = spawn_mock_server().await;
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::default().on(
        "start_service",
        Box::new(|| Err(DeployError::other("connection timeout while contacting runtime"))),
    ));
    let orch = orchestrator(test_config(dir.path(), port), backend.clone(), passing_validator());

    let result = orch.deploy(None).await;

    assert!(!result.success);
    assert!(result.recovered);

    let status = orch.get_deployment_status().await.unwrap();
    assert_eq!(status.error_history.len(), 1);
    assert_eq!(status.error_history[0].phase, Phase::Execution);
    assert_eq!(status.error_history[0].category, ErrorCategory::ConnectionTimeout);
    assert!(status.cleanup_executed.is_empty());
    assert_eq!(
        result.progress.step(StepName::StartService).unwrap().status,
        StepStatus::Failed
    );
}

#[tokio::test]
async fn deployment_failure_runs_cleanup_in_reverse_once() {
    let port = spawn_mock_server().await;
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::default().on(
        "verify_deployment",
        Box::new(|| Err(DeployError::other("deployment failed: X"))),
    ));
    let orch = orchestrator(test_config(dir.path(), port), backend.clone(), passing_validator());

    let result = orch.deploy(None).await;

    assert!(!result.success);
    assert!(!result.recovered);
    assert!(!result.rollback_available);

    let status = orch.get_deployment_status().await.unwrap();
    assert_eq!(status.error_history[0].category, ErrorCategory::DeploymentFailed);
    assert_eq!(status.error_history[0].phase, Phase::Verification);
    // 注册顺序为 manager:rollback → service stop，执行顺序相反，各一次
    assert_eq!(
        status.cleanup_executed,
        vec!["service:tokenizer-api:stop".to_string(), "manager:rollback".to_string()]
    );

    let calls = backend.calls();
    let after_verify: Vec<_> = calls
        .iter()
        .skip_while(|c| **c != "verify_deployment")
        .skip(1)
        .copied()
        .collect();
    assert_eq!(after_verify, vec!["stop_service", "stop_service", "cleanup"]);

    // 目录保留
    assert!(dir.path().join("data").is_dir());
}

#[tokio::test]
async fn invalid_step_result_fails_fast_with_error_text() {
    let port = spawn_mock_server().await;
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::default().on(
        "install_dependencies",
        Box::new(|| Ok(OpReport::failed("X"))),
    ));
    let orch = orchestrator(test_config(dir.path(), port), backend.clone(), passing_validator());

    let result = orch.deploy(None).await;

    assert!(!result.success);
    assert_eq!(result.progress.status, OverallStatus::Failed);
    // install_dependencies 是第 3 步
    assert_eq!(result.progress.percentage, 50.0);

    let step = result.progress.step(StepName::InstallDependencies).unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert!(step.error_message.as_deref().unwrap().contains('X'));
    for later in [
        StepName::ConfigureService,
        StepName::StartService,
        StepName::VerifyDeployment,
    ] {
        assert_eq!(result.progress.step(later).unwrap().status, StepStatus::NotStarted);
    }
    assert!(!backend.calls().contains(&"configure_service"));
}

#[tokio::test]
async fn observer_sees_monotonic_progress() {
    let port = spawn_mock_server().await;
    let dir = tempfile::tempdir().unwrap();
    let seen = Arc::new(Mutex::new(Vec::<f64>::new()));
    let sink = seen.clone();

    let orch = Orchestrator::builder(test_config(dir.path(), port))
        .backend(Arc::new(ScriptedBackend::default()))
        .validator(passing_validator())
        .observer(Arc::new(move |p: &DeploymentProgress| {
            sink.lock().unwrap().push(p.percentage);
        }))
        .build();

    let result = orch.deploy(None).await;
    assert!(result.success, "{:?}", result.error);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 12);
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(seen.last().copied(), Some(100.0));
}

#[tokio::test]
async fn resource_exhaustion_shrinks_limits_without_retry() {
    let port = spawn_mock_server().await;
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::default().on(
        "start_service",
        Box::new(|| Err(DeployError::ResourceExhausted("container OOM killed".into()))),
    ));
    let orch = orchestrator(test_config(dir.path(), port), backend.clone(), passing_validator());

    let result = orch.deploy(None).await;

    assert!(!result.success);
    assert!(result.recovered);
    assert_eq!(orch.config().await.limits().memory_mb, 1024);
    assert_eq!(orch.config().await.limits().max_concurrency, 50);
    // 本次尝试不会用新配置重试
    assert_eq!(
        backend.calls().iter().filter(|c| **c == "start_service").count(),
        1
    );
}

/// 绑定后立即释放的端口，上面没有任何服务
async fn dead_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn calls_after(calls: &[&'static str], op: &str) -> Vec<&'static str> {
    calls
        .iter()
        .skip_while(|c| **c != op)
        .skip(1)
        .copied()
        .collect()
}

#[tokio::test]
async fn failed_stop_action_falls_back_and_removes_env_file() {
    let port = spawn_mock_server().await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), port);
    let env_file = config.env_file_path();
    let written = env_file.clone();

    let backend = Arc::new(
        ScriptedBackend::default()
            .on(
                "configure_service",
                Box::new(move || {
                    std::fs::write(&written, "TOKENIZER_PORT=8000\n").unwrap();
                    Ok(OpReport::ok())
                }),
            )
            .on(
                "verify_deployment",
                Box::new(|| Err(DeployError::other("deployment failed: X"))),
            )
            .on(
                "stop_service",
                Box::new(|| Err(DeployError::other("daemon not responding"))),
            ),
    );
    let orch = orchestrator(config, backend.clone(), passing_validator());

    let result = orch.deploy(None).await;

    assert!(!result.success);
    assert!(!result.recovered);
    // 服务的停止动作失败，资源遍历时再停一次
    assert_eq!(
        calls_after(&backend.calls(), "verify_deployment"),
        vec!["stop_service", "stop_service", "cleanup", "stop_service"]
    );
    assert!(!env_file.exists());
    assert!(dir.path().join("config").is_dir());

    let status = orch.get_deployment_status().await.unwrap();
    assert_eq!(status.resources_allocated, 6);
    assert_eq!(status.cleanup_executed.len(), 2);
}

#[tokio::test]
async fn permission_fault_relaxes_directory_permissions() {
    let port = spawn_mock_server().await;
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    let locked = data_dir.clone();
    let backend = Arc::new(ScriptedBackend::default().on(
        "start_service",
        Box::new(move || {
            std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o700)).unwrap();
            Err(DeployError::PermissionDenied("cannot write pid file".into()))
        }),
    ));
    let orch = orchestrator(test_config(dir.path(), port), backend.clone(), passing_validator());

    let result = orch.deploy(None).await;

    assert!(!result.success);
    assert!(result.recovered);
    assert!(result.rollback_available);
    let mode = std::fs::metadata(&data_dir).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o755);

    let status = orch.get_deployment_status().await.unwrap();
    assert_eq!(status.error_history[0].category, ErrorCategory::PermissionDenied);
    assert!(status.cleanup_executed.is_empty());
}

#[tokio::test]
async fn permission_fault_on_privileged_backend_needs_root() {
    let port = spawn_mock_server().await;
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::default().on(
        "start_service",
        Box::new(|| Err(DeployError::PermissionDenied("systemctl: access denied".into()))),
    ));
    let config = test_config_for(dir.path(), port, DeployMethod::Systemd);
    let orch = orchestrator(config, backend.clone(), passing_validator());

    let result = orch.deploy(None).await;
    assert!(!result.success);

    let status = orch.get_deployment_status().await.unwrap();
    assert_eq!(status.error_history[0].category, ErrorCategory::PermissionDenied);
    if CommandRunner::is_root().await {
        assert!(result.recovered);
        assert!(status.cleanup_executed.is_empty());
    } else {
        // 没有特权直接判定不可恢复，随后清理
        assert!(!result.recovered);
        assert_eq!(status.cleanup_executed, vec!["manager:rollback".to_string()]);
        assert_eq!(
            calls_after(&backend.calls(), "start_service"),
            vec!["stop_service", "cleanup"]
        );
    }
}

#[tokio::test]
async fn service_unavailable_recovers_when_liveness_answers() {
    let port = spawn_mock_server().await;
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::default().on(
        "start_service",
        Box::new(|| Err(DeployError::ServiceUnavailable("runtime busy".into()))),
    ));
    let orch = orchestrator(test_config(dir.path(), port), backend.clone(), passing_validator());

    let result = orch.deploy(None).await;

    assert!(!result.success);
    assert!(result.recovered);
    let status = orch.get_deployment_status().await.unwrap();
    assert_eq!(status.metadata["recovery"]["category"], "service_unavailable");
    assert_eq!(status.metadata["recovery"]["recovered"], true);
    assert!(status.cleanup_executed.is_empty());
    assert!(!backend.calls().contains(&"cleanup"));
}

#[tokio::test]
async fn service_unavailable_without_live_service_cleans_up() {
    let port = dead_port().await;
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::default().on(
        "start_service",
        Box::new(|| Err(DeployError::ServiceUnavailable("runtime busy".into()))),
    ));
    let orch = orchestrator(test_config(dir.path(), port), backend.clone(), passing_validator());

    let result = orch.deploy(None).await;

    assert!(!result.success);
    assert!(!result.recovered);
    let status = orch.get_deployment_status().await.unwrap();
    assert_eq!(status.metadata["recovery"]["recovered"], false);
    assert_eq!(status.cleanup_executed, vec!["manager:rollback".to_string()]);
}

#[tokio::test]
async fn configuration_fault_recreates_directories() {
    let port = spawn_mock_server().await;
    let dir = tempfile::tempdir().unwrap();
    let log_dir = dir.path().join("log");
    let removed = log_dir.clone();
    let backend = Arc::new(ScriptedBackend::default().on(
        "configure_service",
        Box::new(move || {
            std::fs::remove_dir_all(&removed).unwrap();
            Err(DeployError::other("config value rejected by service"))
        }),
    ));
    let orch = orchestrator(test_config(dir.path(), port), backend.clone(), passing_validator());

    let result = orch.deploy(None).await;

    assert!(!result.success);
    assert!(result.recovered);
    assert!(log_dir.is_dir());

    let status = orch.get_deployment_status().await.unwrap();
    assert_eq!(status.error_history[0].category, ErrorCategory::ConfigurationInvalid);
    assert_eq!(status.error_history[0].phase, Phase::Preparation);
    assert!(status.cleanup_executed.is_empty());
}

#[tokio::test]
async fn unclassified_fault_has_no_strategy_and_cleans_up() {
    let port = spawn_mock_server().await;
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(ScriptedBackend::default().on(
        "start_service",
        Box::new(|| Err(DeployError::other("something odd happened"))),
    ));
    let orch = orchestrator(test_config(dir.path(), port), backend.clone(), passing_validator());

    let result = orch.deploy(None).await;

    assert!(!result.success);
    assert!(!result.recovered);
    assert!(!result.rollback_available);

    let status = orch.get_deployment_status().await.unwrap();
    assert_eq!(status.error_history[0].category, ErrorCategory::Unknown);
    assert_eq!(status.metadata["recovery"]["category"], "unknown_error");
    // start_service 失败，服务未登记，只剩管理器回滚
    assert_eq!(status.cleanup_executed, vec!["manager:rollback".to_string()]);
    assert_eq!(
        calls_after(&backend.calls(), "start_service"),
        vec!["stop_service", "cleanup"]
    );
}
