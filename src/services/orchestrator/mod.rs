//! 统一编排器
//!
//! 六个阶段严格线性执行：
//!
//! ```text
//! initialization → validation → preparation → execution → verification → finalization
//!                                                                   ↘ completed | failed
//! ```
//!
//! 任何阶段出错：记录错误（带阶段与分类）→ 进入 failed → 尝试一次恢复 →
//! 未恢复则执行清理。`deploy()` 永远返回 [`DeploymentResult`]，不向外抛错。

mod cleanup;
pub mod context;
mod recovery;

use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::config::env::constants::CANONICAL_PROBE_TEXT;
use crate::config::DeploymentConfig;
use crate::domain::deploy::{DeploymentProgress, DeploymentResult, OpReport, StepName};
use crate::domain::orchestration::{DeploymentStatus, Phase, ResourceKind};
use crate::domain::validation::ValidationStatus;
use crate::error::{classify, DeployError};
use crate::infra::ServiceClient;

use super::config_check::{ConfigurationValidator, PathConfigValidator};
use super::deploy::{create_backend, DeploymentBackend};
use super::manager::{service_endpoints, DeploymentManager, ProgressObserver};
use super::validation::{SystemValidator, ValidationCollaborator};

pub use context::{CleanupAction, CleanupFn, CleanupFuture, DeploymentContext};

/// 编排器构造器
pub struct OrchestratorBuilder {
    config: DeploymentConfig,
    backend: Option<Arc<dyn DeploymentBackend>>,
    validator: Option<Arc<dyn ValidationCollaborator>>,
    config_validator: Option<Arc<dyn ConfigurationValidator>>,
    observer: Option<Arc<dyn ProgressObserver>>,
    span: Option<Span>,
}

impl OrchestratorBuilder {
    /// 替换按部署方式选出的后端
    pub fn backend(mut self, backend: Arc<dyn DeploymentBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn ValidationCollaborator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn config_validator(mut self, validator: Arc<dyn ConfigurationValidator>) -> Self {
        self.config_validator = Some(validator);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// 日志 span，默认新建 `deployment` span
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn build(self) -> Orchestrator {
        let span = self.span.unwrap_or_else(|| {
            info_span!(
                "deployment",
                method = %self.config.method(),
                deployment_id = tracing::field::Empty
            )
        });
        let backend = self
            .backend
            .clone()
            .unwrap_or_else(|| create_backend(&self.config));
        Orchestrator {
            backend: RwLock::new(backend),
            injected_backend: self.backend,
            config: RwLock::new(self.config),
            validator: self
                .validator
                .unwrap_or_else(|| Arc::new(SystemValidator::new())),
            config_validator: self
                .config_validator
                .unwrap_or_else(|| Arc::new(PathConfigValidator::new())),
            observer: self.observer,
            span,
            context: RwLock::new(None),
            manager: RwLock::new(None),
        }
    }
}

/// 统一编排器
///
/// 同一实例上不要并发调用 `deploy()`
pub struct Orchestrator {
    config: RwLock<DeploymentConfig>,
    backend: RwLock<Arc<dyn DeploymentBackend>>,
    injected_backend: Option<Arc<dyn DeploymentBackend>>,
    validator: Arc<dyn ValidationCollaborator>,
    config_validator: Arc<dyn ConfigurationValidator>,
    observer: Option<Arc<dyn ProgressObserver>>,
    span: Span,
    context: RwLock<Option<DeploymentContext>>,
    manager: RwLock<Option<Arc<DeploymentManager>>>,
}

impl Orchestrator {
    pub fn builder(config: DeploymentConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            backend: None,
            validator: None,
            config_validator: None,
            observer: None,
            span: None,
        }
    }

    pub fn new(config: DeploymentConfig) -> Self {
        Self::builder(config).build()
    }

    /// 当前配置（资源类恢复可能已将其缩减）
    pub async fn config(&self) -> DeploymentConfig {
        self.config.read().await.clone()
    }

    /// 当前尝试使用的后端
    pub async fn backend(&self) -> Arc<dyn DeploymentBackend> {
        self.backend.read().await.clone()
    }

    /// 只读状态快照，尚未开始部署时为 None
    pub async fn get_deployment_status(&self) -> Option<DeploymentStatus> {
        self.context.read().await.as_ref().map(|ctx| ctx.status())
    }

    /// 执行一次部署尝试
    pub async fn deploy(&self, deployment_id: Option<String>) -> DeploymentResult {
        let deployment_id = deployment_id.unwrap_or_else(|| format!("deploy-{}", Uuid::new_v4()));
        self.span.record("deployment_id", deployment_id.as_str());

        self.run(deployment_id).instrument(self.span.clone()).await
    }

    async fn run(&self, deployment_id: String) -> DeploymentResult {
        *self.context.write().await = Some(DeploymentContext::new(deployment_id.clone()));
        *self.manager.write().await = None;
        info!(deployment_id = %deployment_id, "Deployment started");

        match self.execute_phases(&deployment_id).await {
            Ok(result) => {
                self.update(|ctx| ctx.transition(Phase::Completed)).await;
                let duration = self.update(|ctx| ctx.duration()).await.unwrap_or_default();
                info!(deployment_id = %deployment_id, duration_secs = duration, "Deployment completed");
                result
            }
            Err(e) => self.handle_failure(&deployment_id, e).await,
        }
    }

    async fn execute_phases(&self, deployment_id: &str) -> Result<DeploymentResult, DeployError> {
        let manager = self.initialization().await?;
        self.validation().await?;
        self.preparation(&manager).await?;
        self.execution(&manager).await?;
        self.verification(&manager).await?;
        self.finalization(&manager, deployment_id).await
    }

    /// 错误处理：记录 → failed → 恢复 → 清理
    async fn handle_failure(&self, deployment_id: &str, e: DeployError) -> DeploymentResult {
        let category = classify(&e);
        let message = e.to_string();
        let phase = self
            .update(|ctx| {
                let phase = ctx.current_phase();
                ctx.record_error(message.clone(), category);
                ctx.transition(Phase::Failed);
                phase
            })
            .await;
        error!(
            deployment_id = %deployment_id,
            phase = %phase.map(|p| p.as_str()).unwrap_or("unknown"),
            category = %category,
            error = %message,
            "Deployment failed"
        );

        let recovered = self.recover(category).await;
        self.update(|ctx| {
            ctx.set_metadata(
                "recovery",
                json!({ "category": category.as_str(), "recovered": recovered }),
            )
        })
        .await;

        if !recovered {
            self.cleanup().await;
        }

        let progress = match self.manager.read().await.as_ref() {
            Some(manager) => manager.progress().await,
            None => DeploymentProgress::new(),
        };
        let config = self.config().await;

        let mut result = DeploymentResult::failure(deployment_id, progress, message);
        result.recovered = recovered;
        result.rollback_available = recovered;
        result.config_path = Some(config.env_file_path());
        result.log_path = Some(config.paths().log_dir.clone());
        if let Some(endpoints) = self.update(|ctx| ctx.endpoints().clone()).await {
            result.endpoints = endpoints;
        }
        result
    }

    async fn enter(&self, phase: Phase) {
        self.update(|ctx| ctx.transition(phase)).await;
        info!(phase = %phase, "Entering phase");
    }

    async fn update<R>(&self, f: impl FnOnce(&mut DeploymentContext) -> R) -> Option<R> {
        self.context.write().await.as_mut().map(f)
    }

    /// 初始化：按当前配置准备后端、构造管理器、创建目录、注册管理器回滚
    async fn initialization(&self) -> Result<Arc<DeploymentManager>, DeployError> {
        self.enter(Phase::Initialization).await;
        let config = self.config().await;

        // 后端持有配置副本，恢复缩减过的限额要在新一轮尝试里生效
        let backend = match self.injected_backend {
            Some(ref backend) => backend.clone(),
            None => create_backend(&config),
        };
        *self.backend.write().await = backend.clone();

        let mut manager = DeploymentManager::with_backend(config.clone(), backend)
            .config_validator(self.config_validator.clone());
        if let Some(ref observer) = self.observer {
            manager = manager.observer(observer.clone());
        }
        let manager = Arc::new(manager);
        *self.manager.write().await = Some(manager.clone());

        for (name, path) in config.paths().all() {
            tokio::fs::create_dir_all(path)
                .await
                .map_err(|e| directory_error(name, path, e))?;
            let id = path.display().to_string();
            self.update(|ctx| ctx.track_resource(ResourceKind::Directory, id, None))
                .await;
        }

        let rollback_target = manager.clone();
        let action = CleanupAction::new(
            "manager:rollback",
            Box::new(move || {
                Box::pin(async move {
                    let report = rollback_target.rollback().await;
                    for w in &report.warnings {
                        warn!("rollback: {}", w);
                    }
                    Ok(())
                })
            }),
        );
        self.update(|ctx| ctx.register_cleanup(action)).await;
        Ok(manager)
    }

    /// 综合校验：FAILED 中止，WARNING 继续
    async fn validation(&self) -> Result<(), DeployError> {
        self.enter(Phase::Validation).await;
        let config = self.config().await;

        let report = self.validator.run_comprehensive_validation(&config).await;
        let summary = serde_json::to_value(&report).unwrap_or_default();
        self.update(|ctx| ctx.set_metadata("validation", summary)).await;

        match report.overall_status {
            ValidationStatus::Failed => Err(DeployError::ValidationFailed {
                failed_checks: report.failed_checks(),
            }),
            ValidationStatus::Warning => {
                for check in report.warnings() {
                    warn!(category = %check.category, check = %check.name, "{}", check.message);
                }
                Ok(())
            }
            ValidationStatus::Passed => {
                info!("Validation passed");
                Ok(())
            }
        }
    }

    async fn preparation(&self, manager: &DeploymentManager) -> Result<(), DeployError> {
        self.enter(Phase::Preparation).await;
        for step in [
            StepName::ValidateRequirements,
            StepName::ValidateConfiguration,
            StepName::InstallDependencies,
            StepName::ConfigureService,
        ] {
            run_checked(manager, step).await?;
        }

        // configure_service 生成的环境文件，失败清理时删除
        let env_file = self.config().await.env_file_path().display().to_string();
        self.update(|ctx| ctx.track_resource(ResourceKind::TempFile, env_file, None))
            .await;
        Ok(())
    }

    /// 启动服务并登记为受追踪资源
    async fn execution(&self, manager: &DeploymentManager) -> Result<(), DeployError> {
        self.enter(Phase::Execution).await;
        run_checked(manager, StepName::StartService).await?;

        let config = self.config().await;
        let service = config.service().name.clone();
        let action_name = format!("service:{}:stop", service);

        let backend = self.backend().await;
        let action = CleanupAction::new(
            action_name.clone(),
            Box::new(move || {
                Box::pin(async move {
                    let report = backend.stop_service().await?;
                    if report.is_valid() {
                        Ok(())
                    } else {
                        Err(DeployError::other(report.errors.join("; ")))
                    }
                })
            }),
        );

        self.update(|ctx| {
            ctx.set_metadata("service_name", service.clone());
            ctx.set_metadata("deploy_method", config.method().as_str());
            ctx.set_metadata("service_port", config.service().port);
            ctx.set_metadata("started_at", chrono::Utc::now().to_rfc3339());
            ctx.track_resource(ResourceKind::Service, service.clone(), Some(action_name));
            ctx.register_cleanup(action);
        })
        .await;
        info!(service = %service, "Service started");
        Ok(())
    }

    /// 后端验证 + 存活探针 + 功能探针
    async fn verification(&self, manager: &DeploymentManager) -> Result<(), DeployError> {
        self.enter(Phase::Verification).await;
        run_checked(manager, StepName::VerifyDeployment).await?;

        let config = self.config().await;
        let client = ServiceClient::new(&config)?;

        let liveness = client.liveness().await?;
        self.update(|ctx| {
            ctx.set_metadata("liveness_url", client.liveness_url());
            ctx.set_metadata("liveness_status", liveness.status);
        })
        .await;
        if !liveness.healthy {
            return Err(DeployError::ServiceUnavailable(format!(
                "liveness probe {} returned {}",
                client.liveness_url(),
                liveness.status
            )));
        }

        let functional = client.tokenize(CANONICAL_PROBE_TEXT).await?;
        let endpoints = service_endpoints(&config);
        self.update(|ctx| {
            if let Some(body) = liveness.body {
                ctx.set_metadata("service_info", body);
            }
            ctx.set_metadata("functional_url", client.functional_url());
            ctx.set_metadata("functional_result", functional);
            ctx.set_metadata("endpoints", json!(endpoints));
            ctx.set_endpoints(endpoints);
        })
        .await;
        info!(url = %client.functional_url(), "Functional probe passed");
        Ok(())
    }

    /// 写入部署摘要并生成结果
    async fn finalization(
        &self,
        manager: &DeploymentManager,
        deployment_id: &str,
    ) -> Result<DeploymentResult, DeployError> {
        self.enter(Phase::Finalization).await;
        let config = self.config().await;

        let summary = self
            .update(|ctx| {
                let mut phases: Vec<&str> =
                    ctx.phases_completed().iter().map(|p| p.as_str()).collect();
                phases.push(Phase::Finalization.as_str());
                json!({
                    "deployment_id": deployment_id,
                    "host": hostname::get().ok().map(|h| h.to_string_lossy().into_owned()),
                    "method": config.method().as_str(),
                    "started_at": ctx.started_at.to_rfc3339(),
                    "duration_secs": ctx.duration(),
                    "phases_completed": phases,
                    "resources": ctx.resources(),
                    "endpoints": ctx.endpoints(),
                    "cleanup_actions": ctx.registered_cleanups(),
                    "configuration": config,
                })
            })
            .await
            .unwrap_or_default();

        let summary_path = config
            .paths()
            .log_dir
            .join(format!("deployment-{}.json", deployment_id));
        let content = serde_json::to_vec_pretty(&summary)
            .map_err(|e| DeployError::other(format!("failed to encode summary: {}", e)))?;
        tokio::fs::write(&summary_path, content).await?;

        let endpoints = self
            .update(|ctx| {
                ctx.set_metadata("summary_path", summary_path.display().to_string());
                ctx.endpoints().clone()
            })
            .await
            .unwrap_or_default();
        let service_info = self
            .update(|ctx| ctx.metadata().get("service_info").cloned())
            .await
            .flatten();
        info!(path = %summary_path.display(), "Deployment summary written");

        Ok(DeploymentResult {
            success: true,
            deployment_id: deployment_id.to_string(),
            progress: manager.progress().await,
            endpoints,
            config_path: Some(config.env_file_path()),
            log_path: Some(config.paths().log_dir.clone()),
            summary_path: Some(summary_path),
            rollback_available: true,
            service_info,
            error: None,
            recovered: false,
        })
    }
}

/// 执行步骤，无效结果转为错误
async fn run_checked(manager: &DeploymentManager, step: StepName) -> Result<OpReport, DeployError> {
    let report = manager.run_step(step).await?;
    if report.is_valid() {
        Ok(report)
    } else {
        Err(DeployError::StepFailed {
            step: step.as_str().to_string(),
            errors: report.errors,
        })
    }
}

fn directory_error(name: &str, path: &std::path::Path, e: std::io::Error) -> DeployError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        DeployError::PermissionDenied(format!("cannot create {} {}: {}", name, path.display(), e))
    } else {
        DeployError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PathsConfig, ServiceConfig};
    use crate::domain::deploy::DeployMethod;
    use crate::domain::orchestration::ErrorCategory;
    use std::path::{Path, PathBuf};

    /// 把启动参数写进文件后睡眠的假服务
    async fn recording_service(dir: &Path) -> (String, PathBuf) {
        use std::os::unix::fs::PermissionsExt;
        let args_file = dir.join("argv.txt");
        let path = dir.join("fake-tokenizer.sh");
        let script = format!(
            "#!/bin/sh\necho \"$@\" > {}\nexec sleep 30\n",
            args_file.display()
        );
        tokio::fs::write(&path, script).await.unwrap();
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .await
            .unwrap();
        (path.display().to_string(), args_file)
    }

    #[tokio::test]
    async fn test_reduced_limits_reach_next_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let (executable, args_file) = recording_service(dir.path()).await;
        let mut service = ServiceConfig::default();
        service.executable = executable;
        let config = DeploymentConfig::builder()
            .method(DeployMethod::Standalone)
            .service(service)
            .paths(PathsConfig::under(dir.path()))
            .build()
            .unwrap();
        let orch = Orchestrator::new(config);

        assert!(orch.recover(ErrorCategory::ResourceExhausted).await);
        assert_eq!(orch.config().await.service().workers, 2);

        // 下一轮尝试的初始化阶段按缩减后的配置重建后端
        *orch.context.write().await = Some(DeploymentContext::new("retry"));
        orch.initialization().await.unwrap();
        let backend = orch.backend().await;
        let report = backend.start_service().await.unwrap();
        assert!(report.is_valid(), "{:?}", report);

        let args = tokio::fs::read_to_string(&args_file).await.unwrap();
        backend.stop_service().await.unwrap();
        assert!(args.contains("--workers 2"), "{}", args);
    }

    #[tokio::test]
    async fn test_injected_backend_survives_initialization() {
        let dir = tempfile::tempdir().unwrap();
        let config = DeploymentConfig::builder()
            .method(DeployMethod::Docker)
            .paths(PathsConfig::under(dir.path()))
            .build()
            .unwrap();
        let injected = create_backend(&config);
        let orch = Orchestrator::builder(config).backend(injected.clone()).build();

        *orch.context.write().await = Some(DeploymentContext::new("injected"));
        orch.initialization().await.unwrap();
        assert!(Arc::ptr_eq(&orch.backend().await, &injected));
    }
}
