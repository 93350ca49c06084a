//! 部署管理器（步骤引擎）
//!
//! 按固定顺序执行六个步骤，每次步骤状态变化后重算进度并同步通知观察者：
//!
//! ```text
//! validate_requirements → validate_configuration → install_dependencies
//!   → configure_service → start_service → verify_deployment
//! ```
//!
//! 首个失败的步骤终止整个流程，后续步骤保持 not_started。

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::DeploymentConfig;
use crate::domain::deploy::{
    DeploymentProgress, DeploymentResult, OpReport, OverallStatus, StepName, StepStatus,
};
use crate::error::DeployError;
use crate::infra::ServiceClient;

use super::config_check::{ConfigurationValidator, PathConfigValidator};
use super::deploy::{create_backend, DeploymentBackend};

/// 进度广播通道容量
const PROGRESS_CHANNEL_CAPACITY: usize = 64;

/// 进度观察者
///
/// 在执行流程中同步调用，实现不能阻塞
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, progress: &DeploymentProgress);
}

impl<F> ProgressObserver for F
where
    F: Fn(&DeploymentProgress) + Send + Sync,
{
    fn on_progress(&self, progress: &DeploymentProgress) {
        self(progress)
    }
}

/// 把每次进度变化写入日志
#[derive(Default)]
pub struct LoggingObserver;

impl ProgressObserver for LoggingObserver {
    fn on_progress(&self, progress: &DeploymentProgress) {
        let current = progress
            .steps
            .iter()
            .rev()
            .find(|s| s.status != StepStatus::NotStarted);
        if let Some(step) = current {
            info!(
                step = %step.name,
                status = ?step.status,
                percentage = progress.percentage,
                "Deployment progress"
            );
        }
    }
}

/// 通过广播通道发布进度快照
///
/// 没有订阅者时发送失败会被忽略
pub struct ChannelObserver {
    sender: broadcast::Sender<DeploymentProgress>,
}

impl ChannelObserver {
    pub fn channel() -> (Self, broadcast::Receiver<DeploymentProgress>) {
        let (sender, receiver) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        (Self { sender }, receiver)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentProgress> {
        self.sender.subscribe()
    }
}

impl ProgressObserver for ChannelObserver {
    fn on_progress(&self, progress: &DeploymentProgress) {
        let _ = self.sender.send(progress.clone());
    }
}

/// 部署管理器
///
/// 一个配置对应一个后端实例和一份进度
pub struct DeploymentManager {
    config: DeploymentConfig,
    backend: Arc<dyn DeploymentBackend>,
    config_validator: Arc<dyn ConfigurationValidator>,
    observer: Option<Arc<dyn ProgressObserver>>,
    progress: Mutex<DeploymentProgress>,
}

impl DeploymentManager {
    /// 按配置选择后端，使用默认配置校验器
    pub fn new(config: DeploymentConfig) -> Self {
        let backend = create_backend(&config);
        Self::with_backend(config, backend)
    }

    pub fn with_backend(config: DeploymentConfig, backend: Arc<dyn DeploymentBackend>) -> Self {
        Self {
            config,
            backend,
            config_validator: Arc::new(PathConfigValidator::new()),
            observer: None,
            progress: Mutex::new(DeploymentProgress::new()),
        }
    }

    pub fn config_validator(mut self, validator: Arc<dyn ConfigurationValidator>) -> Self {
        self.config_validator = validator;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &DeploymentConfig {
        &self.config
    }

    pub fn backend(&self) -> Arc<dyn DeploymentBackend> {
        self.backend.clone()
    }

    /// 当前进度快照
    pub async fn progress(&self) -> DeploymentProgress {
        self.progress.lock().await.clone()
    }

    /// 执行单个步骤
    ///
    /// 无效结果返回 `Ok(report)` 且步骤标记为 failed；故障返回 `Err`，步骤同样标记为 failed。
    pub async fn run_step(&self, name: StepName) -> Result<OpReport, DeployError> {
        self.mutate(|progress| {
            if progress.status == OverallStatus::NotStarted {
                progress.status = OverallStatus::InProgress;
            }
            if let Some(step) = progress.step_mut(name) {
                step.start();
            }
        })
        .await;

        debug!(step = %name, "Running deployment step");
        let outcome = self.invoke(name).await;

        match &outcome {
            Ok(report) if report.is_valid() => {
                let warnings = report.warnings.clone();
                self.mutate(|progress| {
                    if let Some(step) = progress.step_mut(name) {
                        step.complete(warnings);
                    }
                    if progress.all_completed() {
                        progress.status = OverallStatus::Completed;
                    }
                })
                .await;
                for w in &report.warnings {
                    warn!(step = %name, "{}", w);
                }
                info!(step = %name, "Deployment step completed");
            }
            Ok(report) => {
                let message = report.errors.join("; ");
                let warnings = report.warnings.clone();
                error!(step = %name, error = %message, "Deployment step failed");
                self.mutate(|progress| {
                    if let Some(step) = progress.step_mut(name) {
                        step.fail(message, warnings);
                    }
                    progress.status = OverallStatus::Failed;
                })
                .await;
            }
            Err(e) => {
                let message = e.to_string();
                error!(step = %name, error = %message, "Deployment step raised");
                self.mutate(|progress| {
                    if let Some(step) = progress.step_mut(name) {
                        step.fail(message, Vec::new());
                    }
                    progress.status = OverallStatus::Failed;
                })
                .await;
            }
        }

        outcome
    }

    /// 顺序执行全部步骤，首个失败即停止
    pub async fn deploy(&self) -> DeploymentResult {
        info!(method = %self.backend.method(), "Starting deployment steps");
        *self.progress.lock().await = DeploymentProgress::new();

        for name in StepName::ALL {
            let failure = match self.run_step(name).await {
                Ok(report) if report.is_valid() => continue,
                Ok(report) => DeployError::StepFailed {
                    step: name.as_str().to_string(),
                    errors: report.errors,
                },
                Err(e) => e,
            };

            let progress = self.progress().await;
            let mut result =
                DeploymentResult::failure(String::new(), progress, failure.to_string());
            result.rollback_available = self.has_side_effects(&result.progress);
            result.config_path = Some(self.config.env_file_path());
            result.log_path = Some(self.config.paths().log_dir.clone());
            return result;
        }

        let progress = self.progress().await;
        DeploymentResult {
            success: true,
            deployment_id: String::new(),
            progress,
            endpoints: service_endpoints(&self.config),
            config_path: Some(self.config.env_file_path()),
            log_path: Some(self.config.paths().log_dir.clone()),
            summary_path: None,
            rollback_available: true,
            service_info: self.service_info().await,
            error: None,
            recovered: false,
        }
    }

    /// 回滚：先停止再清理，两步都执行，失败只记为警告
    pub async fn rollback(&self) -> OpReport {
        info!(method = %self.backend.method(), "Rolling back deployment");
        rollback_backend(self.backend.as_ref()).await
    }

    /// 尽力获取服务信息（健康接口返回的 JSON）
    pub async fn service_info(&self) -> Option<serde_json::Value> {
        let client = ServiceClient::new(&self.config).ok()?;
        match client.liveness().await {
            Ok(outcome) if outcome.healthy => outcome.body,
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "Service info unavailable");
                None
            }
        }
    }

    async fn invoke(&self, name: StepName) -> Result<OpReport, DeployError> {
        match name {
            StepName::ValidateRequirements => self.backend.validate_requirements().await,
            StepName::ValidateConfiguration => {
                self.config_validator.validate_configuration(&self.config).await
            }
            StepName::InstallDependencies => self.backend.install_dependencies().await,
            StepName::ConfigureService => self.backend.configure_service(&self.config).await,
            StepName::StartService => self.backend.start_service().await,
            StepName::VerifyDeployment => self.backend.verify_deployment().await,
        }
    }

    /// 修改进度、重算百分比并通知观察者
    async fn mutate<F>(&self, f: F)
    where
        F: FnOnce(&mut DeploymentProgress),
    {
        let snapshot = {
            let mut progress = self.progress.lock().await;
            f(&mut progress);
            progress.recompute();
            progress.clone()
        };
        if let Some(ref observer) = self.observer {
            observer.on_progress(&snapshot);
        }
    }

    /// 是否已经越过只读检查阶段
    fn has_side_effects(&self, progress: &DeploymentProgress) -> bool {
        [
            StepName::InstallDependencies,
            StepName::ConfigureService,
            StepName::StartService,
            StepName::VerifyDeployment,
        ]
        .iter()
        .filter_map(|name| progress.step(*name))
        .any(|step| step.status != StepStatus::NotStarted)
    }
}

/// 直接对后端执行回滚
pub async fn rollback_backend(backend: &dyn DeploymentBackend) -> OpReport {
    let mut report = OpReport::ok();

    for (what, outcome) in [
        ("stop_service", backend.stop_service().await),
        ("cleanup", backend.cleanup().await),
    ] {
        match outcome {
            Ok(r) => {
                report.warnings.extend(r.warnings);
                for e in r.errors {
                    report.warn(format!("{}: {}", what, e));
                }
            }
            Err(e) => {
                warn!(operation = what, error = %e, "Rollback operation failed");
                report.warn(format!("{}: {}", what, e));
            }
        }
    }
    report
}

/// 服务端点（按配置构造，不做校验）
pub fn service_endpoints(config: &DeploymentConfig) -> BTreeMap<String, String> {
    let service = config.service();
    BTreeMap::from([
        ("base".to_string(), service.probe_base_url()),
        ("liveness".to_string(), service.liveness_url()),
        ("functional".to_string(), service.functional_url()),
    ])
}
