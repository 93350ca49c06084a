//! 部署相关领域模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// 部署方式
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeployMethod {
    /// 容器运行时（docker）
    Docker,
    /// init 系统托管（systemd）
    Systemd,
    /// 独立进程
    Standalone,
}

impl DeployMethod {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployMethod::Docker => "docker",
            DeployMethod::Systemd => "systemd",
            DeployMethod::Standalone => "standalone",
        }
    }

    /// 从字符串解析，支持常见别名
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "docker" | "container" => Some(DeployMethod::Docker),
            "systemd" | "init" | "init-system" | "init_system" => Some(DeployMethod::Systemd),
            "standalone" | "process" => Some(DeployMethod::Standalone),
            _ => None,
        }
    }

    /// 是否需要 root 权限
    pub fn requires_privilege(&self) -> bool {
        matches!(self, DeployMethod::Systemd)
    }
}

impl std::fmt::Display for DeployMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 后端操作结果
///
/// `errors` 为空即有效。警告在失败路径上同样保留。
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct OpReport {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl OpReport {
    /// 有效结果
    pub fn ok() -> Self {
        Self::default()
    }

    /// 带单条错误的无效结果
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            warnings: Vec::new(),
            errors: vec![error.into()],
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warn(warning);
        self
    }

    /// 合并另一个结果
    pub fn merge(&mut self, other: OpReport) {
        self.warnings.extend(other.warnings);
        self.errors.extend(other.errors);
    }
}

/// 固定的步骤序列
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    ValidateRequirements,
    ValidateConfiguration,
    InstallDependencies,
    ConfigureService,
    StartService,
    VerifyDeployment,
}

impl StepName {
    /// 规范顺序
    pub const ALL: [StepName; 6] = [
        StepName::ValidateRequirements,
        StepName::ValidateConfiguration,
        StepName::InstallDependencies,
        StepName::ConfigureService,
        StepName::StartService,
        StepName::VerifyDeployment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::ValidateRequirements => "validate_requirements",
            StepName::ValidateConfiguration => "validate_configuration",
            StepName::InstallDependencies => "install_dependencies",
            StepName::ConfigureService => "configure_service",
            StepName::StartService => "start_service",
            StepName::VerifyDeployment => "verify_deployment",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            StepName::ValidateRequirements => "Check backend prerequisites",
            StepName::ValidateConfiguration => "Validate deployment configuration",
            StepName::InstallDependencies => "Install dependencies",
            StepName::ConfigureService => "Write service configuration",
            StepName::StartService => "Start service",
            StepName::VerifyDeployment => "Wait for service health",
        }
    }
}

impl std::fmt::Display for StepName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 步骤状态
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    NotStarted,
    Preparing,
    Completed,
    Failed,
}

impl StepStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }
}

/// 部署步骤信息
#[derive(Clone, Debug, Serialize)]
pub struct DeploymentStep {
    pub name: StepName,
    pub description: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 持续时间（毫秒）
    pub duration_ms: Option<i64>,
    pub warnings: Vec<String>,
    pub details: BTreeMap<String, serde_json::Value>,
    pub error_message: Option<String>,
}

impl DeploymentStep {
    /// 创建新的待执行步骤
    pub fn new(name: StepName) -> Self {
        Self {
            name,
            description: name.description().to_string(),
            status: StepStatus::NotStarted,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            warnings: Vec::new(),
            details: BTreeMap::new(),
            error_message: None,
        }
    }

    /// 开始执行步骤
    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
        self.finished_at = None;
        self.duration_ms = None;
        self.error_message = None;
        self.warnings.clear();
        self.status = StepStatus::Preparing;
    }

    /// 以有效结果完成
    pub fn complete(&mut self, warnings: Vec<String>) {
        self.warnings.extend(warnings);
        self.status = StepStatus::Completed;
        self.stamp_end();
    }

    /// 以失败结束
    pub fn fail(&mut self, error_message: impl Into<String>, warnings: Vec<String>) {
        self.warnings.extend(warnings);
        self.error_message = Some(error_message.into());
        self.status = StepStatus::Failed;
        self.stamp_end();
    }

    fn stamp_end(&mut self) {
        let now = Utc::now();
        self.finished_at = Some(now);
        if let Some(started) = self.started_at {
            self.duration_ms = Some((now - started).num_milliseconds());
        }
    }
}

/// 整体状态
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

/// 部署进度
#[derive(Clone, Debug, Serialize)]
pub struct DeploymentProgress {
    pub steps: Vec<DeploymentStep>,
    pub status: OverallStatus,
    /// 0.0 - 100.0
    pub percentage: f64,
}

impl DeploymentProgress {
    /// 以规范顺序初始化全部步骤
    pub fn new() -> Self {
        Self {
            steps: StepName::ALL.iter().map(|s| DeploymentStep::new(*s)).collect(),
            status: OverallStatus::NotStarted,
            percentage: 0.0,
        }
    }

    pub fn step(&self, name: StepName) -> Option<&DeploymentStep> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_mut(&mut self, name: StepName) -> Option<&mut DeploymentStep> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    /// 重新计算进度百分比：终态步骤数 / 总步骤数
    pub fn recompute(&mut self) {
        let total = self.steps.len();
        if total == 0 {
            self.percentage = 0.0;
            return;
        }
        let done = self.steps.iter().filter(|s| s.status.is_terminal()).count();
        self.percentage = done as f64 * 100.0 / total as f64;
    }

    /// 首个失败步骤
    pub fn failed_step(&self) -> Option<&DeploymentStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }

    pub fn all_completed(&self) -> bool {
        self.steps.iter().all(|s| s.status == StepStatus::Completed)
    }
}

impl Default for DeploymentProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// 一次部署尝试的最终结果
#[derive(Clone, Debug, Serialize)]
pub struct DeploymentResult {
    pub success: bool,
    pub deployment_id: String,
    pub progress: DeploymentProgress,
    /// 服务端点 (liveness / functional / base)
    pub endpoints: BTreeMap<String, String>,
    pub config_path: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub summary_path: Option<PathBuf>,
    pub rollback_available: bool,
    /// 健康检查返回的服务信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_info: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 本次失败已执行过恢复策略且恢复成功
    pub recovered: bool,
}

impl DeploymentResult {
    /// 失败结果
    pub fn failure(deployment_id: impl Into<String>, progress: DeploymentProgress, error: impl Into<String>) -> Self {
        Self {
            success: false,
            deployment_id: deployment_id.into(),
            progress,
            endpoints: BTreeMap::new(),
            config_path: None,
            log_path: None,
            summary_path: None,
            rollback_available: false,
            service_info: None,
            error: Some(error.into()),
            recovered: false,
        }
    }
}
