//! 编排层领域模型：阶段、错误分类、资源记录与状态快照

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 编排阶段（严格线性）
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initialization,
    Validation,
    Preparation,
    Execution,
    Verification,
    Finalization,
    Completed,
    Failed,
}

impl Phase {
    /// 非终态阶段的执行顺序
    pub const SEQUENCE: [Phase; 6] = [
        Phase::Initialization,
        Phase::Validation,
        Phase::Preparation,
        Phase::Execution,
        Phase::Verification,
        Phase::Finalization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Initialization => "initialization",
            Phase::Validation => "validation",
            Phase::Preparation => "preparation",
            Phase::Execution => "execution",
            Phase::Verification => "verification",
            Phase::Finalization => "finalization",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 错误分类结果
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    ConnectionTimeout,
    PermissionDenied,
    ResourceExhausted,
    ServiceUnavailable,
    ConfigurationInvalid,
    DeploymentFailed,
    #[serde(rename = "unknown_error")]
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ConnectionTimeout => "connection_timeout",
            ErrorCategory::PermissionDenied => "permission_denied",
            ErrorCategory::ResourceExhausted => "resource_exhausted",
            ErrorCategory::ServiceUnavailable => "service_unavailable",
            ErrorCategory::ConfigurationInvalid => "configuration_invalid",
            ErrorCategory::DeploymentFailed => "deployment_failed",
            ErrorCategory::Unknown => "unknown_error",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 被追踪的资源类型
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Directory,
    Service,
    TempFile,
}

/// 被追踪的资源
#[derive(Clone, Debug, Serialize)]
pub struct TrackedResource {
    pub kind: ResourceKind,
    pub id: String,
    /// 负责释放该资源的清理动作名称
    pub cleanup_action: Option<String>,
    pub allocated_at: DateTime<Utc>,
}

/// 错误历史条目
#[derive(Clone, Debug, Serialize)]
pub struct ErrorRecord {
    pub error: String,
    pub category: ErrorCategory,
    pub phase: Phase,
    pub timestamp: DateTime<Utc>,
}

/// 阶段切换记录
#[derive(Clone, Debug, Serialize)]
pub struct PhaseTransition {
    pub from: Option<Phase>,
    pub to: Phase,
    pub timestamp: DateTime<Utc>,
}

/// 只读状态快照，供外部轮询
#[derive(Clone, Debug, Serialize)]
pub struct DeploymentStatus {
    pub deployment_id: String,
    pub current_phase: Phase,
    /// 秒
    pub duration: f64,
    pub resources_allocated: usize,
    pub errors_count: usize,
    pub phases_completed: Vec<Phase>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub error_history: Vec<ErrorRecord>,
    pub phase_history: Vec<PhaseTransition>,
    pub cleanup_executed: Vec<String>,
}

impl DeploymentStatus {
    /// 进入失败前最后处于的阶段
    pub fn last_active_phase(&self) -> Option<Phase> {
        self.phase_history
            .iter()
            .rev()
            .map(|t| t.to)
            .find(|p| !p.is_terminal())
    }
}
