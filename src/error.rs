//! 统一错误处理
//!
//! `DeployError` 是编排引擎内部唯一的故障类型。已知原因的故障在调用点直接构造对应变体，
//! 来自子进程/HTTP 的不透明故障再交给 [`classify`] 的有序子串表做兜底分类。

use thiserror::Error;

use crate::domain::orchestration::ErrorCategory;
use crate::domain::validation::CheckResult;
use crate::infra::command::CommandError;

/// 配置构造错误（结构校验失败）
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid configuration field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("failed to read configuration file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse configuration file {path}: {reason}")]
    Parse { path: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// 部署故障
#[derive(Debug, Error)]
pub enum DeployError {
    /// 有界操作超时
    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    /// 无法连接目标
    #[error("connection error: {0}")]
    Connection(String),

    /// 权限不足
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// 资源耗尽（内存、磁盘等）
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// 服务不可用
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// 配置无效
    #[error("configuration invalid: {0}")]
    Configuration(#[from] ConfigError),

    /// 预检失败，列出所有失败检查项
    #[error("validation failed: {}", format_failed_checks(.failed_checks))]
    ValidationFailed { failed_checks: Vec<CheckResult> },

    /// 后端步骤返回了无效结果
    #[error("deployment step '{step}' failed: {}", .errors.join("; "))]
    StepFailed { step: String, errors: Vec<String> },

    /// 子进程执行失败
    #[error(transparent)]
    Command(#[from] CommandError),

    /// HTTP 调用失败
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO 错误
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 其它不透明故障
    #[error("{0}")]
    Other(String),
}

impl DeployError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    /// 变体名称，参与兜底分类
    pub fn kind_name(&self) -> &'static str {
        match self {
            DeployError::Timeout { .. } => "TimeoutError",
            DeployError::Connection(_) => "ConnectionError",
            DeployError::PermissionDenied(_) => "PermissionError",
            DeployError::ResourceExhausted(_) => "ResourceError",
            DeployError::ServiceUnavailable(_) => "UnavailableError",
            DeployError::Configuration(_) => "ConfigurationError",
            DeployError::ValidationFailed { .. } => "ValidationFailed",
            DeployError::StepFailed { .. } => "DeploymentStepFailed",
            DeployError::Command(_) => "CommandError",
            DeployError::Http(_) => "HttpError",
            DeployError::Io(_) => "IoError",
            DeployError::Other(_) => "Error",
        }
    }
}

fn format_failed_checks(checks: &[CheckResult]) -> String {
    checks
        .iter()
        .map(|c| format!("{}/{}: {}", c.category, c.name, c.message))
        .collect::<Vec<_>>()
        .join(", ")
}

/// 兜底分类规则，按顺序匹配，首个命中生效
const CLASSIFICATION_RULES: &[(&[&str], ErrorCategory)] = &[
    (&["timeout", "connection"], ErrorCategory::ConnectionTimeout),
    (&["permission", "access"], ErrorCategory::PermissionDenied),
    (&["memory", "resource"], ErrorCategory::ResourceExhausted),
    (&["unavailable", "refused"], ErrorCategory::ServiceUnavailable),
    (&["configuration", "config"], ErrorCategory::ConfigurationInvalid),
    (&["deployment"], ErrorCategory::DeploymentFailed),
];

/// 按有序子串表对任意文本分类（大小写不敏感）
pub fn classify_message(type_name: &str, message: &str) -> ErrorCategory {
    let haystack = format!("{} {}", type_name, message).to_lowercase();
    CLASSIFICATION_RULES
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| haystack.contains(n)))
        .map(|(_, category)| *category)
        .unwrap_or(ErrorCategory::Unknown)
}

/// 错误分类
///
/// 类型明确的变体直接映射；`Command` / `Http` / `Io` / `StepFailed` / `Other`
/// 属于不透明故障，走子串表。`StepFailed` 只看后端给出的错误文本，步骤名不参与匹配。
pub fn classify(error: &DeployError) -> ErrorCategory {
    match error {
        DeployError::Timeout { .. } | DeployError::Connection(_) => {
            ErrorCategory::ConnectionTimeout
        }
        DeployError::PermissionDenied(_) => ErrorCategory::PermissionDenied,
        DeployError::ResourceExhausted(_) => ErrorCategory::ResourceExhausted,
        DeployError::ServiceUnavailable(_) => ErrorCategory::ServiceUnavailable,
        DeployError::Configuration(_) => ErrorCategory::ConfigurationInvalid,
        DeployError::Command(CommandError::Timeout { .. }) => ErrorCategory::ConnectionTimeout,
        DeployError::Http(e) if e.is_timeout() || e.is_connect() => {
            ErrorCategory::ConnectionTimeout
        }
        DeployError::StepFailed { errors, .. } => {
            classify_message(error.kind_name(), &errors.join("; "))
        }
        _ => classify_message(error.kind_name(), &error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_message_rules_in_order() {
        assert_eq!(
            classify_message("", "Connection Timeout while pulling"),
            ErrorCategory::ConnectionTimeout
        );
        assert_eq!(
            classify_message("", "mkdir: Permission denied"),
            ErrorCategory::PermissionDenied
        );
        assert_eq!(
            classify_message("", "cannot allocate memory"),
            ErrorCategory::ResourceExhausted
        );
        assert_eq!(
            classify_message("", "connect: refused"),
            ErrorCategory::ServiceUnavailable
        );
        assert_eq!(
            classify_message("", "bad config value"),
            ErrorCategory::ConfigurationInvalid
        );
        assert_eq!(
            classify_message("", "deployment failed: X"),
            ErrorCategory::DeploymentFailed
        );
        assert_eq!(classify_message("", "something odd"), ErrorCategory::Unknown);
    }

    #[test]
    fn test_earlier_rule_wins() {
        // "access" 在 "deployment" 之前
        assert_eq!(
            classify_message("", "deployment failed: access denied"),
            ErrorCategory::PermissionDenied
        );
    }

    #[test]
    fn test_type_name_participates() {
        assert_eq!(
            classify_message("TimeoutError", "no details"),
            ErrorCategory::ConnectionTimeout
        );
    }

    #[test]
    fn test_classify_is_idempotent() {
        let err = DeployError::other("connection timeout while starting container");
        assert_eq!(classify(&err), classify(&err));
        assert_eq!(classify(&err), ErrorCategory::ConnectionTimeout);
    }

    #[test]
    fn test_typed_variants_map_directly() {
        assert_eq!(
            classify(&DeployError::PermissionDenied("x".into())),
            ErrorCategory::PermissionDenied
        );
        assert_eq!(
            classify(&DeployError::timeout("health poll", 30)),
            ErrorCategory::ConnectionTimeout
        );
        assert_eq!(
            classify(&DeployError::Configuration(ConfigError::invalid("port", "zero"))),
            ErrorCategory::ConfigurationInvalid
        );
    }

    #[test]
    fn test_step_failed_falls_back_to_table() {
        let err = DeployError::StepFailed {
            step: "start_service".into(),
            errors: vec!["exit status 125".into()],
        };
        assert_eq!(classify(&err), ErrorCategory::DeploymentFailed);
    }

    #[test]
    fn test_step_name_does_not_drive_classification() {
        for step in ["configure_service", "validate_configuration", "install_dependencies"] {
            let err = DeployError::StepFailed {
                step: step.into(),
                errors: vec!["exit status 1".into()],
            };
            assert_eq!(classify(&err), ErrorCategory::DeploymentFailed, "{}", step);
        }

        let err = DeployError::StepFailed {
            step: "install_dependencies".into(),
            errors: vec!["missing config file /etc/tokenizer-api/app.toml".into()],
        };
        assert_eq!(classify(&err), ErrorCategory::ConfigurationInvalid);
    }
}
