//! 部署后端模块
//!
//! 统一的后端契约 [`DeploymentBackend`] 与三种实现（docker / systemd / 独立进程），
//! 由 [`create_backend`] 按配置中的部署方式选择。

pub mod docker;
pub mod standalone;
pub mod systemd;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::DeploymentConfig;
use crate::domain::deploy::{DeployMethod, OpReport};
use crate::error::DeployError;
use crate::infra::{CommandRunner, ServiceClient};

pub use docker::DockerBackend;
pub use standalone::StandaloneBackend;
pub use systemd::SystemdBackend;

/// 部署后端契约
///
/// 所有操作对“已处于目标状态”幂等。`Ok(report)` 中 `errors` 非空表示预期内的失败，
/// `Err` 表示意外故障。`stop_service` / `cleanup` 只把失败记为警告。
#[async_trait]
pub trait DeploymentBackend: Send + Sync {
    /// 部署方式
    fn method(&self) -> DeployMethod;

    /// 检查前置条件，不改变任何状态
    async fn validate_requirements(&self) -> Result<OpReport, DeployError>;

    /// 准备依赖（可能耗时数分钟，可重复执行）
    async fn install_dependencies(&self) -> Result<OpReport, DeployError>;

    /// 生成服务运行所需的配置文件
    async fn configure_service(&self, config: &DeploymentConfig) -> Result<OpReport, DeployError>;

    /// 启动服务，命令被接受即返回
    async fn start_service(&self) -> Result<OpReport, DeployError>;

    /// 轮询健康状态直到健康或超时
    async fn verify_deployment(&self) -> Result<OpReport, DeployError>;

    /// 停止服务（尽力而为）
    async fn stop_service(&self) -> Result<OpReport, DeployError>;

    /// 清理部署产物（尽力而为）
    async fn cleanup(&self) -> Result<OpReport, DeployError>;
}

/// 按部署方式创建后端
pub fn create_backend(config: &DeploymentConfig) -> Arc<dyn DeploymentBackend> {
    match config.method() {
        DeployMethod::Docker => Arc::new(DockerBackend::new(config.clone())),
        DeployMethod::Systemd => Arc::new(SystemdBackend::new(config.clone())),
        DeployMethod::Standalone => Arc::new(StandaloneBackend::new(config.clone())),
    }
}

/// 各后端共用的健康验证
pub(crate) async fn verify_health(config: &DeploymentConfig) -> Result<OpReport, DeployError> {
    let client = ServiceClient::new(config)?;
    let timeouts = config.timeouts();
    match client
        .wait_until_healthy(
            Duration::from_secs(timeouts.health_timeout_secs),
            Duration::from_millis(timeouts.health_interval_ms),
        )
        .await
    {
        Ok(_) => Ok(OpReport::ok()),
        // 超时属于预期内的失败，交由调用方按普通失败处理
        Err(e @ DeployError::Timeout { .. }) => Ok(OpReport::failed(e.to_string())),
        Err(e) => Err(e),
    }
}

/// 执行命令并转换为 OpReport：非零退出为无效结果，无法启动或超时为故障
pub(crate) async fn command_report(
    program: &str,
    args: &[&str],
    timeout: Duration,
    what: &str,
) -> Result<OpReport, DeployError> {
    let output = CommandRunner::run(program, args, timeout).await?;
    if output.success() {
        Ok(OpReport::ok())
    } else {
        Ok(OpReport::failed(output.failure_message(what)))
    }
}

/// 尽力而为地执行命令，失败只记为警告
pub(crate) async fn best_effort(
    report: &mut OpReport,
    program: &str,
    args: &[&str],
    timeout: Duration,
    what: &str,
) {
    match CommandRunner::run(program, args, timeout).await {
        Ok(output) if output.success() => {}
        Ok(output) => {
            let msg = output.failure_message(what);
            tracing::warn!(program = %program, "{}", msg);
            report.warn(msg);
        }
        Err(e) => {
            tracing::warn!(program = %program, error = %e, "Best-effort command failed");
            report.warn(format!("{}: {}", what, e));
        }
    }
}

/// 写入服务环境变量文件（权限 0600）
pub(crate) async fn write_env_file(config: &DeploymentConfig) -> Result<PathBuf, DeployError> {
    let path = config.env_file_path();
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut content = String::from("# Generated by tokenizer-deploy\n");
    for (key, value) in config.service_environment() {
        content.push_str(&format!("{}={}\n", key, value));
    }
    tokio::fs::write(&path, content).await?;
    restrict_permissions(&path).await;

    tracing::info!(path = %path.display(), "Wrote service environment file");
    Ok(path)
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await {
        tracing::warn!(path = %path.display(), error = %e, "Failed to restrict file permissions");
    }
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) {}

/// 尽力删除文件，不存在不算失败
pub(crate) async fn remove_file_best_effort(report: &mut OpReport, path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => report.warn(format!("failed to remove {}: {}", path.display(), e)),
    }
}

/// 服务启动参数
pub(crate) fn service_args(config: &DeploymentConfig) -> Vec<String> {
    let service = config.service();
    let mut args = vec![
        "--host".to_string(),
        service.host.clone(),
        "--port".to_string(),
        service.port.to_string(),
        "--workers".to_string(),
        service.workers.to_string(),
    ];
    args.extend(service.args.iter().cloned());
    args
}

/// 命令超时
pub(crate) fn command_timeout(config: &DeploymentConfig) -> Duration {
    Duration::from_secs(config.timeouts().command_timeout_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsConfig;

    #[tokio::test]
    async fn test_write_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = DeploymentConfig::builder()
            .paths(PathsConfig::under(dir.path()))
            .build()
            .unwrap();

        let path = write_env_file(&config).await.unwrap();
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.contains("TOKENIZER_PORT=8000"));
        assert!(content.contains("SEARCH_ENGINE_URL=http://localhost:9200"));
    }

    #[tokio::test]
    async fn test_command_report_non_zero_is_invalid() {
        let report = command_report("false", &[], Duration::from_secs(5), "false")
            .await
            .unwrap();
        assert!(!report.is_valid());
    }

    #[tokio::test]
    async fn test_best_effort_only_warns() {
        let mut report = OpReport::ok();
        best_effort(
            &mut report,
            "nonexistent_command_12345",
            &[],
            Duration::from_secs(5),
            "stop",
        )
        .await;
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn test_factory_selects_backend() {
        for method in [DeployMethod::Docker, DeployMethod::Systemd, DeployMethod::Standalone] {
            let config = DeploymentConfig::builder().method(method).build().unwrap();
            assert_eq!(create_backend(&config).method(), method);
        }
    }
}
