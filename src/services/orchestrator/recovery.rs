//! 恢复策略
//!
//! 每种错误分类对应一个策略，每次失败只尝试一次。策略只返回是否恢复，不返回错误。
//! 恢复成功不代表本次尝试成功，重试由调用方决定。

use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::domain::orchestration::ErrorCategory;
use crate::infra::{CommandRunner, SearchEngineClient, ServiceClient};
use crate::services::config_check::{ConfigurationValidator, PathConfigValidator};

use super::Orchestrator;

impl Orchestrator {
    pub(super) async fn recover(&self, category: ErrorCategory) -> bool {
        info!(category = %category, "Attempting recovery");
        let recovered = match category {
            ErrorCategory::ConnectionTimeout => self.recover_connection().await,
            ErrorCategory::PermissionDenied => self.recover_permissions().await,
            ErrorCategory::ResourceExhausted => self.recover_resources().await,
            ErrorCategory::ServiceUnavailable => self.recover_service().await,
            ErrorCategory::ConfigurationInvalid => self.recover_configuration().await,
            ErrorCategory::DeploymentFailed => self.recover_deployment().await,
            ErrorCategory::Unknown => {
                warn!("No recovery strategy for unclassified error");
                false
            }
        };
        info!(category = %category, recovered = recovered, "Recovery finished");
        recovered
    }

    /// 退避后重新探测搜索引擎
    async fn recover_connection(&self) -> bool {
        let config = self.config().await;
        sleep(Duration::from_millis(config.recovery().connection_backoff_ms)).await;

        let timeout = Duration::from_secs(config.timeouts().probe_timeout_secs);
        let client = match SearchEngineClient::new(config.search_engine(), timeout) {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "Cannot build search engine client");
                return false;
            }
        };
        match client.ping().await {
            Ok(status) => {
                info!(url = %client.base_url(), status = status, "Search engine reachable again");
                true
            }
            Err(e) => {
                warn!(error = %e, "Search engine still unreachable");
                false
            }
        }
    }

    /// 需要特权的后端缺少特权时不可恢复，否则放宽目录权限
    async fn recover_permissions(&self) -> bool {
        let config = self.config().await;
        if config.method().requires_privilege() && !CommandRunner::is_root().await {
            warn!(method = %config.method(), "Insufficient privilege, not recoverable");
            return false;
        }

        let mut relaxed = true;
        for (name, path) in config.paths().all() {
            if !path.exists() {
                continue;
            }
            if let Err(e) = relax_permissions(path).await {
                warn!(dir = name, path = %path.display(), error = %e, "Failed to relax permissions");
                relaxed = false;
            }
        }
        relaxed
    }

    /// 缩减内存与并发上限，本次尝试不重试
    async fn recover_resources(&self) -> bool {
        let mut config = self.config.write().await;
        let reduced = config.with_reduced_limits();
        info!(
            memory_mb = reduced.limits().memory_mb,
            max_concurrency = reduced.limits().max_concurrency,
            workers = reduced.service().workers,
            "Reduced resource limits for next attempt"
        );
        *config = reduced;
        true
    }

    /// 较长退避后重新探测服务存活
    async fn recover_service(&self) -> bool {
        let config = self.config().await;
        sleep(Duration::from_millis(config.recovery().service_backoff_ms)).await;

        let client = match ServiceClient::new(&config) {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "Cannot build service client");
                return false;
            }
        };
        match client.liveness().await {
            Ok(outcome) if outcome.healthy => true,
            Ok(outcome) => {
                warn!(status = outcome.status, "Service still unhealthy");
                false
            }
            Err(e) => {
                warn!(error = %e, "Service still unavailable");
                false
            }
        }
    }

    /// 补建缺失目录后重新校验配置
    async fn recover_configuration(&self) -> bool {
        let config = self.config().await;
        for (name, path) in config.paths().all() {
            if let Err(e) = tokio::fs::create_dir_all(path).await {
                warn!(dir = name, path = %path.display(), error = %e, "Failed to create directory");
                return false;
            }
        }

        match PathConfigValidator::new().validate_configuration(&config).await {
            Ok(report) if report.is_valid() => true,
            Ok(report) => {
                warn!(errors = ?report.errors, "Configuration still invalid");
                false
            }
            Err(e) => {
                warn!(error = %e, "Configuration re-validation failed");
                false
            }
        }
    }

    /// 部署失败需要人工介入：完整清理后退避，始终返回未恢复
    async fn recover_deployment(&self) -> bool {
        self.cleanup().await;
        let backoff = self.config().await.recovery().deployment_backoff_ms;
        sleep(Duration::from_millis(backoff)).await;
        false
    }
}

#[cfg(unix)]
async fn relax_permissions(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn relax_permissions(_path: &std::path::Path) -> std::io::Result<()> {
    Ok(())
}
