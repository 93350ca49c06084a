//! 配置语义校验（validate_configuration 步骤）
//!
//! 结构合法性已由 `DeploymentConfigBuilder::build` 保证，这里只检查与主机相关的部分。

use async_trait::async_trait;

use crate::config::DeploymentConfig;
use crate::domain::deploy::{DeployMethod, OpReport};
use crate::error::DeployError;

/// 配置校验器
#[async_trait]
pub trait ConfigurationValidator: Send + Sync {
    async fn validate_configuration(&self, config: &DeploymentConfig) -> Result<OpReport, DeployError>;
}

/// 默认实现：目录存在且可写、端口与安全选项合理
#[derive(Default)]
pub struct PathConfigValidator;

impl PathConfigValidator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConfigurationValidator for PathConfigValidator {
    async fn validate_configuration(&self, config: &DeploymentConfig) -> Result<OpReport, DeployError> {
        let mut report = OpReport::ok();

        for (name, path) in config.paths().all() {
            match tokio::fs::metadata(path).await {
                Ok(meta) if !meta.is_dir() => {
                    report.error(format!("{} ({}) is not a directory", name, path.display()));
                }
                Ok(meta) if meta.permissions().readonly() => {
                    report.error(format!("{} ({}) is read-only", name, path.display()));
                }
                Ok(_) => {}
                Err(e) => {
                    report.error(format!("{} ({}) is not accessible: {}", name, path.display(), e));
                }
            }
        }

        let service = config.service();
        if service.port < 1024 && config.method() != DeployMethod::Systemd {
            report.warn(format!(
                "port {} is privileged; binding may require root",
                service.port
            ));
        }
        if config.security().api_key.is_none() {
            report.warn("no API key configured; the service accepts unauthenticated requests");
        }
        if config.search_engine().scheme == "https" && !config.search_engine().verify_certs {
            report.warn("search engine certificate verification is disabled");
        }
        if service.workers > config.limits().max_concurrency {
            report.warn(format!(
                "workers ({}) exceed max concurrency ({})",
                service.workers,
                config.limits().max_concurrency
            ));
        }

        Ok(report)
    }
}
