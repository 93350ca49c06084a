//! 部署前综合校验
//!
//! [`ValidationCollaborator`] 给出整体结论（PASSED / WARNING / FAILED）。
//! [`SystemValidator`] 的四类检查相互独立，并发执行：
//! - system: 内存、磁盘
//! - paths: 目录可写
//! - network: 服务端口可绑定
//! - connectivity: 搜索引擎可达

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::{Disks, MemoryRefreshKind, RefreshKind, System};
use tracing::{debug, info};

use crate::config::DeploymentConfig;
use crate::domain::validation::{CategoryResult, CheckResult, ValidationReport};
use crate::infra::SearchEngineClient;

/// 数据目录所在磁盘的最低剩余空间 (MB)
const MIN_FREE_DISK_MB: u64 = 1024;

const MB: u64 = 1024 * 1024;

/// 校验协作者
#[async_trait]
pub trait ValidationCollaborator: Send + Sync {
    /// 执行全部检查并汇总，不返回错误：探测失败本身就是检查结论
    async fn run_comprehensive_validation(&self, config: &DeploymentConfig) -> ValidationReport;
}

/// 基于本机状态的默认实现
#[derive(Default)]
pub struct SystemValidator;

impl SystemValidator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ValidationCollaborator for SystemValidator {
    async fn run_comprehensive_validation(&self, config: &DeploymentConfig) -> ValidationReport {
        let (system, paths, network, connectivity) = tokio::join!(
            check_system(config),
            check_paths(config),
            check_network(config),
            check_connectivity(config),
        );

        let report = ValidationReport::from_categories(vec![system, paths, network, connectivity]);
        info!(
            overall = ?report.overall_status,
            failed = report.failed_checks().len(),
            warnings = report.warnings().len(),
            "Comprehensive validation finished"
        );
        report
    }
}

async fn check_system(config: &DeploymentConfig) -> CategoryResult {
    let memory_mb = config.limits().memory_mb;
    let data_dir = config.paths().data_dir.clone();

    // sysinfo 的刷新是同步调用
    let snapshot = tokio::task::spawn_blocking(move || {
        let sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        let disks = Disks::new_with_refreshed_list();
        let anchor = existing_ancestor(&data_dir);
        let free_disk = disks
            .iter()
            .filter(|d| anchor.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space());
        (sys.total_memory(), sys.available_memory(), free_disk)
    })
    .await;

    let mut checks = Vec::new();
    match snapshot {
        Ok((total, available, free_disk)) => {
            let required = memory_mb * MB;
            if total > 0 && total < required {
                checks.push(CheckResult::failed(
                    "system",
                    "memory",
                    format!(
                        "total memory {} MB is below the configured limit {} MB",
                        total / MB,
                        memory_mb
                    ),
                ));
            } else if available < required {
                checks.push(CheckResult::warning(
                    "system",
                    "memory",
                    format!(
                        "available memory {} MB is below the configured limit {} MB",
                        available / MB,
                        memory_mb
                    ),
                ));
            } else {
                checks.push(CheckResult::passed(
                    "system",
                    "memory",
                    format!("{} MB available", available / MB),
                ));
            }

            match free_disk {
                Some(bytes) if bytes < MIN_FREE_DISK_MB * MB => checks.push(CheckResult::warning(
                    "system",
                    "disk",
                    format!("only {} MB free under data directory", bytes / MB),
                )),
                Some(bytes) => checks.push(CheckResult::passed(
                    "system",
                    "disk",
                    format!("{} MB free", bytes / MB),
                )),
                None => checks.push(CheckResult::warning(
                    "system",
                    "disk",
                    "could not determine free disk space",
                )),
            }
        }
        Err(e) => checks.push(CheckResult::warning(
            "system",
            "resources",
            format!("resource probe failed: {}", e),
        )),
    }

    CategoryResult {
        category: "system".into(),
        checks,
    }
}

async fn check_paths(config: &DeploymentConfig) -> CategoryResult {
    let mut checks = Vec::new();
    for (name, path) in config.paths().all() {
        let target = existing_ancestor(path);
        let check = match probe_writable(&target).await {
            Ok(()) if target == path => {
                CheckResult::passed("paths", name, format!("{} is writable", path.display()))
            }
            Ok(()) => CheckResult::passed(
                "paths",
                name,
                format!("{} can be created under {}", path.display(), target.display()),
            ),
            Err(e) => CheckResult::failed(
                "paths",
                name,
                format!("{} is not writable: {}", target.display(), e),
            ),
        };
        checks.push(check);
    }
    CategoryResult {
        category: "paths".into(),
        checks,
    }
}

async fn check_network(config: &DeploymentConfig) -> CategoryResult {
    let service = config.service();
    let addr = format!("{}:{}", service.host, service.port);

    let check = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => {
            drop(listener);
            CheckResult::passed("network", "service_port", format!("{} is available", addr))
        }
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => CheckResult::warning(
            "network",
            "service_port",
            format!("{} is in use (service may already be running)", addr),
        ),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => CheckResult::warning(
            "network",
            "service_port",
            format!("binding {} needs elevated privileges: {}", addr, e),
        ),
        Err(e) => CheckResult::failed(
            "network",
            "service_port",
            format!("cannot bind {}: {}", addr, e),
        ),
    };

    CategoryResult {
        category: "network".into(),
        checks: vec![check],
    }
}

async fn check_connectivity(config: &DeploymentConfig) -> CategoryResult {
    let timeout = Duration::from_secs(config.timeouts().probe_timeout_secs);
    let check = match SearchEngineClient::new(config.search_engine(), timeout) {
        Ok(client) => match client.ping().await {
            Ok(status) if status == 401 || status == 403 => CheckResult::warning(
                "connectivity",
                "search_engine",
                format!("{} reachable but rejected credentials ({})", client.base_url(), status),
            ),
            Ok(status) => CheckResult::passed(
                "connectivity",
                "search_engine",
                format!("{} reachable ({})", client.base_url(), status),
            ),
            Err(e) => CheckResult::failed("connectivity", "search_engine", e.to_string()),
        },
        Err(e) => CheckResult::failed("connectivity", "search_engine", e.to_string()),
    };

    CategoryResult {
        category: "connectivity".into(),
        checks: vec![check],
    }
}

/// 路径本身或最近的已存在祖先目录
fn existing_ancestor(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|p| p.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// 写入并删除探测文件
async fn probe_writable(dir: &Path) -> std::io::Result<()> {
    let probe = dir.join(format!(".tokenizer-deploy-probe-{}", std::process::id()));
    tokio::fs::write(&probe, b"probe").await?;
    debug!(path = %probe.display(), "Write probe succeeded");
    tokio::fs::remove_file(&probe).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PathsConfig, SearchEngineConfig};
    use crate::domain::validation::ValidationStatus;

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_paths_under_tempdir_pass() {
        let dir = tempfile::tempdir().unwrap();
        let config = DeploymentConfig::builder()
            .paths(PathsConfig::under(dir.path().join("not-yet-created")))
            .build()
            .unwrap();

        let result = check_paths(&config).await;
        assert_eq!(result.checks.len(), 4);
        assert_eq!(result.status(), ValidationStatus::Passed);
    }

    #[tokio::test]
    async fn test_port_in_use_is_warning() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut service = crate::config::ServiceConfig::default();
        service.host = "127.0.0.1".into();
        service.port = port;
        let config = DeploymentConfig::builder().service(service).build().unwrap();

        let result = check_network(&config).await;
        assert_eq!(result.status(), ValidationStatus::Warning);
    }

    #[tokio::test]
    async fn test_unreachable_search_engine_fails() {
        let mut engine = SearchEngineConfig::default();
        engine.host = "127.0.0.1".into();
        engine.port = closed_port();
        let config = DeploymentConfig::builder()
            .search_engine(engine)
            .build()
            .unwrap();

        let result = check_connectivity(&config).await;
        assert_eq!(result.status(), ValidationStatus::Failed);
    }

    #[test]
    fn test_existing_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let deep = dir.path().join("a/b/c");
        assert_eq!(existing_ancestor(&deep), dir.path());
    }
}
