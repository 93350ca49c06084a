//! 独立进程部署后端
//!
//! 直接拉起服务可执行文件，PID 写入数据目录，输出追加到日志目录。
//! 本进程退出后服务继续运行，后续的 stop/cleanup 通过 PID 文件找到它。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::DeploymentConfig;
use crate::domain::deploy::{DeployMethod, OpReport};
use crate::error::DeployError;
use crate::infra::CommandRunner;

use super::{
    command_timeout, remove_file_best_effort, service_args, verify_health, write_env_file,
    DeploymentBackend,
};

const QUICK: Duration = Duration::from_secs(10);

/// 启动后短暂观察，捕获立即退出的情况
const STARTUP_GRACE: Duration = Duration::from_millis(500);

/// 独立进程后端
pub struct StandaloneBackend {
    config: DeploymentConfig,
    child: Mutex<Option<Child>>,
    started_at: RwLock<Option<DateTime<Utc>>>,
}

impl StandaloneBackend {
    pub fn new(config: DeploymentConfig) -> Self {
        Self {
            config,
            child: Mutex::new(None),
            started_at: RwLock::new(None),
        }
    }

    fn pid_file(&self) -> PathBuf {
        self.config
            .paths()
            .data_dir
            .join(format!("{}.pid", self.config.service().name))
    }

    fn log_file(&self) -> PathBuf {
        self.config
            .paths()
            .log_dir
            .join(format!("{}.log", self.config.service().name))
    }

    pub async fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.read().await
    }

    async fn read_pid(&self) -> Option<u32> {
        let raw = tokio::fs::read_to_string(self.pid_file()).await.ok()?;
        raw.trim().parse().ok()
    }

    async fn pid_alive(pid: u32) -> bool {
        CommandRunner::run("kill", &["-0", &pid.to_string()], QUICK)
            .await
            .map(|o| o.success())
            .unwrap_or(false)
    }

    /// 当前运行中的 PID（自己持有的子进程优先，其次 PID 文件）
    async fn running_pid(&self) -> Option<u32> {
        {
            let mut guard = self.child.lock().await;
            if let Some(child) = guard.as_mut() {
                match child.try_wait() {
                    Ok(None) => return child.id(),
                    Ok(Some(status)) => {
                        warn!(status = %status, "Service process exited");
                        *guard = None;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to query service process status");
                        return child.id();
                    }
                }
            }
        }

        let pid = self.read_pid().await?;
        Self::pid_alive(pid).await.then_some(pid)
    }

    async fn open_log(&self) -> Result<std::fs::File, DeployError> {
        let path = self.log_file();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(file.into_std().await)
    }
}

fn executable_available(executable: &str) -> bool {
    Path::new(executable).is_file()
}

#[async_trait]
impl DeploymentBackend for StandaloneBackend {
    fn method(&self) -> DeployMethod {
        DeployMethod::Standalone
    }

    async fn validate_requirements(&self) -> Result<OpReport, DeployError> {
        let mut report = OpReport::ok();
        let executable = &self.config.service().executable;

        if !executable_available(executable) && !CommandRunner::exists(executable).await {
            report.error(format!("executable {} not found", executable));
        }
        if self.config.security().run_as_non_root && CommandRunner::is_root().await {
            report.warn("running as root while run_as_non_root is set; the service inherits root");
        }
        Ok(report)
    }

    async fn install_dependencies(&self) -> Result<OpReport, DeployError> {
        let Some(ref install) = self.config.service().install_command else {
            return Ok(OpReport::ok());
        };

        let install_dir = &self.config.paths().install_dir;
        tokio::fs::create_dir_all(install_dir).await?;
        info!(command = %install, dir = %install_dir.display(), "Running install command");

        let output = CommandRunner::run_shell(
            install,
            Some(install_dir),
            &self.config.service_environment(),
            command_timeout(&self.config),
        )
        .await?;
        if output.success() {
            Ok(OpReport::ok())
        } else {
            Ok(OpReport::failed(output.failure_message("install command")))
        }
    }

    async fn configure_service(&self, config: &DeploymentConfig) -> Result<OpReport, DeployError> {
        write_env_file(config).await?;
        Ok(OpReport::ok())
    }

    async fn start_service(&self) -> Result<OpReport, DeployError> {
        if let Some(pid) = self.running_pid().await {
            return Ok(OpReport::ok().with_warning(format!("service already running (pid {})", pid)));
        }

        let service = self.config.service();
        let log = self.open_log().await?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&service.executable);
        cmd.args(service_args(&self.config))
            .current_dir(&self.config.paths().install_dir)
            .envs(self.config.service_environment())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Ok(OpReport::failed(format!(
                    "failed to start {}: {}",
                    service.executable, e
                )))
            }
        };

        sleep(STARTUP_GRACE).await;
        if let Ok(Some(status)) = child.try_wait() {
            return Ok(OpReport::failed(format!(
                "service exited immediately ({}), see {}",
                status,
                self.log_file().display()
            )));
        }

        let mut report = OpReport::ok();
        match child.id() {
            Some(pid) => {
                if let Err(e) = tokio::fs::write(self.pid_file(), pid.to_string()).await {
                    report.warn(format!("failed to write pid file: {}", e));
                }
                info!(pid = pid, log = %self.log_file().display(), "Service process started");
            }
            None => report.warn("service process id unavailable"),
        }

        *self.child.lock().await = Some(child);
        *self.started_at.write().await = Some(Utc::now());
        Ok(report)
    }

    async fn verify_deployment(&self) -> Result<OpReport, DeployError> {
        let mut report = verify_health(&self.config).await?;
        if !report.is_valid() && self.running_pid().await.is_none() {
            report.error(format!(
                "service process is not running, see {}",
                self.log_file().display()
            ));
        }
        Ok(report)
    }

    async fn stop_service(&self) -> Result<OpReport, DeployError> {
        let mut report = OpReport::ok();

        let owned = self.child.lock().await.take();
        if let Some(mut child) = owned {
            if let Err(e) = child.kill().await {
                report.warn(format!("failed to kill service process: {}", e));
            }
        } else if let Some(pid) = self.read_pid().await {
            if Self::pid_alive(pid).await {
                match CommandRunner::run("kill", &["-TERM", &pid.to_string()], QUICK).await {
                    Ok(o) if o.success() => info!(pid = pid, "Sent SIGTERM to service"),
                    Ok(o) => report.warn(o.failure_message("kill")),
                    Err(e) => report.warn(format!("kill {}: {}", pid, e)),
                }
            }
        } else {
            report.warn("no running service process found");
        }

        remove_file_best_effort(&mut report, &self.pid_file()).await;
        *self.started_at.write().await = None;
        Ok(report)
    }

    async fn cleanup(&self) -> Result<OpReport, DeployError> {
        let mut report = OpReport::ok();
        remove_file_best_effort(&mut report, &self.pid_file()).await;
        remove_file_best_effort(&mut report, &self.config.env_file_path()).await;
        Ok(report)
    }
}
