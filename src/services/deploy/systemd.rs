//! systemd deployment backend
//!
//! Installs the tokenizer API as a system unit running under a dedicated user.
//! Requires root.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::config::DeploymentConfig;
use crate::domain::deploy::{DeployMethod, OpReport};
use crate::error::DeployError;
use crate::infra::CommandRunner;

use super::{
    best_effort, command_report, command_timeout, remove_file_best_effort, service_args,
    verify_health, write_env_file, DeploymentBackend,
};

const QUICK: Duration = Duration::from_secs(30);

/// Init-system backend
pub struct SystemdBackend {
    config: DeploymentConfig,
}

impl SystemdBackend {
    pub fn new(config: DeploymentConfig) -> Self {
        Self { config }
    }

    fn unit_name(&self) -> String {
        format!("{}.service", self.config.service().name)
    }

    fn unit_path(&self) -> PathBuf {
        self.config.service().unit_dir.join(self.unit_name())
    }

    async fn is_active(&self) -> bool {
        CommandRunner::run("systemctl", &["is-active", "--quiet", &self.unit_name()], QUICK)
            .await
            .map(|o| o.success())
            .unwrap_or(false)
    }
}

/// Render the unit file
pub fn render_unit(config: &DeploymentConfig) -> String {
    let service = config.service();
    let limits = config.limits();
    let paths = config.paths();

    let exec_start = std::iter::once(service.executable.clone())
        .chain(service_args(config))
        .collect::<Vec<_>>()
        .join(" ");

    let mut unit = format!(
        "[Unit]\n\
         Description=Tokenizer API ({name})\n\
         After=network-online.target\n\
         Wants=network-online.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         User={user}\n\
         Group={user}\n\
         WorkingDirectory={workdir}\n\
         EnvironmentFile={env_file}\n\
         ExecStart={exec_start}\n\
         Restart=on-failure\n\
         RestartSec=5\n\
         MemoryMax={memory}M\n\
         CPUQuota={cpu}%\n\
         LimitNOFILE=65536\n\
         StandardOutput=append:{log_dir}/{name}.log\n\
         StandardError=append:{log_dir}/{name}.err.log\n",
        name = service.name,
        user = service.user,
        workdir = paths.install_dir.display(),
        env_file = config.env_file_path().display(),
        exec_start = exec_start,
        memory = limits.memory_mb,
        cpu = (limits.cpu_cores * 100.0).round() as u64,
        log_dir = paths.log_dir.display(),
    );

    if config.security().run_as_non_root {
        unit.push_str("NoNewPrivileges=true\nProtectSystem=full\nPrivateTmp=true\n");
    }
    unit.push_str(&format!(
        "ReadWritePaths={} {}\n\n[Install]\nWantedBy=multi-user.target\n",
        paths.data_dir.display(),
        paths.log_dir.display()
    ));
    unit
}

async fn ensure_user(user: &str, home: &Path, timeout: Duration) -> Result<OpReport, DeployError> {
    let exists = CommandRunner::run("id", &["-u", user], QUICK)
        .await
        .map(|o| o.success())
        .unwrap_or(false);
    if exists {
        return Ok(OpReport::ok().with_warning(format!("system user {} already exists", user)));
    }

    let home = home.display().to_string();
    command_report(
        "useradd",
        &["--system", "--home-dir", &home, "--no-create-home", "--shell", "/usr/sbin/nologin", user],
        timeout,
        &format!("useradd {}", user),
    )
    .await
}

#[async_trait]
impl DeploymentBackend for SystemdBackend {
    fn method(&self) -> DeployMethod {
        DeployMethod::Systemd
    }

    async fn validate_requirements(&self) -> Result<OpReport, DeployError> {
        let mut report = OpReport::ok();

        if !CommandRunner::is_root().await {
            report.error("root privileges required for systemd deployment (permission denied)");
        }
        if !CommandRunner::exists("systemctl").await {
            report.error("systemctl not found; systemd is not available on this host");
        }
        if !Path::new(&self.config.service().executable).exists() {
            report.warn(format!(
                "executable {} does not exist yet",
                self.config.service().executable
            ));
        }
        Ok(report)
    }

    async fn install_dependencies(&self) -> Result<OpReport, DeployError> {
        let service = self.config.service();
        let paths = self.config.paths();
        let timeout = command_timeout(&self.config);

        let mut report = ensure_user(&service.user, &paths.install_dir, timeout).await?;
        if !report.is_valid() {
            return Ok(report);
        }

        let owner = format!("{}:{}", service.user, service.user);
        for dir in [&paths.data_dir, &paths.log_dir] {
            let dir = dir.display().to_string();
            report.merge(
                command_report("chown", &["-R", &owner, &dir], timeout, &format!("chown {}", dir))
                    .await?,
            );
        }
        Ok(report)
    }

    async fn configure_service(&self, config: &DeploymentConfig) -> Result<OpReport, DeployError> {
        if !Path::new(&config.service().executable).exists() {
            return Ok(OpReport::failed(format!(
                "executable {} not found",
                config.service().executable
            )));
        }

        write_env_file(config).await?;

        let unit_path = self.unit_path();
        if let Some(parent) = unit_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&unit_path, render_unit(config)).await?;
        info!(unit = %unit_path.display(), "Wrote systemd unit");

        command_report("systemctl", &["daemon-reload"], QUICK, "systemctl daemon-reload").await
    }

    async fn start_service(&self) -> Result<OpReport, DeployError> {
        if self.is_active().await {
            return Ok(OpReport::ok().with_warning(format!("{} already active", self.unit_name())));
        }

        let unit = self.unit_name();
        let mut report = command_report("systemctl", &["enable", &unit], QUICK, "systemctl enable").await?;
        if !report.is_valid() {
            return Ok(report);
        }
        report.merge(
            command_report(
                "systemctl",
                &["start", &unit],
                command_timeout(&self.config),
                "systemctl start",
            )
            .await?,
        );
        Ok(report)
    }

    async fn verify_deployment(&self) -> Result<OpReport, DeployError> {
        let mut report = verify_health(&self.config).await?;
        if !report.is_valid() && !self.is_active().await {
            report.error(format!("{} is not active", self.unit_name()));
        }
        Ok(report)
    }

    async fn stop_service(&self) -> Result<OpReport, DeployError> {
        let mut report = OpReport::ok();
        best_effort(&mut report, "systemctl", &["stop", &self.unit_name()], QUICK, "systemctl stop").await;
        Ok(report)
    }

    async fn cleanup(&self) -> Result<OpReport, DeployError> {
        let mut report = OpReport::ok();
        let unit = self.unit_name();
        best_effort(&mut report, "systemctl", &["disable", &unit], QUICK, "systemctl disable").await;
        remove_file_best_effort(&mut report, &self.unit_path()).await;
        best_effort(&mut report, "systemctl", &["daemon-reload"], QUICK, "systemctl daemon-reload").await;
        remove_file_best_effort(&mut report, &self.config.env_file_path()).await;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PathsConfig, ResourceLimits};

    #[test]
    fn test_render_unit() {
        let config = DeploymentConfig::builder()
            .method(DeployMethod::Systemd)
            .paths(PathsConfig::under("/srv/tok"))
            .limits(ResourceLimits {
                memory_mb: 1024,
                cpu_cores: 1.5,
                max_concurrency: 8,
            })
            .build()
            .unwrap();

        let unit = render_unit(&config);
        assert!(unit.contains("User=tokenizer"));
        assert!(unit.contains("MemoryMax=1024M"));
        assert!(unit.contains("CPUQuota=150%"));
        assert!(unit.contains("EnvironmentFile=/srv/tok/config/tokenizer.env"));
        assert!(unit.contains(
            "ExecStart=/opt/tokenizer-api/bin/tokenizer-api --host 0.0.0.0 --port 8000 --workers 4"
        ));
        assert!(unit.contains("NoNewPrivileges=true"));
        assert!(unit.ends_with("WantedBy=multi-user.target\n"));
    }

    #[test]
    fn test_unit_path() {
        let config = DeploymentConfig::builder()
            .method(DeployMethod::Systemd)
            .build()
            .unwrap();
        let backend = SystemdBackend::new(config);
        assert_eq!(
            backend.unit_path(),
            PathBuf::from("/etc/systemd/system/tokenizer-api.service")
        );
    }
}
