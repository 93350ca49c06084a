//! Docker deployment backend
//!
//! Runs the tokenizer API as a single detached container with resource limits
//! applied as runtime flags.

use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

use crate::config::DeploymentConfig;
use crate::domain::deploy::{DeployMethod, OpReport};
use crate::error::DeployError;
use crate::infra::CommandRunner;

use super::{
    best_effort, command_report, command_timeout, remove_file_best_effort, verify_health,
    write_env_file, DeploymentBackend,
};

const QUICK: Duration = Duration::from_secs(30);

/// Container runtime backend
pub struct DockerBackend {
    config: DeploymentConfig,
}

impl DockerBackend {
    pub fn new(config: DeploymentConfig) -> Self {
        Self { config }
    }

    fn container_name(&self) -> &str {
        &self.config.service().name
    }

    /// Container state: `Some(true)` running, `Some(false)` exists but stopped, `None` absent
    async fn container_state(&self) -> Option<bool> {
        let output = CommandRunner::run(
            "docker",
            &["inspect", "-f", "{{.State.Running}}", self.container_name()],
            QUICK,
        )
        .await
        .ok()?;
        if !output.success() {
            return None;
        }
        Some(output.stdout.trim() == "true")
    }

    /// Build `docker run` arguments
    fn run_args(&self) -> Vec<String> {
        let config = &self.config;
        let service = config.service();
        let limits = config.limits();
        let paths = config.paths();

        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            service.name.clone(),
            "--restart".to_string(),
            "unless-stopped".to_string(),
            "-p".to_string(),
            format!("{}:{}", service.port, service.port),
            "--env-file".to_string(),
            config.env_file_path().display().to_string(),
            "--memory".to_string(),
            format!("{}m", limits.memory_mb),
            "--cpus".to_string(),
            format!("{}", limits.cpu_cores),
            "-v".to_string(),
            format!("{}:/data", paths.data_dir.display()),
            "-v".to_string(),
            format!("{}:/logs", paths.log_dir.display()),
        ];
        if config.security().run_as_non_root {
            args.push("--security-opt".to_string());
            args.push("no-new-privileges".to_string());
        }
        args.push(service.image.clone());
        args
    }
}

#[async_trait]
impl DeploymentBackend for DockerBackend {
    fn method(&self) -> DeployMethod {
        DeployMethod::Docker
    }

    async fn validate_requirements(&self) -> Result<OpReport, DeployError> {
        if !CommandRunner::exists("docker").await {
            return Ok(OpReport::failed("docker runtime not found in PATH"));
        }

        let mut report = command_report("docker", &["--version"], QUICK, "docker --version").await?;
        if !report.is_valid() {
            return Ok(report);
        }

        // Daemon must be reachable, not just the CLI
        let info = CommandRunner::run("docker", &["info", "--format", "{{.ServerVersion}}"], QUICK).await?;
        if !info.success() {
            report.error(format!(
                "docker daemon unavailable: {}",
                info.stderr.trim()
            ));
        } else {
            info!(server_version = %info.stdout.trim(), "Docker daemon reachable");
        }
        Ok(report)
    }

    async fn install_dependencies(&self) -> Result<OpReport, DeployError> {
        let image = &self.config.service().image;

        let present = CommandRunner::run("docker", &["image", "inspect", image], QUICK)
            .await
            .map(|o| o.success())
            .unwrap_or(false);

        info!(image = %image, present = present, "Pulling image");
        let report = command_report(
            "docker",
            &["pull", image],
            command_timeout(&self.config),
            &format!("docker pull {}", image),
        )
        .await?;

        // A local image is good enough when the registry is unreachable
        if !report.is_valid() && present {
            let mut fallback = OpReport::ok();
            for e in report.errors {
                fallback.warn(format!("using local image: {}", e));
            }
            return Ok(fallback);
        }
        Ok(report)
    }

    async fn configure_service(&self, config: &DeploymentConfig) -> Result<OpReport, DeployError> {
        let path = write_env_file(config).await?;
        let mut report = OpReport::ok();
        if config.security().tls_enabled {
            report.warn("TLS termination is expected in front of the container");
        }
        info!(env_file = %path.display(), "Docker service configured");
        Ok(report)
    }

    async fn start_service(&self) -> Result<OpReport, DeployError> {
        let mut report = OpReport::ok();

        match self.container_state().await {
            Some(true) => {
                return Ok(report.with_warning(format!(
                    "container {} already running",
                    self.container_name()
                )));
            }
            Some(false) => {
                // Stale stopped container blocks `docker run --name`
                best_effort(
                    &mut report,
                    "docker",
                    &["rm", self.container_name()],
                    QUICK,
                    "docker rm (stale container)",
                )
                .await;
            }
            None => {}
        }

        let args = self.run_args();
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let run = command_report("docker", &arg_refs, command_timeout(&self.config), "docker run").await?;
        report.merge(run);
        if report.is_valid() {
            info!(container = %self.container_name(), "Container started");
        }
        Ok(report)
    }

    async fn verify_deployment(&self) -> Result<OpReport, DeployError> {
        let mut report = verify_health(&self.config).await?;
        if !report.is_valid() {
            // Attach the tail of the container log to help diagnose
            if let Ok(logs) = CommandRunner::run(
                "docker",
                &["logs", "--tail", "20", self.container_name()],
                QUICK,
            )
            .await
            {
                let tail = format!("{}{}", logs.stdout, logs.stderr);
                if !tail.trim().is_empty() {
                    report.warn(format!("container logs:\n{}", tail.trim()));
                }
            }
        }
        Ok(report)
    }

    async fn stop_service(&self) -> Result<OpReport, DeployError> {
        let mut report = OpReport::ok();
        if self.container_state().await.is_none() {
            return Ok(report.with_warning(format!(
                "container {} not found",
                self.container_name()
            )));
        }
        best_effort(&mut report, "docker", &["stop", self.container_name()], QUICK, "docker stop").await;
        best_effort(&mut report, "docker", &["rm", self.container_name()], QUICK, "docker rm").await;
        Ok(report)
    }

    async fn cleanup(&self) -> Result<OpReport, DeployError> {
        let mut report = OpReport::ok();
        if self.container_state().await.is_some() {
            best_effort(&mut report, "docker", &["rm", "-f", self.container_name()], QUICK, "docker rm -f").await;
        }
        remove_file_best_effort(&mut report, &self.config.env_file_path()).await;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceLimits;

    #[test]
    fn test_run_args_apply_limits() {
        let config = DeploymentConfig::builder()
            .limits(ResourceLimits {
                memory_mb: 1024,
                cpu_cores: 1.5,
                max_concurrency: 10,
            })
            .service_port(8080)
            .build()
            .unwrap();
        let backend = DockerBackend::new(config);
        let args = backend.run_args();

        assert_eq!(args[0], "run");
        assert!(args.windows(2).any(|w| w[0] == "--memory" && w[1] == "1024m"));
        assert!(args.windows(2).any(|w| w[0] == "--cpus" && w[1] == "1.5"));
        assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "8080:8080"));
        assert_eq!(args.last().map(String::as_str), Some("tokenizer-api:latest"));
        assert!(args.contains(&"no-new-privileges".to_string()));
    }
}
