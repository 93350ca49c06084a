//! 部署配置
//!
//! `DeploymentConfig` 只能经由 [`DeploymentConfigBuilder::build`] 构造，构造成功即结构合法。
//! 语义层面的可用性（端口空闲、搜索引擎可达）由校验协作者另行确认。

use serde::{Deserialize, Serialize, Serializer};
use std::path::{Path, PathBuf};

use crate::config::env::constants::{
    LIVENESS_PATH, MIN_MEMORY_MB, TOKENIZE_PATH,
};
use crate::domain::deploy::DeployMethod;
use crate::error::ConfigError;

/// 外部搜索引擎连接参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchEngineConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    #[serde(serialize_with = "redact")]
    pub password: Option<String>,
    pub verify_certs: bool,
    pub index: String,
}

impl Default for SearchEngineConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            host: "localhost".to_string(),
            port: 9200,
            username: None,
            password: None,
            verify_certs: true,
            index: "documents".to_string(),
        }
    }
}

impl SearchEngineConfig {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// 服务本身的网络绑定与运行参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub workers: u32,
    /// 容器镜像（docker）
    pub image: String,
    /// 可执行文件（systemd / standalone）
    pub executable: String,
    pub args: Vec<String>,
    /// 运行服务的系统用户（systemd）
    pub user: String,
    /// 独立进程模式下的依赖安装命令
    pub install_command: Option<String>,
    /// systemd unit 文件目录
    pub unit_dir: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "tokenizer-api".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8000,
            workers: 4,
            image: "tokenizer-api:latest".to_string(),
            executable: "/opt/tokenizer-api/bin/tokenizer-api".to_string(),
            args: Vec::new(),
            user: "tokenizer".to_string(),
            install_command: None,
            unit_dir: PathBuf::from("/etc/systemd/system"),
        }
    }
}

impl ServiceConfig {
    /// 探测用地址（通配地址改为回环地址）
    pub fn probe_base_url(&self) -> String {
        let host = match self.host.as_str() {
            "0.0.0.0" | "::" | "" => "127.0.0.1",
            other => other,
        };
        format!("http://{}:{}", host, self.port)
    }

    pub fn liveness_url(&self) -> String {
        format!("{}{}", self.probe_base_url(), LIVENESS_PATH)
    }

    pub fn functional_url(&self) -> String {
        format!("{}{}", self.probe_base_url(), TOKENIZE_PATH)
    }
}

/// 资源上限
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_cores: f64,
    pub max_concurrency: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            cpu_cores: 2.0,
            max_concurrency: 100,
        }
    }
}

/// 安全设置
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub run_as_non_root: bool,
    pub tls_enabled: bool,
    #[serde(serialize_with = "redact")]
    pub api_key: Option<String>,
    pub allowed_origins: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            run_as_non_root: true,
            tls_enabled: false,
            api_key: None,
            allowed_origins: vec!["*".to_string()],
        }
    }
}

/// 四个文件系统根目录
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub install_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub config_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            install_dir: PathBuf::from("/opt/tokenizer-api"),
            data_dir: PathBuf::from("/var/lib/tokenizer-api"),
            log_dir: PathBuf::from("/var/log/tokenizer-api"),
            config_dir: PathBuf::from("/etc/tokenizer-api"),
        }
    }
}

impl PathsConfig {
    /// 以固定顺序返回全部目录
    pub fn all(&self) -> [(&'static str, &Path); 4] {
        [
            ("install_dir", self.install_dir.as_path()),
            ("data_dir", self.data_dir.as_path()),
            ("log_dir", self.log_dir.as_path()),
            ("config_dir", self.config_dir.as_path()),
        ]
    }

    /// 同一根目录下的四个子目录
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            install_dir: root.join("install"),
            data_dir: root.join("data"),
            log_dir: root.join("log"),
            config_dir: root.join("config"),
        }
    }
}

/// 各类有界操作的超时
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub health_timeout_secs: u64,
    pub health_interval_ms: u64,
    pub probe_timeout_secs: u64,
    pub command_timeout_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            health_timeout_secs: 60,
            health_interval_ms: 1000,
            probe_timeout_secs: 10,
            command_timeout_secs: 300,
        }
    }
}

/// 恢复策略的退避时间
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub connection_backoff_ms: u64,
    pub service_backoff_ms: u64,
    pub deployment_backoff_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            connection_backoff_ms: 5_000,
            service_backoff_ms: 10_000,
            deployment_backoff_ms: 30_000,
        }
    }
}

/// 部署配置（不可变）
#[derive(Clone, Debug, Serialize)]
pub struct DeploymentConfig {
    method: DeployMethod,
    search_engine: SearchEngineConfig,
    service: ServiceConfig,
    limits: ResourceLimits,
    security: SecurityConfig,
    paths: PathsConfig,
    timeouts: TimeoutConfig,
    recovery: RecoveryConfig,
}

impl DeploymentConfig {
    pub fn builder() -> DeploymentConfigBuilder {
        DeploymentConfigBuilder::default()
    }

    pub fn method(&self) -> DeployMethod {
        self.method
    }

    pub fn search_engine(&self) -> &SearchEngineConfig {
        &self.search_engine
    }

    pub fn service(&self) -> &ServiceConfig {
        &self.service
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn security(&self) -> &SecurityConfig {
        &self.security
    }

    pub fn paths(&self) -> &PathsConfig {
        &self.paths
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    pub fn recovery(&self) -> &RecoveryConfig {
        &self.recovery
    }

    /// 服务环境变量，供各后端写入 env 文件
    pub fn service_environment(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("TOKENIZER_HOST".to_string(), self.service.host.clone()),
            ("TOKENIZER_PORT".to_string(), self.service.port.to_string()),
            ("TOKENIZER_WORKERS".to_string(), self.service.workers.to_string()),
            (
                "TOKENIZER_MAX_CONCURRENCY".to_string(),
                self.limits.max_concurrency.to_string(),
            ),
            (
                "SEARCH_ENGINE_URL".to_string(),
                self.search_engine.base_url(),
            ),
            (
                "SEARCH_ENGINE_INDEX".to_string(),
                self.search_engine.index.clone(),
            ),
            (
                "SEARCH_ENGINE_VERIFY_CERTS".to_string(),
                self.search_engine.verify_certs.to_string(),
            ),
            (
                "TOKENIZER_DATA_DIR".to_string(),
                self.paths.data_dir.display().to_string(),
            ),
            (
                "TOKENIZER_LOG_DIR".to_string(),
                self.paths.log_dir.display().to_string(),
            ),
            (
                "TOKENIZER_TLS_ENABLED".to_string(),
                self.security.tls_enabled.to_string(),
            ),
            (
                "TOKENIZER_ALLOWED_ORIGINS".to_string(),
                self.security.allowed_origins.join(","),
            ),
        ];
        if let Some(ref user) = self.search_engine.username {
            env.push(("SEARCH_ENGINE_USERNAME".to_string(), user.clone()));
        }
        if let Some(ref password) = self.search_engine.password {
            env.push(("SEARCH_ENGINE_PASSWORD".to_string(), password.clone()));
        }
        if let Some(ref key) = self.security.api_key {
            env.push(("TOKENIZER_API_KEY".to_string(), key.clone()));
        }
        env
    }

    /// env 文件位置
    pub fn env_file_path(&self) -> PathBuf {
        self.paths.config_dir.join("tokenizer.env")
    }

    /// 资源减半后的副本（内存、并发、worker 各自有下限）
    pub fn with_reduced_limits(&self) -> Self {
        let mut reduced = self.clone();
        reduced.limits.memory_mb = (self.limits.memory_mb / 2).max(MIN_MEMORY_MB);
        reduced.limits.max_concurrency = (self.limits.max_concurrency / 2).max(1);
        reduced.service.workers = (self.service.workers / 2).max(1);
        reduced
    }
}

/// 配置构造器，同时作为配置文件的反序列化目标
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct DeploymentConfigBuilder {
    pub method: Option<DeployMethod>,
    pub search_engine: SearchEngineConfig,
    pub service: ServiceConfig,
    pub limits: ResourceLimits,
    pub security: SecurityConfig,
    pub paths: PathsConfig,
    pub timeouts: TimeoutConfig,
    pub recovery: RecoveryConfig,
}

impl DeploymentConfigBuilder {
    pub fn method(mut self, method: DeployMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn search_engine(mut self, search_engine: SearchEngineConfig) -> Self {
        self.search_engine = search_engine;
        self
    }

    pub fn service(mut self, service: ServiceConfig) -> Self {
        self.service = service;
        self
    }

    pub fn service_port(mut self, port: u16) -> Self {
        self.service.port = port;
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn security(mut self, security: SecurityConfig) -> Self {
        self.security = security;
        self
    }

    pub fn paths(mut self, paths: PathsConfig) -> Self {
        self.paths = paths;
        self
    }

    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }

    /// 结构校验并构造
    pub fn build(self) -> Result<DeploymentConfig, ConfigError> {
        let method = self.method.unwrap_or(DeployMethod::Docker);

        match self.search_engine.scheme.as_str() {
            "http" | "https" => {}
            other => {
                return Err(ConfigError::invalid(
                    "search_engine.scheme",
                    format!("expected http or https, got '{}'", other),
                ))
            }
        }
        if self.search_engine.host.trim().is_empty() {
            return Err(ConfigError::invalid("search_engine.host", "must not be empty"));
        }
        if self.search_engine.port == 0 {
            return Err(ConfigError::invalid("search_engine.port", "must be non-zero"));
        }

        if self.service.name.trim().is_empty()
            || !self
                .service
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::invalid(
                "service.name",
                "must be non-empty and contain only [A-Za-z0-9_-]",
            ));
        }
        if self.service.port == 0 {
            return Err(ConfigError::invalid("service.port", "must be non-zero"));
        }
        if self.service.workers == 0 {
            return Err(ConfigError::invalid("service.workers", "must be at least 1"));
        }
        match method {
            DeployMethod::Docker if self.service.image.trim().is_empty() => {
                return Err(ConfigError::invalid("service.image", "required for docker"));
            }
            DeployMethod::Systemd | DeployMethod::Standalone
                if self.service.executable.trim().is_empty() =>
            {
                return Err(ConfigError::invalid(
                    "service.executable",
                    format!("required for {}", method),
                ));
            }
            _ => {}
        }

        if self.limits.memory_mb < MIN_MEMORY_MB {
            return Err(ConfigError::invalid(
                "limits.memory_mb",
                format!("must be at least {} MiB", MIN_MEMORY_MB),
            ));
        }
        if !(self.limits.cpu_cores > 0.0 && self.limits.cpu_cores.is_finite()) {
            return Err(ConfigError::invalid("limits.cpu_cores", "must be positive"));
        }
        if self.limits.max_concurrency == 0 {
            return Err(ConfigError::invalid(
                "limits.max_concurrency",
                "must be at least 1",
            ));
        }

        for (label, path) in self.paths.all() {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::InvalidField {
                    field: label,
                    reason: "must not be empty".to_string(),
                });
            }
        }

        if self.timeouts.health_timeout_secs == 0
            || self.timeouts.probe_timeout_secs == 0
            || self.timeouts.command_timeout_secs == 0
            || self.timeouts.health_interval_ms == 0
        {
            return Err(ConfigError::invalid("timeouts", "all timeouts must be positive"));
        }

        Ok(DeploymentConfig {
            method,
            search_engine: self.search_engine,
            service: self.service,
            limits: self.limits,
            security: self.security,
            paths: self.paths,
            timeouts: self.timeouts,
            recovery: self.recovery,
        })
    }
}

fn redact<S: Serializer>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(_) => serializer.serialize_some("***"),
        None => serializer.serialize_none(),
    }
}
