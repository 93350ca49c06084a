//! 配置加载：默认值 → JSON 配置文件 → `TOKENIZER_*` 环境变量

use std::env;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::deployment::{DeploymentConfig, DeploymentConfigBuilder};
use crate::domain::deploy::DeployMethod;
use crate::error::ConfigError;

/// 加载部署配置
///
/// 优先级：`method` 参数 > 环境变量 > 配置文件 > 默认值
pub fn load(
    path: Option<&Path>,
    method: Option<DeployMethod>,
) -> Result<DeploymentConfig, ConfigError> {
    let builder = match path {
        Some(path) => read_file(path)?,
        None => DeploymentConfigBuilder::default(),
    };
    let mut builder = apply_env(builder);
    if let Some(method) = method {
        builder = builder.method(method);
    }
    builder.build()
}

/// 读取 JSON 配置文件（所有字段可选）
pub fn read_file(path: &Path) -> Result<DeploymentConfigBuilder, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let builder = serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    info!(path = %path.display(), "Loaded deployment config file");
    Ok(builder)
}

/// 用环境变量覆盖
pub fn apply_env(mut builder: DeploymentConfigBuilder) -> DeploymentConfigBuilder {
    if let Ok(v) = env::var("TOKENIZER_DEPLOY_METHOD") {
        match DeployMethod::parse(&v) {
            Some(method) => builder.method = Some(method),
            None => warn!(value = %v, "Ignoring unknown TOKENIZER_DEPLOY_METHOD"),
        }
    }

    // Service
    if let Ok(v) = env::var("TOKENIZER_SERVICE_NAME") {
        builder.service.name = v;
    }
    if let Ok(v) = env::var("TOKENIZER_HOST") {
        builder.service.host = v;
    }
    if let Some(v) = parse_var("TOKENIZER_PORT") {
        builder.service.port = v;
    }
    if let Some(v) = parse_var("TOKENIZER_WORKERS") {
        builder.service.workers = v;
    }
    if let Ok(v) = env::var("TOKENIZER_IMAGE") {
        builder.service.image = v;
    }
    if let Ok(v) = env::var("TOKENIZER_EXECUTABLE") {
        builder.service.executable = v;
    }
    if let Ok(v) = env::var("TOKENIZER_SERVICE_USER") {
        builder.service.user = v;
    }

    // Search engine
    if let Ok(v) = env::var("SEARCH_ENGINE_HOST") {
        builder.search_engine.host = v;
    }
    if let Some(v) = parse_var("SEARCH_ENGINE_PORT") {
        builder.search_engine.port = v;
    }
    if let Ok(v) = env::var("SEARCH_ENGINE_SCHEME") {
        builder.search_engine.scheme = v;
    }
    if let Ok(v) = env::var("SEARCH_ENGINE_USERNAME") {
        builder.search_engine.username = Some(v).filter(|s| !s.is_empty());
    }
    if let Ok(v) = env::var("SEARCH_ENGINE_PASSWORD") {
        builder.search_engine.password = Some(v).filter(|s| !s.is_empty());
    }
    if let Some(v) = parse_bool("SEARCH_ENGINE_VERIFY_CERTS") {
        builder.search_engine.verify_certs = v;
    }

    // Limits
    if let Some(v) = parse_var("TOKENIZER_MEMORY_MB") {
        builder.limits.memory_mb = v;
    }
    if let Some(v) = parse_var("TOKENIZER_CPU_CORES") {
        builder.limits.cpu_cores = v;
    }
    if let Some(v) = parse_var("TOKENIZER_MAX_CONCURRENCY") {
        builder.limits.max_concurrency = v;
    }

    // Security
    if let Some(v) = parse_bool("TOKENIZER_TLS_ENABLED") {
        builder.security.tls_enabled = v;
    }
    if let Ok(v) = env::var("TOKENIZER_API_KEY") {
        builder.security.api_key = Some(v).filter(|s| !s.is_empty());
    }

    // Paths
    if let Ok(v) = env::var("TOKENIZER_INSTALL_DIR") {
        builder.paths.install_dir = PathBuf::from(v);
    }
    if let Ok(v) = env::var("TOKENIZER_DATA_DIR") {
        builder.paths.data_dir = PathBuf::from(v);
    }
    if let Ok(v) = env::var("TOKENIZER_LOG_DIR") {
        builder.paths.log_dir = PathBuf::from(v);
    }
    if let Ok(v) = env::var("TOKENIZER_CONFIG_DIR") {
        builder.paths.config_dir = PathBuf::from(v);
    }

    if let Some(v) = parse_var("TOKENIZER_HEALTH_TIMEOUT_SECS") {
        builder.timeouts.health_timeout_secs = v;
    }

    builder
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(name = %name, value = %raw, "Ignoring unparsable environment variable");
            None
        }
    }
}

fn parse_bool(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

/// 常量
pub mod constants {
    /// 内存下限（MiB）
    pub const MIN_MEMORY_MB: u64 = 256;

    /// 存活探针路径
    pub const LIVENESS_PATH: &str = "/health";

    /// 功能探针路径
    pub const TOKENIZE_PATH: &str = "/tokenize";

    /// 功能探针使用的规范输入
    pub const CANONICAL_PROBE_TEXT: &str = "The quick brown fox jumps over the lazy dog.";

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}
