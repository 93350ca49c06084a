//! HTTP 探测客户端
//!
//! 封装对已部署服务和外部搜索引擎的所有 HTTP 交互，复用连接池：
//! - 存活探针 (liveness)
//! - 功能探针 (tokenize)
//! - 有界健康轮询 (wait_until_healthy)
//! - 搜索引擎连通性 (ping)

use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::deployment::{DeploymentConfig, SearchEngineConfig};
use crate::error::DeployError;

/// 存活探针结果
#[derive(Debug, Clone)]
pub struct LivenessOutcome {
    pub healthy: bool,
    pub status: u16,
    /// 响应体（若为 JSON）
    pub body: Option<Value>,
}

/// 已部署服务的探测客户端
#[derive(Clone)]
pub struct ServiceClient {
    client: Client,
    liveness_url: String,
    functional_url: String,
    probe_timeout_secs: u64,
}

impl ServiceClient {
    /// 创建服务探测客户端
    ///
    /// 单次请求超时取 `timeouts.probe_timeout_secs`
    pub fn new(config: &DeploymentConfig) -> Result<Self, DeployError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeouts().probe_timeout_secs))
            .pool_max_idle_per_host(2)
            .build()?;

        Ok(Self {
            client,
            liveness_url: config.service().liveness_url(),
            functional_url: config.service().functional_url(),
            probe_timeout_secs: config.timeouts().probe_timeout_secs,
        })
    }

    pub fn liveness_url(&self) -> &str {
        &self.liveness_url
    }

    pub fn functional_url(&self) -> &str {
        &self.functional_url
    }

    /// 单次存活探测
    pub async fn liveness(&self) -> Result<LivenessOutcome, DeployError> {
        let resp = self
            .client
            .get(&self.liveness_url)
            .send()
            .await
            .map_err(|e| self.map_error(e, "liveness probe"))?;

        let status = resp.status();
        let raw = resp.text().await.unwrap_or_default();
        let body = serde_json::from_str::<Value>(&raw).ok();

        Ok(LivenessOutcome {
            healthy: status.is_success(),
            status: status.as_u16(),
            body,
        })
    }

    /// 轮询直到健康或超时（fail closed）
    ///
    /// 返回最后一次健康响应体
    pub async fn wait_until_healthy(
        &self,
        timeout: Duration,
        interval: Duration,
    ) -> Result<Option<Value>, DeployError> {
        let deadline = Instant::now() + timeout;
        let mut attempts = 0u32;
        let mut last_problem = String::from("no response");

        while Instant::now() < deadline {
            attempts += 1;
            match self.liveness().await {
                Ok(outcome) if outcome.healthy => {
                    info!(url = %self.liveness_url, attempts = attempts, "Service is healthy");
                    return Ok(outcome.body);
                }
                Ok(outcome) => {
                    last_problem = format!("status {}", outcome.status);
                }
                Err(e) => {
                    last_problem = e.to_string();
                }
            }
            debug!(url = %self.liveness_url, attempt = attempts, problem = %last_problem, "Service not healthy yet");
            sleep(interval).await;
        }

        warn!(
            url = %self.liveness_url,
            attempts = attempts,
            last_problem = %last_problem,
            "Health polling timed out"
        );
        Err(DeployError::timeout(
            format!("health check of {} ({})", self.liveness_url, last_problem),
            timeout.as_secs(),
        ))
    }

    /// 功能探测：提交规范输入，要求返回非空结构化结果
    pub async fn tokenize(&self, text: &str) -> Result<Value, DeployError> {
        let resp = self
            .client
            .post(&self.functional_url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| self.map_error(e, "functional probe"))?;

        let status = resp.status();
        let raw = resp.text().await.unwrap_or_default();

        if status == StatusCode::SERVICE_UNAVAILABLE {
            return Err(DeployError::ServiceUnavailable(format!(
                "functional probe returned 503: {}",
                raw
            )));
        }
        if !status.is_success() {
            return Err(DeployError::other(format!(
                "functional probe error {}: {}",
                status, raw
            )));
        }

        let value: Value = serde_json::from_str(&raw).map_err(|e| {
            DeployError::other(format!("invalid functional probe JSON: {} ({})", e, raw))
        })?;

        if is_non_empty_structured(&value) {
            Ok(value)
        } else {
            Err(DeployError::other(format!(
                "functional probe returned empty result: {}",
                raw
            )))
        }
    }

    fn map_error(&self, e: reqwest::Error, what: &str) -> DeployError {
        if e.is_timeout() {
            DeployError::timeout(what, self.probe_timeout_secs)
        } else if e.is_connect() {
            DeployError::ServiceUnavailable(format!("{}: connection refused ({})", what, e))
        } else {
            DeployError::Http(e)
        }
    }
}

/// 非空对象或数组；对象若带 `tokens` 字段则要求其非空
fn is_non_empty_structured(value: &Value) -> bool {
    match value {
        Value::Object(map) => match map.get("tokens") {
            Some(Value::Array(tokens)) => !tokens.is_empty(),
            Some(_) => false,
            None => !map.is_empty(),
        },
        Value::Array(items) => !items.is_empty(),
        _ => false,
    }
}

/// 搜索引擎连通性客户端
#[derive(Clone)]
pub struct SearchEngineClient {
    client: Client,
    config: SearchEngineConfig,
}

impl SearchEngineClient {
    pub fn new(config: &SearchEngineConfig, timeout: Duration) -> Result<Self, DeployError> {
        let client = Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(!config.verify_certs)
            .build()?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    pub fn base_url(&self) -> String {
        self.config.base_url()
    }

    /// 探测搜索引擎
    ///
    /// 只要拿到 HTTP 响应即视为可达，返回状态码；认证失败由调用方决定如何处理
    pub async fn ping(&self) -> Result<u16, DeployError> {
        let mut request = self.client.get(self.base_url());
        if let Some(ref user) = self.config.username {
            request = request.basic_auth(user, self.config.password.as_ref());
        }

        match request.send().await {
            Ok(resp) => Ok(resp.status().as_u16()),
            Err(e) if e.is_timeout() => Err(DeployError::Connection(format!(
                "search engine {} timeout",
                self.base_url()
            ))),
            Err(e) if e.is_connect() => Err(DeployError::Connection(format!(
                "search engine {} unreachable: {}",
                self.base_url(),
                e
            ))),
            Err(e) => Err(DeployError::Http(e)),
        }
    }
}
