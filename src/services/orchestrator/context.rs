//! 编排上下文
//!
//! 一次部署尝试的唯一事实来源：阶段历史、错误历史、资源与清理动作、阶段间传递的元数据。

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::domain::orchestration::{
    DeploymentStatus, ErrorCategory, ErrorRecord, Phase, PhaseTransition, ResourceKind,
    TrackedResource,
};
use crate::error::DeployError;

/// 清理动作返回的 future
pub type CleanupFuture = BoxFuture<'static, Result<(), DeployError>>;

/// 清理动作，只能执行一次
pub type CleanupFn = Box<dyn FnOnce() -> CleanupFuture + Send + Sync>;

/// 具名清理动作
pub struct CleanupAction {
    pub name: String,
    action: CleanupFn,
}

impl CleanupAction {
    pub fn new(name: impl Into<String>, action: CleanupFn) -> Self {
        Self {
            name: name.into(),
            action,
        }
    }

    /// 消耗自身并执行
    pub fn run(self) -> CleanupFuture {
        (self.action)()
    }
}

impl std::fmt::Debug for CleanupAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupAction").field("name", &self.name).finish()
    }
}

/// 部署上下文
#[derive(Debug)]
pub struct DeploymentContext {
    pub deployment_id: String,
    pub started_at: DateTime<Utc>,
    current_phase: Phase,
    phases_completed: Vec<Phase>,
    resources: Vec<TrackedResource>,
    cleanup_actions: Vec<CleanupAction>,
    cleanup_executed: Vec<String>,
    cleanup_done: bool,
    error_history: Vec<ErrorRecord>,
    phase_history: Vec<PhaseTransition>,
    metadata: BTreeMap<String, Value>,
    endpoints: BTreeMap<String, String>,
}

impl DeploymentContext {
    pub fn new(deployment_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            deployment_id: deployment_id.into(),
            started_at: now,
            current_phase: Phase::Initialization,
            phases_completed: Vec::new(),
            resources: Vec::new(),
            cleanup_actions: Vec::new(),
            cleanup_executed: Vec::new(),
            cleanup_done: false,
            error_history: Vec::new(),
            phase_history: vec![PhaseTransition {
                from: None,
                to: Phase::Initialization,
                timestamp: now,
            }],
            metadata: BTreeMap::new(),
            endpoints: BTreeMap::new(),
        }
    }

    pub fn current_phase(&self) -> Phase {
        self.current_phase
    }

    /// 切换阶段并记录历史
    ///
    /// 离开的阶段只有在向前推进（不是进入 failed）时才计为已完成
    pub fn transition(&mut self, to: Phase) {
        let from = self.current_phase;
        if from == to {
            return;
        }
        if to != Phase::Failed && !from.is_terminal() {
            self.phases_completed.push(from);
        }
        self.phase_history.push(PhaseTransition {
            from: Some(from),
            to,
            timestamp: Utc::now(),
        });
        self.current_phase = to;
    }

    /// 记录错误，标记为当前阶段
    pub fn record_error(&mut self, error: impl Into<String>, category: ErrorCategory) {
        self.error_history.push(ErrorRecord {
            error: error.into(),
            category,
            phase: self.current_phase,
            timestamp: Utc::now(),
        });
    }

    pub fn track_resource(
        &mut self,
        kind: ResourceKind,
        id: impl Into<String>,
        cleanup_action: Option<String>,
    ) {
        self.resources.push(TrackedResource {
            kind,
            id: id.into(),
            cleanup_action,
            allocated_at: Utc::now(),
        });
    }

    pub fn resources(&self) -> &[TrackedResource] {
        &self.resources
    }

    pub fn register_cleanup(&mut self, action: CleanupAction) {
        self.cleanup_actions.push(action);
    }

    /// 取出全部清理动作（按注册顺序）
    pub fn take_cleanup_actions(&mut self) -> Vec<CleanupAction> {
        std::mem::take(&mut self.cleanup_actions)
    }

    pub fn registered_cleanups(&self) -> Vec<String> {
        self.cleanup_actions.iter().map(|a| a.name.clone()).collect()
    }

    pub fn mark_cleanup_executed(&mut self, name: impl Into<String>) {
        self.cleanup_executed.push(name.into());
    }

    /// 首次调用返回 true，之后返回 false
    pub fn begin_cleanup(&mut self) -> bool {
        !std::mem::replace(&mut self.cleanup_done, true)
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    pub fn set_endpoints(&mut self, endpoints: BTreeMap<String, String>) {
        self.endpoints = endpoints;
    }

    pub fn endpoints(&self) -> &BTreeMap<String, String> {
        &self.endpoints
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.error_history
    }

    pub fn phases_completed(&self) -> &[Phase] {
        &self.phases_completed
    }

    /// 已耗时（秒）
    pub fn duration(&self) -> f64 {
        (Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    /// 只读快照
    pub fn status(&self) -> DeploymentStatus {
        DeploymentStatus {
            deployment_id: self.deployment_id.clone(),
            current_phase: self.current_phase,
            duration: self.duration(),
            resources_allocated: self.resources.len(),
            errors_count: self.error_history.len(),
            phases_completed: self.phases_completed.clone(),
            metadata: self.metadata.clone(),
            error_history: self.error_history.clone(),
            phase_history: self.phase_history.clone(),
            cleanup_executed: self.cleanup_executed.clone(),
        }
    }
}
