//! 领域模型模块
//!
//! 纯数据结构，不依赖 tokio

pub mod deploy;
pub mod orchestration;
pub mod validation;

// Re-exports for convenience
pub use deploy::{
    DeployMethod, DeploymentProgress, DeploymentResult, DeploymentStep, OpReport, OverallStatus,
    StepName, StepStatus,
};
pub use orchestration::{
    DeploymentStatus, ErrorCategory, ErrorRecord, Phase, PhaseTransition, ResourceKind,
    TrackedResource,
};
pub use validation::{CategoryResult, CheckResult, ValidationReport, ValidationStatus};
