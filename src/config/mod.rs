//! 配置模块
//!
//! 部署配置模型与加载

pub mod deployment;
pub mod env;

pub use deployment::{
    DeploymentConfig, DeploymentConfigBuilder, PathsConfig, RecoveryConfig, ResourceLimits,
    SearchEngineConfig, SecurityConfig, ServiceConfig, TimeoutConfig,
};
