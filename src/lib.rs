//! XJP Tokenizer Deploy - Tokenizer API 部署编排引擎
//!
//! 分层结构：
//! - `config`: 部署配置与加载
//! - `domain`: 纯数据模型（步骤、阶段、校验结果）
//! - `infra`: 子进程与 HTTP 探测
//! - `services`: 部署后端、步骤引擎、编排器

pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod services;

pub use config::DeploymentConfig;
pub use domain::{DeployMethod, DeploymentResult, DeploymentStatus, OpReport};
pub use error::{classify, DeployError};
pub use services::{DeploymentManager, Orchestrator};
