//! 服务层模块
//!
//! 包含核心业务逻辑

pub mod config_check;
pub mod deploy;
pub mod manager;
pub mod orchestrator;
pub mod validation;

pub use config_check::{ConfigurationValidator, PathConfigValidator};
pub use deploy::{create_backend, DeploymentBackend};
pub use manager::{ChannelObserver, DeploymentManager, LoggingObserver, ProgressObserver};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use validation::{SystemValidator, ValidationCollaborator};
