//! 失败后的清理
//!
//! 清理动作按注册的逆序执行，随后逆序处理受追踪资源：
//! 目录保留，服务停止（其清理动作已成功执行则跳过），临时文件尽力删除。
//! 单项失败只记日志，清理永不中途退出。

use tracing::{debug, info, warn};

use crate::domain::orchestration::ResourceKind;

use super::Orchestrator;

impl Orchestrator {
    /// 执行全部清理，同一次尝试内只生效一次
    pub(super) async fn cleanup(&self) {
        let taken = self
            .update(|ctx| {
                if ctx.begin_cleanup() {
                    Some((ctx.take_cleanup_actions(), ctx.resources().to_vec()))
                } else {
                    None
                }
            })
            .await
            .flatten();
        let Some((actions, resources)) = taken else {
            debug!("Cleanup already executed");
            return;
        };

        info!(actions = actions.len(), resources = resources.len(), "Running cleanup");

        let mut succeeded = Vec::new();
        for action in actions.into_iter().rev() {
            let name = action.name.clone();
            match action.run().await {
                Ok(()) => {
                    info!(action = %name, "Cleanup action completed");
                    succeeded.push(name.clone());
                }
                Err(e) => warn!(action = %name, error = %e, "Cleanup action failed"),
            }
            self.update(|ctx| ctx.mark_cleanup_executed(name)).await;
        }

        for resource in resources.iter().rev() {
            match resource.kind {
                ResourceKind::Directory => {
                    debug!(path = %resource.id, "Keeping directory");
                }
                ResourceKind::Service => {
                    let handled = resource
                        .cleanup_action
                        .as_ref()
                        .is_some_and(|a| succeeded.contains(a));
                    if handled {
                        continue;
                    }
                    match self.backend().await.stop_service().await {
                        Ok(report) => {
                            for w in report.warnings.iter().chain(report.errors.iter()) {
                                warn!(service = %resource.id, "{}", w);
                            }
                        }
                        Err(e) => warn!(service = %resource.id, error = %e, "Failed to stop service"),
                    }
                }
                ResourceKind::TempFile => match tokio::fs::remove_file(&resource.id).await {
                    Ok(()) => debug!(path = %resource.id, "Removed temporary file"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(path = %resource.id, error = %e, "Failed to remove temporary file"),
                },
            }
        }
    }
}
