//! 命令执行器
//!
//! 提供统一的子进程执行接口，支持：
//! - 显式超时（超时后进程被杀掉）
//! - stdout/stderr 分离捕获
//! - 输出逐行写入 tracing

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// 命令执行器
pub struct CommandRunner;

/// 命令执行错误
#[derive(Debug, Error)]
pub enum CommandError {
    /// 命令启动失败（通常是程序不存在或无执行权限）
    #[error("failed to spawn `{program}`: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// 命令超时
    #[error("command `{program}` timeout after {seconds}s")]
    Timeout { program: String, seconds: u64 },
}

/// 命令执行结果
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// 退出码（被信号终止时为 None）
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// 失败说明：优先 stderr，其次 stdout
    pub fn failure_message(&self, what: &str) -> String {
        let detail = if !self.stderr.trim().is_empty() {
            self.stderr.trim()
        } else {
            self.stdout.trim()
        };
        match self.code {
            Some(code) => format!("{} failed (exit code {}): {}", what, code, detail),
            None => format!("{} terminated by signal: {}", what, detail),
        }
    }
}

impl CommandRunner {
    /// 执行命令
    ///
    /// # Arguments
    /// * `program` - 要执行的程序
    /// * `args` - 命令行参数
    /// * `timeout` - 超时时间
    pub async fn run(
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        Self::run_with(program, args, None, &[], timeout).await
    }

    /// 在指定工作目录、附加环境变量下执行命令
    pub async fn run_with(
        program: &str,
        args: &[&str],
        work_dir: Option<&Path>,
        envs: &[(String, String)],
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = work_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in envs {
            cmd.env(key, value);
        }

        debug!(program = %program, args = ?args, "Running command");

        let child = cmd.spawn().map_err(|source| CommandError::SpawnFailed {
            program: program.to_string(),
            source,
        })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| CommandError::SpawnFailed {
                program: program.to_string(),
                source,
            })?,
            Err(_) => {
                // child 已随 future 一起 drop，kill_on_drop 负责终止进程
                warn!(program = %program, "Command timed out after {:?}", timeout);
                return Err(CommandError::Timeout {
                    program: program.to_string(),
                    seconds: timeout.as_secs(),
                });
            }
        };

        let result = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        for line in result.stdout.lines().filter(|l| !l.trim().is_empty()) {
            debug!(program = %program, stream = "stdout", "{}", line);
        }
        for line in result.stderr.lines().filter(|l| !l.trim().is_empty()) {
            debug!(program = %program, stream = "stderr", "{}", line);
        }

        Ok(result)
    }

    /// 执行 shell 命令
    ///
    /// 使用 sh -c 执行命令字符串
    pub async fn run_shell(
        command: &str,
        work_dir: Option<&Path>,
        envs: &[(String, String)],
        timeout: Duration,
    ) -> Result<CommandOutput, CommandError> {
        Self::run_with("sh", &["-c", command], work_dir, envs, timeout).await
    }

    /// 检查程序是否存在于 PATH
    pub async fn exists(program: &str) -> bool {
        Self::run("which", &[program], Duration::from_secs(5))
            .await
            .map(|o| o.success())
            .unwrap_or(false)
    }

    /// 当前有效用户是否为 root
    pub async fn is_root() -> bool {
        Self::run("id", &["-u"], Duration::from_secs(5))
            .await
            .map(|o| o.success() && o.stdout.trim() == "0")
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_success() {
        let output = CommandRunner::run("echo", &["hello"], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.success());
        assert!(output.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_run_not_found() {
        let result =
            CommandRunner::run("nonexistent_command_12345", &[], Duration::from_secs(5)).await;
        assert!(matches!(result, Err(CommandError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let result = CommandRunner::run("sleep", &["5"], Duration::from_millis(100)).await;
        assert!(matches!(result, Err(CommandError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_failure_message_prefers_stderr() {
        let output = CommandRunner::run_shell(
            "echo out; echo err 1>&2; exit 3",
            None,
            &[],
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(!output.success());
        let msg = output.failure_message("script");
        assert!(msg.contains("exit code 3"));
        assert!(msg.contains("err"));
    }

    #[tokio::test]
    async fn test_run_with_env() {
        let output = CommandRunner::run_shell(
            "echo $PROBE_VALUE",
            None,
            &[("PROBE_VALUE".to_string(), "42".to_string())],
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(output.stdout.trim(), "42");
    }
}
