//! 子进程执行：sh -c（Windows 为 cmd /C），带超时、输出上限与取消
//!
//! stdout / stderr 各自最多保留 output_cap 字节，超出部分继续读取丢弃（避免子进程阻塞在管道上）并标记截断。
//! 超时或取消时强制 kill 子进程；kill_on_drop 保证 future 被丢弃时也不会留下孤儿进程。

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ExecutorSection;
use crate::core::AgentError;

/// 进程退出后等待管道读完的时长（后台孙进程可能一直持有管道）
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// 一次子进程运行的结果
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// 被信号终止或超时时为 None
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// 子进程执行抽象（测试中可替换）
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// 在 cwd 中运行命令；取消时返回 Cancelled，无法创建进程时返回 Process
    async fn run(
        &self,
        command: &str,
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, AgentError>;
}

/// 基于 tokio::process 的 shell 执行器
#[derive(Clone, Debug)]
pub struct ShellRunner {
    shell: String,
    timeout: Duration,
    output_cap: usize,
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>, timeout: Duration, output_cap: usize) -> Self {
        Self {
            shell: shell.into(),
            timeout,
            output_cap,
        }
    }

    pub fn from_config(section: &ExecutorSection) -> Self {
        Self::new(
            section.shell.clone(),
            Duration::from_secs(section.timeout_secs),
            section.output_cap_bytes,
        )
    }

    fn command(&self, command: &str) -> Command {
        if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new(&self.shell);
            c.args(["-c", command]);
            c
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::from_config(&ExecutorSection::default())
    }
}

enum Outcome {
    Exited(Option<i32>),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        command: &str,
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, AgentError> {
        let start = Instant::now();
        let mut child = self
            .command(command)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Process(format!("failed to spawn '{}': {}", self.shell, e)))?;

        let mut out_task = tokio::spawn(read_capped(child.stdout.take(), self.output_cap));
        let mut err_task = tokio::spawn(read_capped(child.stderr.take(), self.output_cap));

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(s) => Outcome::Exited(s.code()),
                Err(e) => return Err(AgentError::Process(format!("failed to wait for child: {}", e))),
            },
            _ = tokio::time::sleep(self.timeout) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        if !matches!(outcome, Outcome::Exited(_)) {
            if let Err(e) = child.kill().await {
                tracing::warn!(command = %command, error = %e, "failed to kill child process");
            }
        }

        let (stdout, out_truncated) = join_reader(&mut out_task).await;
        let (stderr, err_truncated) = join_reader(&mut err_task).await;

        let (exit_code, timed_out) = match outcome {
            Outcome::Cancelled => return Err(AgentError::Cancelled),
            Outcome::TimedOut => (None, true),
            Outcome::Exited(code) => (code, false),
        };

        Ok(ProcessOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            truncated: out_truncated || err_truncated,
            timed_out,
            elapsed: start.elapsed(),
        })
    }
}

/// 读取至多 cap 字节，其余丢弃
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, cap: usize) -> (Vec<u8>, bool) {
    let Some(mut reader) = reader else {
        return (Vec::new(), false);
    };
    let mut buf = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(buf.len());
                if n > room {
                    truncated = true;
                }
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    (buf, truncated)
}

async fn join_reader(task: &mut JoinHandle<(Vec<u8>, bool)>) -> (Vec<u8>, bool) {
    match tokio::time::timeout(DRAIN_GRACE, &mut *task).await {
        Ok(Ok(output)) => output,
        Ok(Err(_)) => (Vec::new(), false),
        Err(_) => {
            task.abort();
            (Vec::new(), true)
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn runner(timeout_ms: u64, cap: usize) -> ShellRunner {
        ShellRunner::new("sh", Duration::from_millis(timeout_ms), cap)
    }

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let out = runner(5_000, 1024)
            .run("echo hello; echo oops >&2; exit 3", dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_runs_in_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let out = runner(5_000, 1024)
            .run("ls", dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.success());
        assert!(out.stdout.contains("marker.txt"));
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let dir = tempfile::tempdir().unwrap();
        let out = runner(5_000, 10)
            .run("printf 'abcdefghijklmnopqrstuvwxyz'", dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.stdout, "abcdefghij");
        assert!(out.truncated);
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let dir = tempfile::tempdir().unwrap();
        let start = Instant::now();
        let out = runner(200, 1024)
            .run("sleep 10", dir.path(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, None);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancel_terminates_child() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = runner(10_000, 1024)
            .run("sleep 10", dir.path(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }
}
