//! execute_command：白名单命令，禁止危险操作
//!
//! 仅允许配置中的命令名（首词，如 ls、grep、cargo）；禁止 rm -rf、wget、chmod 777 等子串。
//! 在工作区根目录下通过 sh -c / cmd /C 执行；取消信号触发时丢弃子进程（kill_on_drop）。

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::core::{CancellationSignal, TaskError};
use crate::parser::ToolInput;
use crate::tools::definitions::EXECUTE_COMMAND;
use crate::tools::{Tool, ToolOutput};

/// 禁止的命令/子串（即使首词在白名单中也不允许）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:",
];

/// 输出最多保留的字符数（超出截掉开头，保留末尾）
const MAX_OUTPUT_CHARS: usize = 20_000;

/// Shell 工具：仅允许白名单内命令
pub struct ExecuteCommandTool {
    allowed_commands: HashSet<String>,
    cwd: PathBuf,
}

impl ExecuteCommandTool {
    pub fn new(allowed_commands: Vec<String>, cwd: impl Into<PathBuf>) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        Self {
            allowed_commands,
            cwd: cwd.into(),
        }
    }

    /// 首个 token 为命令名
    fn command_name(raw: &str) -> &str {
        raw.split_whitespace().next().unwrap_or("")
    }

    pub fn check_allowed(&self, raw: &str) -> Result<(), TaskError> {
        let raw_lower = raw.to_lowercase();
        if let Some(forbidden) = FORBIDDEN_SUBSTR.iter().find(|f| raw_lower.contains(*f)) {
            return Err(TaskError::tool(format!("Forbidden pattern: {}", forbidden)));
        }
        let name = Self::command_name(&raw_lower);
        if name.is_empty() {
            return Err(TaskError::tool("Empty command"));
        }
        if self.allowed_commands.contains(name) {
            Ok(())
        } else {
            Err(TaskError::tool(format!("Command '{}' not in allowlist", name)))
        }
    }
}

#[async_trait]
impl Tool for ExecuteCommandTool {
    fn name(&self) -> &str {
        EXECUTE_COMMAND
    }

    async fn execute(
        &self,
        input: &ToolInput,
        signal: &CancellationSignal,
    ) -> Result<ToolOutput, TaskError> {
        let command = input.require_text("command")?.trim();
        self.check_allowed(command)?;
        tracing::info!(command = %command, "execute_command");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| TaskError::tool(format!("Execution failed: {}", e)))?;

        let output = tokio::select! {
            biased;
            _ = signal.cancelled() => {
                tracing::warn!(command = %command, "command interrupted, child killed");
                signal.check()?;
                return Err(TaskError::user_abort("command interrupted"));
            }
            out = child.wait_with_output() => {
                out.map_err(|e| TaskError::tool(format!("Execution failed: {}", e)))?
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut text = String::new();
        if !stdout.trim().is_empty() {
            text.push_str(stdout.trim_end());
        }
        if !stderr.trim().is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str("stderr: ");
            text.push_str(stderr.trim_end());
        }
        let text = tail_chars(&text, MAX_OUTPUT_CHARS);

        if !output.status.success() {
            return Err(TaskError::tool(format!("Exit {}\n{}", output.status, text)));
        }
        Ok(ToolOutput::text(if text.is_empty() {
            "Command executed with no output.".to_string()
        } else {
            text
        }))
    }
}

fn tail_chars(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        return s.to_string();
    }
    let tail: String = s.chars().skip(count - max).collect();
    format!("[output truncated]\n{}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CancelReason, CancellationCoordinator, TaskErrorKind};
    use crate::parser::FieldValue;

    fn tool(dir: &std::path::Path) -> ExecuteCommandTool {
        ExecuteCommandTool::new(vec!["echo".into(), "sleep".into(), "ls".into()], dir)
    }

    fn input(command: &str) -> ToolInput {
        [("command", FieldValue::Text(command.into()))]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_allowlist() {
        let t = tool(std::path::Path::new("."));
        assert!(t.check_allowed("echo hi").is_ok());
        assert!(t.check_allowed("ECHO hi").is_ok());
        assert!(t.check_allowed("curl example.com").is_err());
        assert!(t.check_allowed("   ").is_err());
        let err = t.check_allowed("ls; rm -rf /").unwrap_err();
        assert!(err.message.contains("Forbidden"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let out = tool(dir.path())
            .execute(&input("ls"), &CancellationSignal::never())
            .await
            .unwrap();
        assert_eq!(out.text, "marker.txt");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_interrupts_command() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = CancellationCoordinator::new();
        let signal = coordinator.signal();
        let t = tool(dir.path());
        let sleep_input = input("sleep 30");
        let run = t.execute(&sleep_input, &signal);
        let cancel = async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            coordinator.cancel(CancelReason::UserAbort);
        };
        let (result, _) = tokio::join!(run, cancel);
        let err = result.unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::UserAbort);
    }

    #[test]
    fn test_tail_chars() {
        assert_eq!(tail_chars("abc", 5), "abc");
        assert_eq!(tail_chars("abcdef", 2), "[output truncated]\nef");
    }
}
