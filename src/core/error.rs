//! 任务错误类型
//!
//! TaskError = 错误种类 + 消息；种类决定是重试、回灌给模型，还是直接终止任务（Aborted）。

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// 错误种类（决定恢复策略）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// 模型服务 / 传输层失败，可退避重试
    ApiError,
    /// 工具调用格式错误或执行失败，回灌给模型自我修正
    ToolError,
    /// 用户取消、超时或上游关闭
    UserAbort,
    Unknown,
    Unauthorized,
    PaymentRequired,
}

impl TaskErrorKind {
    /// 致命错误：无论处于哪个状态都强制进入 Aborted
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            TaskErrorKind::Unauthorized | TaskErrorKind::PaymentRequired | TaskErrorKind::Unknown
        )
    }

    /// 终止性错误：致命错误 + 用户取消，从不重试
    pub fn is_terminal(self) -> bool {
        self.is_fatal() || self == TaskErrorKind::UserAbort
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, TaskErrorKind::ApiError | TaskErrorKind::ToolError)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskErrorKind::ApiError => "api_error",
            TaskErrorKind::ToolError => "tool_error",
            TaskErrorKind::UserAbort => "user_abort",
            TaskErrorKind::Unknown => "unknown",
            TaskErrorKind::Unauthorized => "unauthorized",
            TaskErrorKind::PaymentRequired => "payment_required",
        }
    }
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务运行过程中的结构化错误
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{kind}: {message}")]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::ApiError, message)
    }

    pub fn tool(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::ToolError, message)
    }

    pub fn user_abort(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::UserAbort, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Unknown, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Unauthorized, message)
    }

    pub fn payment_required(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::PaymentRequired, message)
    }

    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_kinds() {
        assert!(TaskErrorKind::Unauthorized.is_fatal());
        assert!(TaskErrorKind::PaymentRequired.is_fatal());
        assert!(TaskErrorKind::Unknown.is_fatal());
        assert!(!TaskErrorKind::ApiError.is_fatal());
        assert!(!TaskErrorKind::ToolError.is_fatal());
        assert!(!TaskErrorKind::UserAbort.is_fatal());
    }

    #[test]
    fn test_user_abort_is_terminal_but_not_retryable() {
        assert!(TaskErrorKind::UserAbort.is_terminal());
        assert!(!TaskErrorKind::UserAbort.is_retryable());
        assert!(TaskErrorKind::ApiError.is_retryable());
    }

    #[test]
    fn test_display() {
        let err = TaskError::tool("missing field `path`");
        assert_eq!(err.to_string(), "tool_error: missing field `path`");
    }
}
