//! 错误恢复引擎
//!
//! 根据 TaskError 种类与已尝试次数返回 RecoveryAction：退避重试、回灌给模型或终止任务。

use std::time::Duration;

use crate::config::TaskSection;
use crate::core::{TaskError, TaskErrorKind};

/// 恢复引擎给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 等待后重新请求模型（ApiError）
    RetryAfter(Duration),
    /// 作为工具结果写回对话，让模型下一轮自我修正（ToolError）
    FeedBackToModel(String),
    /// 终止当前任务
    Abort,
}

/// 重试策略：最大尝试次数 + 指数退避
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_api_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_consecutive_tool_errors: u32,
}

impl RetryPolicy {
    /// 第 attempt 次失败后的等待时间（attempt 从 1 开始）
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_api_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_consecutive_tool_errors: 3,
        }
    }
}

impl From<&TaskSection> for RetryPolicy {
    fn from(cfg: &TaskSection) -> Self {
        Self {
            max_api_attempts: cfg.max_api_attempts.max(1),
            base_delay: Duration::from_millis(cfg.retry_base_delay_ms),
            max_delay: Duration::from_millis(cfg.retry_max_delay_ms),
            max_consecutive_tool_errors: cfg.max_consecutive_tool_errors.max(1),
        }
    }
}

/// 语义化错误恢复：错误种类 + 次数 -> 动作
#[derive(Debug, Default, Clone)]
pub struct RecoveryEngine {
    policy: RetryPolicy,
}

impl RecoveryEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// attempt：同类错误连续出现的次数（含本次）
    pub fn handle(&self, err: &TaskError, attempt: u32) -> RecoveryAction {
        if !err.kind.is_retryable() {
            return RecoveryAction::Abort;
        }
        match err.kind {
            TaskErrorKind::ApiError if attempt < self.policy.max_api_attempts => {
                RecoveryAction::RetryAfter(self.policy.backoff(attempt))
            }
            TaskErrorKind::ToolError if attempt <= self.policy.max_consecutive_tool_errors => {
                RecoveryAction::FeedBackToModel(format!("Error: {}", err.message))
            }
            _ => RecoveryAction::Abort,
        }
    }
}
