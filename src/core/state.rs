//! 任务状态机与 UI 投影
//!
//! TaskStateMachine 只负责「当前状态 + 合法转移 + 转移日志」，不做 IO；
//! 异步驱动由 agent::Task 完成。UiState 是给前端的轻量投影。

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::core::TaskError;
use crate::memory::Message;

/// 任务状态（初始 Idle，终态 Completed / Aborted）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    WaitingForApi,
    ProcessingResponse,
    ExecutingTool,
    WaitingForUser,
    Completed,
    Aborted,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Aborted)
    }

    /// 转移表；Aborted 可从任意非终态进入
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Aborted) => true,
            (Idle, WaitingForApi) => true,
            (WaitingForApi, ProcessingResponse) => true,
            (ProcessingResponse, ExecutingTool) => true,
            (ProcessingResponse, WaitingForUser) => true,
            // 本轮追加了工具结果，开启下一轮模型请求
            (ProcessingResponse, WaitingForApi) => true,
            (ExecutingTool, ProcessingResponse) => true,
            (ExecutingTool, WaitingForUser) => true,
            (WaitingForUser, WaitingForApi) => true,
            (ProcessingResponse, Completed) | (ExecutingTool, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 非法转移（编程错误，不进入对话历史）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("illegal task transition {from} -> {to}")]
pub struct TransitionError {
    pub from: TaskState,
    pub to: TaskState,
}

/// 单任务状态机：严格串行，无需内部锁
#[derive(Debug)]
pub struct TaskStateMachine {
    state: TaskState,
    log: Vec<(TaskState, TaskState)>,
    terminal_error: Option<TaskError>,
    api_attempts: u32,
    consecutive_tool_errors: u32,
}

impl TaskStateMachine {
    pub fn new() -> Self {
        Self {
            state: TaskState::Idle,
            log: Vec::new(),
            terminal_error: None,
            api_attempts: 0,
            consecutive_tool_errors: 0,
        }
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn transition(&mut self, next: TaskState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(from = %self.state, to = %next, "task transition");
        self.log.push((self.state, next));
        self.state = next;
        Ok(())
    }

    /// 进入 Aborted 并记录终止错误；已处于终态时返回 false（不重复触发）
    pub fn abort(&mut self, error: TaskError) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        tracing::warn!(
            from = %self.state,
            kind = %error.kind,
            message = %error.message,
            "task aborted"
        );
        self.log.push((self.state, TaskState::Aborted));
        self.state = TaskState::Aborted;
        self.terminal_error = Some(error);
        true
    }

    pub fn terminal_error(&self) -> Option<&TaskError> {
        self.terminal_error.as_ref()
    }

    /// 转移日志（from, to）
    pub fn log(&self) -> &[(TaskState, TaskState)] {
        &self.log
    }

    pub fn record_api_failure(&mut self) -> u32 {
        self.api_attempts += 1;
        self.api_attempts
    }

    pub fn reset_api_attempts(&mut self) {
        self.api_attempts = 0;
    }

    pub fn api_attempts(&self) -> u32 {
        self.api_attempts
    }

    pub fn record_tool_error(&mut self) -> u32 {
        self.consecutive_tool_errors += 1;
        self.consecutive_tool_errors
    }

    pub fn record_tool_success(&mut self) {
        self.consecutive_tool_errors = 0;
    }
}

impl Default for TaskStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// UI 看到的「投影」状态，轻量且易于渲染
#[derive(Clone, Debug, Serialize)]
pub struct UiState {
    pub phase: TaskState,
    pub history: Vec<Message>,
    pub active_tool: Option<String>,
    pub input_locked: bool,
    pub error_message: Option<String>,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            phase: TaskState::Idle,
            history: Vec::new(),
            active_tool: None,
            input_locked: false,
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut m = TaskStateMachine::new();
        m.transition(TaskState::WaitingForApi).unwrap();
        m.transition(TaskState::ProcessingResponse).unwrap();
        m.transition(TaskState::ExecutingTool).unwrap();
        m.transition(TaskState::ProcessingResponse).unwrap();
        m.transition(TaskState::WaitingForApi).unwrap();
        m.transition(TaskState::ProcessingResponse).unwrap();
        m.transition(TaskState::Completed).unwrap();
        assert_eq!(m.state(), TaskState::Completed);
        assert_eq!(m.log().len(), 7);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut m = TaskStateMachine::new();
        let err = m.transition(TaskState::ExecutingTool).unwrap_err();
        assert_eq!(err.from, TaskState::Idle);
        assert_eq!(err.to, TaskState::ExecutingTool);
        assert_eq!(m.state(), TaskState::Idle);
    }

    #[test]
    fn test_executing_tool_cannot_start_another_tool() {
        let mut m = TaskStateMachine::new();
        m.transition(TaskState::WaitingForApi).unwrap();
        m.transition(TaskState::ProcessingResponse).unwrap();
        m.transition(TaskState::ExecutingTool).unwrap();
        assert!(m.transition(TaskState::ExecutingTool).is_err());
    }

    #[test]
    fn test_abort_from_any_non_terminal_state() {
        for start in [
            TaskState::Idle,
            TaskState::WaitingForApi,
            TaskState::ProcessingResponse,
            TaskState::ExecutingTool,
            TaskState::WaitingForUser,
        ] {
            assert!(start.can_transition_to(TaskState::Aborted), "{start}");
        }
        assert!(!TaskState::Completed.can_transition_to(TaskState::Aborted));
    }

    #[test]
    fn test_abort_only_once() {
        let mut m = TaskStateMachine::new();
        assert!(m.abort(TaskError::unauthorized("bad key")));
        assert!(!m.abort(TaskError::user_abort("again")));
        assert_eq!(m.state(), TaskState::Aborted);
        assert_eq!(m.terminal_error().unwrap().message, "bad key");
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut m = TaskStateMachine::new();
        m.abort(TaskError::user_abort("stop"));
        assert!(m.transition(TaskState::WaitingForApi).is_err());
    }

    #[test]
    fn test_counters() {
        let mut m = TaskStateMachine::new();
        assert_eq!(m.record_api_failure(), 1);
        assert_eq!(m.record_api_failure(), 2);
        m.reset_api_attempts();
        assert_eq!(m.api_attempts(), 0);
        assert_eq!(m.record_tool_error(), 1);
        m.record_tool_success();
        assert_eq!(m.record_tool_error(), 1);
    }
}
