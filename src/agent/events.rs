//! 任务过程事件：用于流式展示状态变化、模型文本、工具调用与结果

use serde::Serialize;

use crate::core::{TaskErrorKind, TaskState};

/// 单个任务的过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// 状态转移
    StateChanged { from: TaskState, to: TaskState },
    /// 工具标签之外的模型文本
    TextDelta { text: String },
    /// 提取器发现工具片段开始（每个片段一次）
    ToolDetected { tool: String },
    /// 片段尚未闭合时的累计正文，供前端预览
    ToolUpdate { tool: String, partial: String },
    /// 校验通过，开始执行
    ToolStarted { call_id: String, tool: String },
    /// 工具执行结束（预览，避免过长）
    ToolFinished {
        call_id: String,
        tool: String,
        ok: bool,
        preview: String,
    },
    /// 片段未通过校验或不允许执行
    ToolRejected { tool: String, reason: String },
    /// 模型请求失败，退避后重试
    ApiRetry {
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    /// 等待用户输入
    AwaitingUser { prompt: String },
    /// 任务完成
    Completed { result: String },
    /// 任务终止（每个任务至多一次）
    Aborted { kind: TaskErrorKind, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_shape() {
        let ev = TaskEvent::StateChanged {
            from: TaskState::Idle,
            to: TaskState::WaitingForApi,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "state_changed");
        assert_eq!(json["to"], "waiting_for_api");

        let ev = TaskEvent::Aborted {
            kind: TaskErrorKind::UserAbort,
            message: "Task cancelled by user".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "aborted");
        assert_eq!(json["kind"], "user_abort");

        let ev = TaskEvent::ToolUpdate {
            tool: "write_to_file".into(),
            partial: "<path>a.rs</path>".into(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "tool_update");
        assert_eq!(json["partial"], "<path>a.rs</path>");
    }
}
