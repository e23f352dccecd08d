//! 工具调度器
//!
//! 检查当前任务状态是否允许执行（必须处于 ProcessingResponse，随后转入 ExecutingTool），
//! 按名取出工具，在带超时的子取消信号下执行；每次调用输出结构化审计日志（JSON）。
//! 副作用只发生在这里，提取与校验阶段不会触碰工作区。

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::{
    CancelReason, CancellationCoordinator, CancellationSignal, TaskError, TaskState,
    TaskStateMachine,
};
use crate::parser::ToolCall;
use crate::tools::{ToolOutput, ToolRegistry};

/// 工具调度器：持有注册表与单次调用超时
#[derive(Debug, Clone)]
pub struct ToolDispatcher {
    tools: Arc<ToolRegistry>,
    timeout: Option<Duration>,
}

impl ToolDispatcher {
    /// timeout 为 0 表示不限时
    pub fn new(tools: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self {
            tools,
            timeout: (!timeout.is_zero()).then_some(timeout),
        }
    }

    /// 执行一次校验过的调用
    ///
    /// 成功或工具报错时状态机停留在 ExecutingTool，由任务循环写回结果后再转移；
    /// 执行前被拒绝（不在回合内、工具不存在、已取消）时状态不变。
    pub async fn dispatch(
        &self,
        call: ToolCall,
        machine: &mut TaskStateMachine,
        signal: &CancellationSignal,
    ) -> Result<ToolOutput, TaskError> {
        if machine.state() != TaskState::ProcessingResponse || !call.is_validated() {
            tracing::warn!(
                tool = %call.name(),
                state = %machine.state(),
                "tool invoked out of turn"
            );
            return Err(TaskError::tool("tool invoked out of turn"));
        }
        let tool = self.tools.get(call.name()).ok_or_else(|| {
            TaskError::tool(format!("no capability registered for tool `{}`", call.name()))
        })?;
        signal.check()?;
        machine
            .transition(TaskState::ExecutingTool)
            .map_err(|e| TaskError::unknown(e.to_string()))?;

        let mut coordinator = CancellationCoordinator::with_parent(signal);
        if let Some(timeout) = self.timeout {
            coordinator = coordinator.with_timeout(timeout);
        }
        let child = coordinator.signal();
        let start = Instant::now();

        let result = tokio::select! {
            biased;
            _ = child.cancelled() => Err(self.cancelled_error(call.name(), signal, &child)),
            r = tool.execute(call.input(), &child) => r,
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(_) if child.reason() == Some(CancelReason::Timeout) && !signal.is_cancelled() => {
                "timeout"
            }
            Err(_) if signal.is_cancelled() => "cancelled",
            Err(_) => "error",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "call_id": call.id(),
            "tool": call.name(),
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&call),
        });
        tracing::info!(audit = %audit, "tool");

        result
    }

    fn cancelled_error(
        &self,
        tool: &str,
        parent: &CancellationSignal,
        child: &CancellationSignal,
    ) -> TaskError {
        if let Err(e) = parent.check() {
            return e;
        }
        match child.reason() {
            Some(CancelReason::Timeout) => TaskError::tool(format!(
                "tool `{}` timed out after {}s",
                tool,
                self.timeout.map(|t| t.as_secs()).unwrap_or_default()
            )),
            _ => TaskError::user_abort(format!("tool `{}` was cancelled", tool)),
        }
    }
}

fn args_preview(call: &ToolCall) -> String {
    let s = serde_json::to_string(call.input()).unwrap_or_default();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
