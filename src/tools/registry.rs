//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / execute），由 ToolRegistry 按名注册与查找；
//! 调度器在 ExecutingTool 期间按名取出并执行。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{CancellationSignal, TaskError};
use crate::parser::ToolInput;

/// 工具执行后任务该怎么走
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolEffect {
    /// 结果写回对话，继续下一轮
    Continue,
    /// 需要用户回应（提问、评审）
    AwaitUser,
    /// 任务完成
    Complete,
}

/// 工具输出
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub text: String,
    pub effect: ToolEffect,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            effect: ToolEffect::Continue,
        }
    }

    pub fn await_user(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            effect: ToolEffect::AwaitUser,
        }
    }

    pub fn complete(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            effect: ToolEffect::Complete,
        }
    }
}

/// 工具 trait：名称 + 异步执行（输入已通过 Schema 校验）
///
/// 长时间运行的工具应自行观察 signal；调度器也会在取消时直接丢弃 future。
#[async_trait]
pub trait Tool: Send + Sync {
    /// 与 Schema 中的工具名一致
    fn name(&self) -> &str;

    async fn execute(
        &self,
        input: &ToolInput,
        signal: &CancellationSignal,
    ) -> Result<ToolOutput, TaskError>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "tool registered twice, replacing previous");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tool_names())
            .finish()
    }
}
