//! Headless 任务运行时
//!
//! create_agent_components 从配置构建 Schema 注册表、工具调度器、恢复策略与 system prompt，
//! 可被多个任务共享；Task 驱动单个任务的完整生命周期。

pub mod events;
pub mod prompt;
pub mod task;

pub use events::TaskEvent;
pub use prompt::build_system_prompt;
pub use task::{Task, TaskCanceller, TaskOutcome};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::core::{CancellationSignal, RecoveryEngine, RetryPolicy, TaskError};
use crate::llm::ModelClient;
use crate::tools::{builtin_tools, DiagnosticsProvider, SchemaError, SchemaRegistry, ToolDispatcher};

/// 组件构建失败（启动期错误）
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("invalid tool schema: {0}")]
    Schema(#[from] SchemaError),

    #[error("invalid symbol query: {0}")]
    Query(#[from] tree_sitter::QueryError),
}

/// 预构建的任务组件，可多任务共享
#[derive(Clone)]
pub struct AgentComponents {
    pub schemas: Arc<SchemaRegistry>,
    pub dispatcher: ToolDispatcher,
    pub model: Arc<dyn ModelClient>,
    pub recovery: RecoveryEngine,
    pub system_prompt: Arc<str>,
    pub max_requests_per_task: u32,
    pub task_timeout: Option<Duration>,
}

impl std::fmt::Debug for AgentComponents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentComponents")
            .field("tools", &self.schemas.names().collect::<Vec<_>>())
            .field("max_requests_per_task", &self.max_requests_per_task)
            .field("task_timeout", &self.task_timeout)
            .finish()
    }
}

/// 创建任务组件：内置 Schema + 内置工具（以 workspace 为沙箱）+ 配置中的限额与重试策略
pub fn create_agent_components(
    cfg: &AppConfig,
    workspace: &Path,
    model: Arc<dyn ModelClient>,
    diagnostics: Arc<dyn DiagnosticsProvider>,
) -> Result<AgentComponents, SetupError> {
    let schemas = Arc::new(SchemaRegistry::builtin()?);
    let tools = builtin_tools(workspace, &cfg.tools, diagnostics)?;
    for name in schemas.names() {
        if !tools.contains(name) {
            tracing::warn!(tool = %name, "tool schema has no registered capability");
        }
    }
    let system_prompt: Arc<str> = build_system_prompt(&schemas, workspace).into();
    Ok(AgentComponents {
        schemas,
        dispatcher: ToolDispatcher::new(
            Arc::new(tools),
            Duration::from_secs(cfg.tools.tool_timeout_secs),
        ),
        model,
        recovery: RecoveryEngine::new(RetryPolicy::from(&cfg.task)),
        system_prompt,
        max_requests_per_task: cfg.task.max_requests_per_task,
        task_timeout: cfg.task.task_timeout_secs.map(Duration::from_secs),
    })
}

/// 处理单条任务输入直到完成、等待用户或终止；event_tx 可选，用于流式推送过程事件
pub async fn process_task(
    components: &AgentComponents,
    input: &str,
    parent: &CancellationSignal,
    event_tx: Option<mpsc::UnboundedSender<TaskEvent>>,
) -> (Task, Result<TaskOutcome, TaskError>) {
    let mut task = Task::new(components, parent);
    if let Some(tx) = event_tx {
        task = task.with_events(tx);
    }
    let result = task.start(input).await;
    (task, result)
}
