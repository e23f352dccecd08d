//! Coder - Rust 编程智能体内核
//!
//! 模块划分：
//! - **agent**: 任务运行器（请求模型、流式提取、校验、调度、状态推进）与 system prompt
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类与恢复、组合取消、任务状态机、主控循环、优雅关闭
//! - **llm**: 模型流来源抽象与脚本化实现
//! - **memory**: 单任务对话历史
//! - **observability**: tracing 初始化
//! - **parser**: 工具片段流式提取、校验与 ToolCall
//! - **tools**: 工具 Schema、内置工具与调度器

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod parser;
pub mod tools;
