//! 工具层：Schema 注册表、工具 trait 与注册表、调度器、内置工具

pub mod definitions;
pub mod diagnostics;
pub mod dispatcher;
pub mod filesystem;
pub mod interaction;
pub mod registry;
pub mod schema;
pub mod search;
pub mod shell;
pub mod symbols;

use std::path::Path;
use std::sync::Arc;

pub use diagnostics::{DiagnosticsProvider, FileDiagnostic, NoDiagnostics};
pub use dispatcher::ToolDispatcher;
pub use filesystem::{ListFilesTool, ReadFileTool, SafeFs, WriteToFileTool};
pub use interaction::{AskFollowupQuestionTool, AttemptCompletionTool, SubmitReviewTool};
pub use registry::{Tool, ToolEffect, ToolOutput, ToolRegistry};
pub use schema::{FieldKind, FieldSpec, SchemaError, SchemaRegistry, ToolExample, ToolSchema};
pub use search::SearchFilesTool;
pub use shell::ExecuteCommandTool;
pub use symbols::{
    Definition, ListCodeDefinitionNamesTool, QueryTable, SymbolLookup, TreeSitterLookup,
};

use crate::config::ToolsSection;

/// 注册全部内置工具，工作区根目录为沙箱
pub fn builtin_tools(
    workspace: &Path,
    cfg: &ToolsSection,
    diagnostics: Arc<dyn DiagnosticsProvider>,
) -> Result<ToolRegistry, tree_sitter::QueryError> {
    let fs = SafeFs::new(workspace);
    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool::new(fs.clone(), cfg.max_read_bytes));
    registry.register(WriteToFileTool::new(fs.clone(), diagnostics));
    registry.register(ListFilesTool::new(fs.clone()));
    registry.register(SearchFilesTool::new(fs.clone(), cfg.search_max_results));
    registry.register(ExecuteCommandTool::new(
        cfg.shell.allowed_commands.clone(),
        fs.root().to_path_buf(),
    ));
    registry.register(ListCodeDefinitionNamesTool::new(
        fs,
        symbols::builtin_tables()?,
        TreeSitterLookup,
    ));
    registry.register(AskFollowupQuestionTool);
    registry.register(AttemptCompletionTool);
    registry.register(SubmitReviewTool);
    Ok(registry)
}
