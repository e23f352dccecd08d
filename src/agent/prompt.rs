//! System prompt 构建：角色说明 + 工具调用格式规则 + 各工具 Schema 段落

use std::path::Path;

use crate::tools::SchemaRegistry;

const ROLE: &str = "You are a highly skilled software engineer working inside the user's workspace. \
You accomplish the user's task step by step, using one tool per message and waiting for its result before continuing.";

const FORMAT_RULES: &str = "# Tool Use Formatting

Tool use is formatted using XML-style tags. The tool name is enclosed in opening and closing tags, \
and each parameter is similarly enclosed within its own set of tags:

<tool_name>
<parameter1_name>value1</parameter1_name>
<parameter2_name>value2</parameter2_name>
</tool_name>

Always adhere to this format so the tool call can be parsed. Use exactly one tool per message; \
the result arrives in the next user message as `[tool_name] Result: ...` or `[tool_name] Error: ...`.";

const RULES: &str = "# Rules

- Paths are relative to the workspace root; you cannot leave it.
- Provide complete file content when writing; never use placeholders.
- When the task is done, call attempt_completion. If you need information only the user has, call ask_followup_question.";

/// 拼装完整的 system prompt
pub fn build_system_prompt(registry: &SchemaRegistry, workspace: &Path) -> String {
    format!(
        "{ROLE}\n\n====\n\n{FORMAT_RULES}\n\n# Tools\n\n{}\n====\n\n{RULES}\n\n# Workspace\n\nCurrent working directory: {}\n",
        registry.render_prompt(),
        workspace.display()
    )
}
