//! 内置工具的 Schema 定义（描述 + 参数 + 示例），供 prompt 与校验器共用

use super::schema::{FieldSpec, SchemaError, SchemaRegistry, ToolSchema};

pub const READ_FILE: &str = "read_file";
pub const WRITE_TO_FILE: &str = "write_to_file";
pub const LIST_FILES: &str = "list_files";
pub const SEARCH_FILES: &str = "search_files";
pub const EXECUTE_COMMAND: &str = "execute_command";
pub const LIST_CODE_DEFINITION_NAMES: &str = "list_code_definition_names";
pub const ASK_FOLLOWUP_QUESTION: &str = "ask_followup_question";
pub const ATTEMPT_COMPLETION: &str = "attempt_completion";
pub const SUBMIT_REVIEW: &str = "submit_review";

/// 全部内置工具 Schema，按 prompt 中出现的顺序
pub fn builtin_schemas() -> Vec<ToolSchema> {
    vec![
        ToolSchema::new(
            READ_FILE,
            "Request to read the contents of a file at the specified path. Use this when you need to examine the contents of an existing file you do not know the contents of.",
        )
        .field(FieldSpec::text(
            "path",
            "The path of the file to read, relative to the workspace root",
        ))
        .example("Read the crate manifest", &[("path", "Cargo.toml")]),
        ToolSchema::new(
            WRITE_TO_FILE,
            "Request to write full content to a file at the specified path. If the file exists it will be overwritten, otherwise it will be created along with any missing directories.",
        )
        .field(FieldSpec::text(
            "path",
            "The path of the file to write to, relative to the workspace root",
        ))
        .field(
            FieldSpec::text(
                "content",
                "The complete content to write. Never truncate or use placeholders.",
            )
            .allow_empty(),
        )
        .example(
            "Create a small Rust program",
            &[
                ("path", "src/main.rs"),
                ("content", "fn main() {\n    println!(\"hello\");\n}"),
            ],
        ),
        ToolSchema::new(
            LIST_FILES,
            "Request to list files and directories within the specified directory. If recursive is true, it will list all files and directories recursively.",
        )
        .field(FieldSpec::text(
            "path",
            "The path of the directory to list, relative to the workspace root",
        ))
        .field(
            FieldSpec::enumerated(
                "recursive",
                "Whether to list files recursively",
                &["true", "false"],
            )
            .optional(),
        )
        .example(
            "List the source tree",
            &[("path", "src"), ("recursive", "true")],
        ),
        ToolSchema::new(
            SEARCH_FILES,
            "Request to perform a regex search across files in a specified directory, displaying each match with its file, line number and surrounding context.",
        )
        .field(FieldSpec::text(
            "path",
            "The directory to search recursively, relative to the workspace root",
        ))
        .field(FieldSpec::text(
            "regex",
            "The regular expression pattern to search for. Uses Rust regex syntax.",
        ))
        .field(
            FieldSpec::text(
                "file_pattern",
                "Glob pattern to filter files (e.g. '*.rs'). Searches all files when omitted.",
            )
            .optional(),
        )
        .example(
            "Find TODO markers in Rust sources",
            &[("path", "."), ("regex", "TODO"), ("file_pattern", "*.rs")],
        ),
        ToolSchema::new(
            EXECUTE_COMMAND,
            "Request to execute a CLI command in the workspace root. Only allowlisted programs may be run; explain what the command does.",
        )
        .field(FieldSpec::text("command", "The CLI command to execute"))
        .example("Run the test suite", &[("command", "cargo test")]),
        ToolSchema::new(
            LIST_CODE_DEFINITION_NAMES,
            "Request to list definition names (structs, functions, traits and so on) in source files at the top level of the specified directory.",
        )
        .field(FieldSpec::text(
            "path",
            "The directory to inspect, relative to the workspace root",
        ))
        .example("Outline the source directory", &[("path", "src")]),
        ToolSchema::new(
            ASK_FOLLOWUP_QUESTION,
            "Ask the user a question to gather additional information needed to complete the task. Use it when you encounter ambiguities.",
        )
        .field(FieldSpec::text(
            "question",
            "A clear, specific question for the user",
        ))
        .example(
            "Clarify the target platform",
            &[("question", "Should the CLI support Windows paths?")],
        ),
        ToolSchema::new(
            ATTEMPT_COMPLETION,
            "Once you can confirm the task is complete, present the result of your work to the user. The result must be final and must not end with a question.",
        )
        .field(FieldSpec::text("result", "The result of the task"))
        .example(
            "Report a finished refactor",
            &[("result", "Extracted the parser into its own module and added tests.")],
        ),
        ToolSchema::new(
            SUBMIT_REVIEW,
            "Submit your progress for review and wait for the user's feedback before continuing.",
        )
        .field(FieldSpec::text(
            "review",
            "A review payload with <progress_summary>, <questions> and <next_steps> sections",
        ))
        .example(
            "Ask for feedback on a plan",
            &[(
                "review",
                "<progress_summary>Parser done</progress_summary>\n<questions>Keep the old API?</questions>\n<next_steps>Wire the dispatcher</next_steps>",
            )],
        ),
    ]
}

impl SchemaRegistry {
    /// 内置工具注册表
    pub fn builtin() -> Result<Self, SchemaError> {
        Self::new(builtin_schemas())
    }
}
