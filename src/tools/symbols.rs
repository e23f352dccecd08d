//! 源码符号查找
//!
//! SymbolLookup 对单个文件内容按语言查询表找出定义；QueryTable 对查找器来说是不透明输入，
//! 内置的 TreeSitterLookup 用 tree-sitter 语法解析后执行查询（捕获 `@name` 加一个种类捕获）。
//! list_code_definition_names 对目录顶层的源码文件逐个查找并汇总。

use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;
use tree_sitter::{Language, Parser, Query, QueryCursor, QueryError};
use streaming_iterator::StreamingIterator;

use crate::core::{CancellationSignal, TaskError};
use crate::parser::ToolInput;
use crate::tools::definitions::LIST_CODE_DEFINITION_NAMES;
use crate::tools::filesystem::SafeFs;
use crate::tools::{Tool, ToolOutput};

/// 单次最多解析的源码文件数
const MAX_PARSED_FILES: usize = 50;
const MAX_LISTED_FILES: usize = 200;

const RUST_QUERY: &str = r#"
(function_item name: (identifier) @name) @fn
(struct_item name: (type_identifier) @name) @struct
(enum_item name: (type_identifier) @name) @enum
(trait_item name: (type_identifier) @name) @trait
(mod_item name: (identifier) @name) @mod
"#;

const PYTHON_QUERY: &str = r#"
(class_definition name: (identifier) @name) @class
(function_definition name: (identifier) @name) @def
"#;

const TYPESCRIPT_QUERY: &str = r#"
(class_declaration name: (type_identifier) @name) @class
(function_declaration name: (identifier) @name) @function
(interface_declaration name: (type_identifier) @name) @interface
"#;

const GO_QUERY: &str = r#"
(function_declaration name: (identifier) @name) @func
(method_declaration name: (field_identifier) @name) @func
(type_spec name: (type_identifier) @name) @type
"#;

/// 一个定义
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Definition {
    pub kind: String,
    pub name: String,
    /// 从 1 开始
    pub line: usize,
}

/// 某种语言的查询表：语法 + 编译好的查询
pub struct QueryTable {
    pub language: String,
    pub extensions: Vec<String>,
    grammar: Language,
    query: Query,
}

impl QueryTable {
    /// query 中每个模式捕获 `@name`，另一个捕获名即定义种类
    pub fn new(
        language: impl Into<String>,
        extensions: &[&str],
        grammar: Language,
        query: &str,
    ) -> Result<Self, QueryError> {
        let query = Query::new(&grammar, query)?;
        Ok(Self {
            language: language.into(),
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
            grammar,
            query,
        })
    }

    pub fn grammar(&self) -> &Language {
        &self.grammar
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn handles(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x == e))
            .unwrap_or(false)
    }
}

/// 内置查询表：Rust / Python / TypeScript / JavaScript / Go
pub fn builtin_tables() -> Result<Vec<QueryTable>, QueryError> {
    Ok(vec![
        QueryTable::new("rust", &["rs"], tree_sitter_rust::LANGUAGE.into(), RUST_QUERY)?,
        QueryTable::new("python", &["py"], tree_sitter_python::LANGUAGE.into(), PYTHON_QUERY)?,
        QueryTable::new(
            "typescript",
            &["ts"],
            tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
            TYPESCRIPT_QUERY,
        )?,
        // TSX 语法兼容普通 JavaScript
        QueryTable::new(
            "javascript",
            &["tsx", "js", "jsx"],
            tree_sitter_typescript::LANGUAGE_TSX.into(),
            TYPESCRIPT_QUERY,
        )?,
        QueryTable::new("go", &["go"], tree_sitter_go::LANGUAGE.into(), GO_QUERY)?,
    ])
}

/// 符号查找能力
pub trait SymbolLookup: Send + Sync {
    fn find_definitions(&self, content: &str, table: &QueryTable) -> Vec<Definition>;
}

/// 基于 tree-sitter 的查找；每次调用新建 Parser
#[derive(Debug, Default, Clone, Copy)]
pub struct TreeSitterLookup;

impl SymbolLookup for TreeSitterLookup {
    fn find_definitions(&self, content: &str, table: &QueryTable) -> Vec<Definition> {
        let mut parser = Parser::new();
        if let Err(e) = parser.set_language(table.grammar()) {
            tracing::warn!(language = %table.language, error = %e, "grammar rejected");
            return Vec::new();
        }
        let Some(tree) = parser.parse(content, None) else {
            return Vec::new();
        };

        let query = table.query();
        let names = query.capture_names();
        let mut cursor = QueryCursor::new();
        let mut matches = cursor.matches(query, tree.root_node(), content.as_bytes());
        let mut defs = Vec::new();
        while let Some(m) = matches.next() {
            let mut name = None;
            let mut kind = None;
            for cap in m.captures {
                match names[cap.index as usize] {
                    "name" => name = Some(cap.node),
                    other => kind = Some(other),
                }
            }
            let (Some(node), Some(kind)) = (name, kind) else {
                continue;
            };
            let Ok(text) = node.utf8_text(content.as_bytes()) else {
                continue;
            };
            defs.push(Definition {
                kind: kind.to_string(),
                name: text.to_string(),
                line: node.start_position().row + 1,
            });
        }
        defs.sort_by(|a, b| a.line.cmp(&b.line).then_with(|| a.name.cmp(&b.name)));
        defs.dedup();
        defs
    }
}

/// list_code_definition_names 工具
pub struct ListCodeDefinitionNamesTool<L = TreeSitterLookup> {
    fs: SafeFs,
    tables: Vec<QueryTable>,
    lookup: L,
}

impl<L: SymbolLookup> ListCodeDefinitionNamesTool<L> {
    pub fn new(fs: SafeFs, tables: Vec<QueryTable>, lookup: L) -> Self {
        Self { fs, tables, lookup }
    }

    /// 对目录顶层做一次汇总
    pub fn outline(&self, dir: &str) -> Result<String, TaskError> {
        let base = self.fs.resolve(dir)?;
        if !base.is_dir() {
            return Ok(format!("This directory does not exist or is not accessible: {}", dir));
        }
        let mut files: Vec<_> = std::fs::read_dir(&base)
            .map_err(|e| TaskError::tool(format!("List failed: {}", e)))?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.path())
            .filter(|p| {
                !p.file_name()
                    .map(|n| n.to_string_lossy().starts_with('.'))
                    .unwrap_or(true)
            })
            .collect();
        files.sort();
        files.truncate(MAX_LISTED_FILES);

        let mut result = String::new();
        let mut unparsed = Vec::new();
        let mut parsed = 0;
        for file in &files {
            let rel = self.fs.display(file);
            let table = self.tables.iter().find(|t| t.handles(file));
            let (Some(table), true) = (table, parsed < MAX_PARSED_FILES) else {
                unparsed.push(rel);
                continue;
            };
            parsed += 1;
            let Ok(content) = std::fs::read_to_string(file) else {
                unparsed.push(rel);
                continue;
            };
            let defs = self.lookup.find_definitions(&content, table);
            if defs.is_empty() {
                unparsed.push(rel);
                continue;
            }
            result.push_str(&rel);
            result.push('\n');
            for d in defs {
                result.push_str(&format!("  {:>4}: {} {}\n", d.line, d.kind, d.name));
            }
        }
        if !unparsed.is_empty() {
            result.push_str("UNPARSED FILES\n");
            for f in unparsed {
                result.push_str(&f);
                result.push('\n');
            }
        }
        if result.trim().is_empty() {
            return Ok("No source code definitions found.".to_string());
        }
        Ok(result.trim_end().to_string())
    }
}

#[async_trait]
impl<L: SymbolLookup + 'static> Tool for ListCodeDefinitionNamesTool<L> {
    fn name(&self) -> &str {
        LIST_CODE_DEFINITION_NAMES
    }

    async fn execute(
        &self,
        input: &ToolInput,
        _signal: &CancellationSignal,
    ) -> Result<ToolOutput, TaskError> {
        let path = input.require_text("path")?.trim();
        tracing::info!(path = %path, "list_code_definition_names");
        Ok(ToolOutput::text(self.outline(path)?))
    }
}
