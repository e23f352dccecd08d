//! 工具 Schema 注册表
//!
//! 每个工具声明有序字段（text / enum / nested、必填与否、是否允许空值）和示例调用。
//! 注册表在启动时一次性构建，之后只读，通过 Arc 传给提取器、校验器和调度器。
//! render_prompt 把所有 Schema 编码成注入 system prompt 的 XML 调用说明。

use std::collections::{HashMap, HashSet};

use thiserror::Error;

/// 嵌套字段最大深度（二次提取的边界）
pub const MAX_NESTED_DEPTH: usize = 4;

/// 字段类型：封闭集合，按变体分派
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    /// 只能取列出的值之一
    Enum(Vec<String>),
    /// 字段体内再按子字段提取
    Nested(Vec<FieldSpec>),
}

/// 单个字段声明
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    pub allow_empty: bool,
    pub description: String,
}

impl FieldSpec {
    /// 必填文本字段
    pub fn text(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Text,
            required: true,
            allow_empty: false,
            description: description.into(),
        }
    }

    pub fn enumerated(
        name: impl Into<String>,
        description: impl Into<String>,
        values: &[&str],
    ) -> Self {
        Self {
            kind: FieldKind::Enum(values.iter().map(|v| v.to_string()).collect()),
            ..Self::text(name, description)
        }
    }

    pub fn nested(
        name: impl Into<String>,
        description: impl Into<String>,
        fields: Vec<FieldSpec>,
    ) -> Self {
        Self {
            kind: FieldKind::Nested(fields),
            ..Self::text(name, description)
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn allow_empty(mut self) -> Self {
        self.allow_empty = true;
        self
    }
}

/// 示例调用：字段名 -> 原始文本
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolExample {
    pub description: String,
    pub params: Vec<(String, String)>,
}

/// 单个工具的 Schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub fields: Vec<FieldSpec>,
    pub examples: Vec<ToolExample>,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            fields: Vec::new(),
            examples: Vec::new(),
        }
    }

    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn example(mut self, description: impl Into<String>, params: &[(&str, &str)]) -> Self {
        self.examples.push(ToolExample {
            description: description.into(),
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
        self
    }

    pub fn field_spec(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// 以协议格式渲染一次调用
    pub fn render_call(&self, params: &[(String, String)]) -> String {
        let mut out = format!("<{}>\n", self.name);
        for (name, value) in params {
            out.push_str(&format!("<{name}>{value}</{name}>\n"));
        }
        out.push_str(&format!("</{}>", self.name));
        out
    }

    pub fn render_example(&self, example: &ToolExample) -> String {
        self.render_call(&example.params)
    }

    /// 工具在 prompt 中的说明段落
    pub fn render_prompt(&self) -> String {
        let mut out = format!("## {}\nDescription: {}\nParameters:\n", self.name, self.description);
        render_fields(&self.fields, 0, &mut out);

        let usage: Vec<(String, String)> = self
            .fields
            .iter()
            .map(|f| (f.name.clone(), format!("{} here", f.name.replace('_', " "))))
            .collect();
        out.push_str("Usage:\n");
        out.push_str(&self.render_call(&usage));
        out.push('\n');

        if !self.examples.is_empty() {
            out.push_str("Examples:\n");
            for example in &self.examples {
                out.push_str(&format!("<!-- {} -->\n", example.description));
                out.push_str(&self.render_example(example));
                out.push('\n');
            }
        }
        out
    }
}

fn render_fields(fields: &[FieldSpec], indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    for f in fields {
        let mut flags = vec![if f.required { "required" } else { "optional" }.to_string()];
        if let FieldKind::Enum(values) = &f.kind {
            flags.push(format!("one of: {}", values.join(" | ")));
        }
        if f.allow_empty {
            flags.push("may be empty".to_string());
        }
        out.push_str(&format!("{pad}- {}: ({}) {}\n", f.name, flags.join(", "), f.description));
        if let FieldKind::Nested(children) = &f.kind {
            render_fields(children, indent + 1, out);
        }
    }
}

/// Schema 构建错误（启动期）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("duplicate tool schema: {0}")]
    DuplicateTool(String),

    #[error("duplicate field `{field}` in tool {tool}")]
    DuplicateField { tool: String, field: String },

    #[error("invalid tag name: {0:?}")]
    InvalidName(String),

    #[error("example for {tool} uses undeclared field `{field}`")]
    UnknownExampleField { tool: String, field: String },

    #[error("nested fields of {tool} exceed depth {max}")]
    TooDeep { tool: String, max: usize },
}

/// 只读 Schema 注册表
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: Vec<ToolSchema>,
    index: HashMap<String, usize>,
}

impl SchemaRegistry {
    /// 校验并构建注册表：工具名唯一、字段名唯一、标签名合法、示例字段已声明
    pub fn new(schemas: Vec<ToolSchema>) -> Result<Self, SchemaError> {
        let mut index = HashMap::new();
        for (i, schema) in schemas.iter().enumerate() {
            check_name(&schema.name)?;
            if index.insert(schema.name.clone(), i).is_some() {
                return Err(SchemaError::DuplicateTool(schema.name.clone()));
            }
            check_fields(&schema.name, &schema.fields, 1)?;
            for example in &schema.examples {
                for (field, _) in &example.params {
                    if schema.field_spec(field).is_none() {
                        return Err(SchemaError::UnknownExampleField {
                            tool: schema.name.clone(),
                            field: field.clone(),
                        });
                    }
                }
            }
        }
        Ok(Self { schemas, index })
    }

    pub fn get(&self, name: &str) -> Option<&ToolSchema> {
        self.index.get(name).map(|&i| &self.schemas[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.schemas.iter().map(|s| s.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolSchema> {
        self.schemas.iter()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// 最长工具名（提取器据此决定保留多少待定字符）
    pub fn max_name_len(&self) -> usize {
        self.schemas.iter().map(|s| s.name.len()).max().unwrap_or(0)
    }

    /// 所有工具的 prompt 段落
    pub fn render_prompt(&self) -> String {
        self.schemas
            .iter()
            .map(|s| s.render_prompt())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn check_name(name: &str) -> Result<(), SchemaError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(SchemaError::InvalidName(name.to_string()))
    }
}

fn check_fields(tool: &str, fields: &[FieldSpec], depth: usize) -> Result<(), SchemaError> {
    if depth > MAX_NESTED_DEPTH {
        return Err(SchemaError::TooDeep {
            tool: tool.to_string(),
            max: MAX_NESTED_DEPTH,
        });
    }
    let mut seen = HashSet::new();
    for f in fields {
        check_name(&f.name)?;
        if !seen.insert(f.name.as_str()) {
            return Err(SchemaError::DuplicateField {
                tool: tool.to_string(),
                field: f.name.clone(),
            });
        }
        if let FieldKind::Nested(children) = &f.kind {
            check_fields(tool, children, depth + 1)?;
        }
    }
    Ok(())
}
