//! 工具调用校验器
//!
//! 按 Schema 从片段正文中取出字段，转换为 ToolCall；任何结构问题都返回带字段名的 ToolError，
//! 由任务循环写回对话让模型自行修正。

use thiserror::Error;

use super::call::{FieldValue, ToolCall, ToolInput};
use super::extractor::{ExtractedFragment, FragmentKind};
use crate::core::TaskError;
use crate::tools::schema::{FieldKind, FieldSpec, SchemaRegistry, MAX_NESTED_DEPTH};

/// 校验失败原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unknown tool `{0}`")]
    UnknownTool(String),

    #[error("tool call `{0}` was cut off before its closing tag")]
    Truncated(String),

    #[error("missing required field `{0}`")]
    MissingField(String),

    #[error("field `{0}` must not be empty")]
    EmptyField(String),

    #[error("invalid value `{value}` for field `{field}`; expected one of: {}", allowed.join(", "))]
    InvalidEnum {
        field: String,
        value: String,
        allowed: Vec<String>,
    },

    #[error("field `{0}` is never closed")]
    UnclosedField(String),

    #[error("field `{0}` appears more than once")]
    DuplicateField(String),

    #[error("field `{0}` is nested too deeply")]
    TooDeep(String),
}

impl From<ValidationError> for TaskError {
    fn from(err: ValidationError) -> Self {
        TaskError::tool(err.to_string())
    }
}

/// 校验片段并构造 ToolCall
pub fn validate(
    fragment: &ExtractedFragment,
    registry: &SchemaRegistry,
) -> Result<ToolCall, TaskError> {
    validate_fragment(fragment, registry).map_err(|e| {
        tracing::debug!(tool = %fragment.tag_name, error = %e, "tool call rejected");
        TaskError::from(e)
    })
}

fn validate_fragment(
    fragment: &ExtractedFragment,
    registry: &SchemaRegistry,
) -> Result<ToolCall, ValidationError> {
    let schema = registry
        .get(&fragment.tag_name)
        .ok_or_else(|| ValidationError::UnknownTool(fragment.tag_name.clone()))?;
    if fragment.kind == FragmentKind::Partial {
        return Err(ValidationError::Truncated(fragment.tag_name.clone()));
    }
    let input = parse_fields(&fragment.raw_inner, &schema.fields, 1)?;
    Ok(ToolCall::new(schema.name.clone(), input))
}

fn parse_fields(
    body: &str,
    fields: &[FieldSpec],
    depth: usize,
) -> Result<ToolInput, ValidationError> {
    let sections = scan_sections(body, fields)?;
    let mut input = ToolInput::new();

    for spec in fields {
        let Some(raw) = sections.iter().find(|(n, _)| *n == spec.name).map(|(_, v)| *v) else {
            if spec.required {
                return Err(ValidationError::MissingField(spec.name.clone()));
            }
            continue;
        };

        let value = match &spec.kind {
            FieldKind::Text => {
                let text = strip_one_newline(raw);
                if text.trim().is_empty() && !spec.allow_empty {
                    return Err(ValidationError::EmptyField(spec.name.clone()));
                }
                FieldValue::Text(text.to_string())
            }
            FieldKind::Enum(allowed) => {
                let value = raw.trim();
                if value.is_empty() {
                    if spec.allow_empty {
                        continue;
                    }
                    return Err(ValidationError::EmptyField(spec.name.clone()));
                }
                if !allowed.iter().any(|a| a == value) {
                    return Err(ValidationError::InvalidEnum {
                        field: spec.name.clone(),
                        value: value.to_string(),
                        allowed: allowed.clone(),
                    });
                }
                FieldValue::Enum(value.to_string())
            }
            FieldKind::Nested(children) => {
                if depth >= MAX_NESTED_DEPTH {
                    return Err(ValidationError::TooDeep(spec.name.clone()));
                }
                let nested = parse_fields(raw, children, depth + 1)?;
                if nested.is_empty() && !spec.allow_empty {
                    return Err(ValidationError::EmptyField(spec.name.clone()));
                }
                FieldValue::Nested(nested)
            }
        };
        input.insert(spec.name.clone(), value);
    }
    Ok(input)
}

/// 在正文中找出已声明字段的 `<f>…</f>` 区段；字段体不再向内扫描，未声明的标签与字段间文本忽略
fn scan_sections<'a>(
    body: &'a str,
    fields: &'a [FieldSpec],
) -> Result<Vec<(&'a str, &'a str)>, ValidationError> {
    let mut sections: Vec<(&str, &str)> = Vec::new();
    let mut pos = 0;

    while let Some(rel) = body[pos..].find('<') {
        let at = pos + rel;
        let rest = &body[at..];
        let Some(spec) = fields
            .iter()
            .find(|f| rest.starts_with(&format!("<{}>", f.name)))
        else {
            pos = at + 1;
            continue;
        };

        let open = format!("<{}>", spec.name);
        let close = format!("</{}>", spec.name);
        let inner_start = at + open.len();
        let inner_end = find_balanced_close(&body[inner_start..], &open, &close)
            .map(|rel| inner_start + rel)
            .ok_or_else(|| ValidationError::UnclosedField(spec.name.clone()))?;

        if sections.iter().any(|(n, _)| *n == spec.name) {
            return Err(ValidationError::DuplicateField(spec.name.clone()));
        }
        sections.push((spec.name.as_str(), &body[inner_start..inner_end]));
        pos = inner_end + close.len();
    }
    Ok(sections)
}

/// 同名标签做深度计数，返回与外层开始标记配对的闭合标记位置
fn find_balanced_close(s: &str, open: &str, close: &str) -> Option<usize> {
    let mut depth = 1usize;
    let mut pos = 0;
    while let Some(rel) = s[pos..].find('<') {
        let at = pos + rel;
        let rest = &s[at..];
        if rest.starts_with(open) {
            depth += 1;
            pos = at + open.len();
        } else if rest.starts_with(close) {
            depth -= 1;
            if depth == 0 {
                return Some(at);
            }
            pos = at + close.len();
        } else {
            pos = at + 1;
        }
    }
    None
}

fn strip_one_newline(raw: &str) -> &str {
    let s = raw
        .strip_prefix("\r\n")
        .or_else(|| raw.strip_prefix('\n'))
        .unwrap_or(raw);
    s.strip_suffix("\r\n")
        .or_else(|| s.strip_suffix('\n'))
        .unwrap_or(s)
}
