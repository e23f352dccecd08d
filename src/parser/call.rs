//! 校验后的工具调用

use std::collections::BTreeMap;

use serde::Serialize;

use crate::core::TaskError;

/// 字段值：封闭的带标签变体
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Enum(String),
    Nested(ToolInput),
}

impl FieldValue {
    /// Text 与 Enum 都按字符串读取
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) | FieldValue::Enum(s) => Some(s),
            FieldValue::Nested(_) => None,
        }
    }

    pub fn as_nested(&self) -> Option<&ToolInput> {
        match self {
            FieldValue::Nested(input) => Some(input),
            _ => None,
        }
    }
}

/// 字段名 -> 值
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ToolInput {
    fields: BTreeMap<String, FieldValue>,
}

impl ToolInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_str)
    }

    /// 工具实现读取必填字段；Schema 已保证存在，缺失视为 ToolError
    pub fn require_text(&self, name: &str) -> Result<&str, TaskError> {
        self.text(name)
            .ok_or_else(|| TaskError::tool(format!("missing field `{}`", name)))
    }

    pub fn nested(&self, name: &str) -> Option<&ToolInput> {
        self.get(name).and_then(FieldValue::as_nested)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, FieldValue)> for ToolInput {
    fn from_iter<I: IntoIterator<Item = (K, FieldValue)>>(iter: I) -> Self {
        let mut input = ToolInput::new();
        for (k, v) in iter {
            input.insert(k, v);
        }
        input
    }
}

/// 校验通过的工具调用；只由校验器构造，之后只读，由调度器按值消费
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCall {
    id: String,
    name: String,
    input: ToolInput,
    validated: bool,
}

impl ToolCall {
    pub(crate) fn new(name: impl Into<String>, input: ToolInput) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            input,
            validated: true,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input(&self) -> &ToolInput {
        &self.input
    }

    pub fn is_validated(&self) -> bool {
        self.validated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_accessors() {
        let nested: ToolInput = [("a", FieldValue::Text("1".into()))].into_iter().collect();
        let input: ToolInput = [
            ("path", FieldValue::Text("src/lib.rs".into())),
            ("recursive", FieldValue::Enum("true".into())),
            ("pair", FieldValue::Nested(nested)),
        ]
        .into_iter()
        .collect();

        assert_eq!(input.text("path"), Some("src/lib.rs"));
        assert_eq!(input.text("recursive"), Some("true"));
        assert_eq!(input.nested("pair").unwrap().text("a"), Some("1"));
        assert!(input.text("pair").is_none());
        assert!(input.require_text("missing").is_err());
    }

    #[test]
    fn test_call_ids_unique() {
        let a = ToolCall::new("read_file", ToolInput::new());
        let b = ToolCall::new("read_file", ToolInput::new());
        assert_ne!(a.id(), b.id());
        assert!(a.is_validated());
    }
}
