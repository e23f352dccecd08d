//! 工具调用协议解析：流式提取 + Schema 校验

pub mod call;
pub mod extractor;
pub mod validator;

pub use call::{FieldValue, ToolCall, ToolInput};
pub use extractor::{ExtractedFragment, FragmentExtractor, FragmentKind, StreamItem};
pub use validator::{validate, ValidationError};
