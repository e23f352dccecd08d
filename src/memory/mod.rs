//! 记忆层：单任务对话历史

pub mod conversation;

pub use conversation::{ConversationHistory, Message, Role};
