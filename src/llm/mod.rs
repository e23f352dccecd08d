//! LLM 层：模型流来源抽象与脚本化实现

pub mod mock;
pub mod traits;

pub use mock::{ScriptedModelClient, ScriptedTurn};
pub use traits::{ChunkStream, LlmError, ModelClient};
