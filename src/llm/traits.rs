//! 模型流来源抽象
//!
//! 任务循环只依赖 ModelClient：给定 system prompt 与对话历史，返回本轮输出的文本 chunk 流。
//! 具体的 HTTP 提供方在本 crate 之外实现。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

use crate::core::{CancellationSignal, TaskError};
use crate::memory::Message;

/// 本轮输出的 chunk 流
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// 模型请求失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// 提供方返回的 HTTP 状态
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// 连接、读取中断等传输层错误
    #[error("transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    Other(String),
}

impl LlmError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        LlmError::Http {
            status,
            message: message.into(),
        }
    }
}

/// 401 -> Unauthorized，402 -> PaymentRequired，传输 / 408 / 429 / 5xx -> ApiError，其余 -> Unknown
impl From<LlmError> for TaskError {
    fn from(err: LlmError) -> Self {
        let message = err.to_string();
        match err {
            LlmError::Http { status: 401, .. } => TaskError::unauthorized(message),
            LlmError::Http { status: 402, .. } => TaskError::payment_required(message),
            LlmError::Http {
                status: 408 | 429 | 500..=599,
                ..
            } => TaskError::api(message),
            LlmError::Transport(_) => TaskError::api(message),
            LlmError::Http { .. } | LlmError::Other(_) => TaskError::unknown(message),
        }
    }
}

/// 模型客户端：一次调用对应一轮模型输出
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream_turn(
        &self,
        system: &str,
        messages: &[Message],
        signal: &CancellationSignal,
    ) -> Result<ChunkStream, LlmError>;
}
