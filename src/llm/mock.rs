//! 脚本化模型客户端（用于测试与离线运行，无需 API）
//!
//! 每次 stream_turn 取出下一段预先写好的输出，按 chunk 流式返回；可注入打开失败或流中失败，
//! 并记录每次请求看到的对话历史，便于断言。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};

use crate::core::CancellationSignal;
use crate::llm::{ChunkStream, LlmError, ModelClient};
use crate::memory::Message;

/// 一轮脚本输出
#[derive(Debug, Clone, Default)]
pub struct ScriptedTurn {
    chunks: Vec<String>,
    open_error: Option<LlmError>,
    /// 产出 n 个 chunk 后返回的错误
    fail_after: Option<(usize, LlmError)>,
    chunk_delay: Option<Duration>,
}

impl ScriptedTurn {
    /// 整段文本作为一个 chunk
    pub fn text(text: impl Into<String>) -> Self {
        Self::chunks([text.into()])
    }

    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// 按字符数切成小块，模拟逐 token 流
    pub fn split(text: &str, chunk_chars: usize) -> Self {
        let chars: Vec<char> = text.chars().collect();
        Self::chunks(
            chars
                .chunks(chunk_chars.max(1))
                .map(|c| c.iter().collect::<String>()),
        )
    }

    /// 请求本身失败
    pub fn error(err: LlmError) -> Self {
        Self {
            open_error: Some(err),
            ..Self::default()
        }
    }

    pub fn fail_after(mut self, n: usize, err: LlmError) -> Self {
        self.fail_after = Some((n, err));
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }
}

/// 脚本化客户端
#[derive(Debug, Default)]
pub struct ScriptedModelClient {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedModelClient {
    pub fn new(turns: impl IntoIterator<Item = ScriptedTurn>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 解析转录文本：各轮之间以单独一行 `---` 分隔，每轮按 chunk_chars 切块
    pub fn from_transcript(transcript: &str, chunk_chars: usize) -> Self {
        let mut turns = Vec::new();
        let mut current = String::new();
        for line in transcript.lines() {
            if line.trim() == "---" {
                turns.push(std::mem::take(&mut current));
            } else {
                current.push_str(line);
                current.push('\n');
            }
        }
        if !current.trim().is_empty() {
            turns.push(current);
        }
        Self::new(
            turns
                .into_iter()
                .map(|t| ScriptedTurn::split(t.trim_end_matches('\n'), chunk_chars)),
        )
    }

    pub fn push_turn(&self, turn: ScriptedTurn) {
        if let Ok(mut turns) = self.turns.lock() {
            turns.push_back(turn);
        }
    }

    /// 已收到的请求数
    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// 每次请求时的对话历史快照
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn remaining_turns(&self) -> usize {
        self.turns.lock().map(|t| t.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn stream_turn(
        &self,
        _system: &str,
        messages: &[Message],
        _signal: &CancellationSignal,
    ) -> Result<ChunkStream, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(messages.to_vec());
        }
        let turn = self
            .turns
            .lock()
            .ok()
            .and_then(|mut t| t.pop_front())
            .ok_or_else(|| LlmError::Other("scripted model has no more turns".to_string()))?;
        if let Some(err) = turn.open_error {
            return Err(err);
        }

        let mut items: Vec<Result<String, LlmError>> = Vec::new();
        match turn.fail_after {
            Some((n, err)) => {
                items.extend(turn.chunks.into_iter().take(n).map(Ok));
                items.push(Err(err));
            }
            None => items.extend(turn.chunks.into_iter().map(Ok)),
        }

        let s = stream::iter(items);
        Ok(match turn.chunk_delay {
            Some(delay) => s
                .then(move |item| async move {
                    tokio::time::sleep(delay).await;
                    item
                })
                .boxed(),
            None => s.boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(stream: ChunkStream) -> Vec<Result<String, LlmError>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn test_turns_in_order() {
        let client = ScriptedModelClient::new([ScriptedTurn::text("one"), ScriptedTurn::split("two!", 2)]);
        let never = CancellationSignal::never();
        let first = collect(client.stream_turn("", &[], &never).await.unwrap()).await;
        assert_eq!(first, vec![Ok("one".to_string())]);
        let second = collect(client.stream_turn("", &[Message::user("hi")], &never).await.unwrap()).await;
        assert_eq!(second, vec![Ok("tw".to_string()), Ok("o!".to_string())]);
        assert_eq!(client.request_count(), 2);
        assert_eq!(client.requests()[1][0].content, "hi");
        assert!(client.stream_turn("", &[], &never).await.is_err());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let client = ScriptedModelClient::new([
            ScriptedTurn::error(LlmError::http(503, "busy")),
            ScriptedTurn::chunks(["a", "b", "c"]).fail_after(1, LlmError::Transport("reset".into())),
        ]);
        let never = CancellationSignal::never();
        assert!(matches!(
            client.stream_turn("", &[], &never).await,
            Err(LlmError::Http { status: 503, .. })
        ));
        let items = collect(client.stream_turn("", &[], &never).await.unwrap()).await;
        assert_eq!(items.len(), 2);
        assert!(items[1].is_err());
    }

    #[test]
    fn test_from_transcript() {
        let client = ScriptedModelClient::from_transcript("first turn\n---\nsecond\nturn\n", 4);
        assert_eq!(client.remaining_turns(), 2);
    }
}
