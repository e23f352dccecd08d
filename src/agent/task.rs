//! 任务运行器
//!
//! 单个任务的异步驱动：请求模型 -> 流式提取 -> 校验 -> 逐个调度工具 -> 结果写回 -> 下一轮。
//! 每个挂起点（下一个 chunk、工具执行、退避等待）都与组合取消信号竞争（biased select），
//! 取消后丢弃正在进行的 future，写入中止记录并进入 Aborted。

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::agent::{AgentComponents, TaskEvent};
use crate::core::{
    CancelReason, CancellationCoordinator, CancellationSignal, RecoveryAction, RecoveryEngine,
    TaskError, TaskErrorKind, TaskState, TaskStateMachine,
};
use crate::llm::ModelClient;
use crate::memory::{ConversationHistory, Message};
use crate::parser::{validate, ExtractedFragment, FragmentExtractor, StreamItem};
use crate::tools::{SchemaRegistry, ToolDispatcher, ToolEffect};

/// ToolFinished 事件中的结果预览长度
const PREVIEW_CHARS: usize = 200;
/// 模型本轮没有任何输出时写入历史的占位文本
const EMPTY_TURN_PLACEHOLDER: &str = "Failure: I did not provide a response.";

/// start / resume 的非终止结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed { result: String },
    WaitingForUser { prompt: String },
}

/// 一轮结束后的去向
enum TurnEnd {
    /// 本轮写回了工具结果或错误，继续请求模型
    NextTurn,
    AwaitUser(String),
    Complete(String),
    /// 没有可执行的调用
    NoAction(String),
    /// 模型请求失败（打开或流中）
    Retry(TaskError),
}

/// 运行中取消任务的句柄（可跨任务克隆）
#[derive(Clone, Debug)]
pub struct TaskCanceller {
    coordinator: Arc<CancellationCoordinator>,
}

impl TaskCanceller {
    /// 只有第一次调用返回 true
    pub fn cancel(&self) -> bool {
        self.coordinator.cancel(CancelReason::UserAbort)
    }

    pub fn is_cancelled(&self) -> bool {
        self.coordinator.is_cancelled()
    }
}

/// 单个任务
pub struct Task {
    id: String,
    model: Arc<dyn ModelClient>,
    schemas: Arc<SchemaRegistry>,
    dispatcher: ToolDispatcher,
    recovery: RecoveryEngine,
    system_prompt: Arc<str>,
    max_requests: u32,
    task_timeout: Option<Duration>,

    machine: TaskStateMachine,
    history: ConversationHistory,
    coordinator: Arc<CancellationCoordinator>,
    /// 整个任务的超时来源，start 时创建
    timer: Option<CancellationCoordinator>,
    events: Option<mpsc::UnboundedSender<TaskEvent>>,

    requests: u32,
    pending_user_tool: Option<String>,
    turn_active: bool,
    turn_text: String,
    turn_results: Vec<Message>,
    /// 当前打开的片段已发出 ToolDetected
    fragment_announced: bool,
    /// 已通过 ToolUpdate 报告的正文长度
    partial_len: usize,
}

impl Task {
    /// parent：会话或进程级取消信号
    pub fn new(components: &AgentComponents, parent: &CancellationSignal) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model: components.model.clone(),
            schemas: components.schemas.clone(),
            dispatcher: components.dispatcher.clone(),
            recovery: components.recovery.clone(),
            system_prompt: components.system_prompt.clone(),
            max_requests: components.max_requests_per_task.max(1),
            task_timeout: components.task_timeout,
            machine: TaskStateMachine::new(),
            history: ConversationHistory::new(),
            coordinator: Arc::new(CancellationCoordinator::with_parent(parent)),
            timer: None,
            events: None,
            requests: 0,
            pending_user_tool: None,
            turn_active: false,
            turn_text: String::new(),
            turn_results: Vec::new(),
            fragment_announced: false,
            partial_len: 0,
        }
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<TaskEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TaskState {
        self.machine.state()
    }

    pub fn terminal_error(&self) -> Option<&TaskError> {
        self.machine.terminal_error()
    }

    pub fn history(&self) -> &[Message] {
        self.history.messages()
    }

    pub fn transitions(&self) -> &[(TaskState, TaskState)] {
        self.machine.log()
    }

    pub fn canceller(&self) -> TaskCanceller {
        TaskCanceller {
            coordinator: self.coordinator.clone(),
        }
    }

    /// 开始任务（只能从 Idle 调用）
    pub async fn start(&mut self, input: &str) -> Result<TaskOutcome, TaskError> {
        if self.machine.state() != TaskState::Idle {
            return Err(self.misuse("task has already been started"));
        }
        tracing::info!(task_id = %self.id, "task started");
        if let Some(timeout) = self.task_timeout {
            let timer = CancellationCoordinator::with_parent(&self.coordinator.signal());
            self.timer = Some(timer.with_timeout(timeout));
        }
        self.history.push(Message::user(format!("<task>\n{}\n</task>", input)));
        if let Err(err) = self.goto(TaskState::WaitingForApi) {
            return Err(self.fail(err));
        }
        self.drive().await
    }

    /// 提供用户输入后继续（只能从 WaitingForUser 调用）
    pub async fn resume(&mut self, input: &str) -> Result<TaskOutcome, TaskError> {
        if self.machine.state() != TaskState::WaitingForUser {
            return Err(self.misuse("task is not waiting for user input"));
        }
        if self.signal().is_cancelled() {
            let err = self.cancel_error();
            return Err(self.fail(err));
        }
        let message = match self.pending_user_tool.take() {
            Some(tool) => Message::tool_result(&tool, &format!("<answer>\n{}\n</answer>", input)),
            None => Message::user(input),
        };
        self.history.push(message);
        self.requests = 0;
        if let Err(err) = self.goto(TaskState::WaitingForApi) {
            return Err(self.fail(err));
        }
        self.drive().await
    }

    /// 取消：锁存信号；任务未在运行时立即进入 Aborted。只有真正导致中止的调用返回 true
    pub fn cancel(&mut self) -> bool {
        self.coordinator.cancel(CancelReason::UserAbort);
        if self.machine.state().is_terminal() {
            return false;
        }
        let err = self.cancel_error();
        self.fail(err);
        true
    }

    fn misuse(&self, message: &str) -> TaskError {
        self.machine
            .terminal_error()
            .cloned()
            .unwrap_or_else(|| TaskError::tool(message))
    }

    fn signal(&self) -> CancellationSignal {
        match &self.timer {
            Some(timer) => timer.signal(),
            None => self.coordinator.signal(),
        }
    }

    /// 用户取消 / 父信号优先于任务超时
    fn cancel_error(&self) -> TaskError {
        self.coordinator
            .signal()
            .check()
            .err()
            .or_else(|| self.timer.as_ref().and_then(|t| t.signal().check().err()))
            .unwrap_or_else(|| TaskError::user_abort("Task cancelled"))
    }

    fn emit(&self, event: TaskEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn goto(&mut self, next: TaskState) -> Result<(), TaskError> {
        let from = self.machine.state();
        self.machine
            .transition(next)
            .map_err(|e| TaskError::unknown(e.to_string()))?;
        self.emit(TaskEvent::StateChanged { from, to: next });
        Ok(())
    }

    /// 进入 Aborted；重复调用不会产生第二个 Aborted 事件
    fn fail(&mut self, err: TaskError) -> TaskError {
        self.flush_turn();
        let from = self.machine.state();
        if self.machine.abort(err.clone()) {
            self.history.push(Message::system(format!(
                "[{}] Task aborted: {}",
                err.kind, err.message
            )));
            self.emit(TaskEvent::StateChanged {
                from,
                to: TaskState::Aborted,
            });
            self.emit(TaskEvent::Aborted {
                kind: err.kind,
                message: err.message.clone(),
            });
        }
        self.machine.terminal_error().cloned().unwrap_or(err)
    }

    /// 本轮 assistant 原文与工具结果按顺序写入历史
    fn flush_turn(&mut self) {
        if !self.turn_active {
            return;
        }
        self.turn_active = false;
        let text = std::mem::take(&mut self.turn_text);
        if text.trim().is_empty() {
            self.history.push(Message::assistant(EMPTY_TURN_PLACEHOLDER));
        } else {
            self.history.push(Message::assistant(text));
        }
        for msg in self.turn_results.drain(..) {
            self.history.push(msg);
        }
    }

    async fn drive(&mut self) -> Result<TaskOutcome, TaskError> {
        match self.drive_turns().await {
            Ok(outcome) => Ok(outcome),
            Err(err) => Err(self.fail(err)),
        }
    }

    async fn drive_turns(&mut self) -> Result<TaskOutcome, TaskError> {
        loop {
            let end = self.run_turn().await?;
            self.flush_turn();
            match end {
                TurnEnd::Complete(result) => {
                    tracing::info!(task_id = %self.id, "task completed");
                    self.emit(TaskEvent::Completed {
                        result: result.clone(),
                    });
                    return Ok(TaskOutcome::Completed { result });
                }
                TurnEnd::AwaitUser(prompt) => {
                    self.emit(TaskEvent::AwaitingUser {
                        prompt: prompt.clone(),
                    });
                    return Ok(TaskOutcome::WaitingForUser { prompt });
                }
                TurnEnd::NoAction(prompt) => {
                    self.machine.reset_api_attempts();
                    self.goto(TaskState::WaitingForUser)?;
                    self.emit(TaskEvent::AwaitingUser {
                        prompt: prompt.clone(),
                    });
                    return Ok(TaskOutcome::WaitingForUser { prompt });
                }
                TurnEnd::NextTurn => {
                    self.machine.reset_api_attempts();
                    if self.requests >= self.max_requests {
                        let prompt = format!(
                            "Reached the limit of {} model requests for this task. Reply to let it continue.",
                            self.max_requests
                        );
                        tracing::warn!(
                            task_id = %self.id,
                            requests = self.requests,
                            "request limit reached"
                        );
                        self.goto(TaskState::WaitingForUser)?;
                        self.emit(TaskEvent::AwaitingUser {
                            prompt: prompt.clone(),
                        });
                        return Ok(TaskOutcome::WaitingForUser { prompt });
                    }
                    self.goto(TaskState::WaitingForApi)?;
                }
                TurnEnd::Retry(err) => {
                    let attempt = self.machine.record_api_failure();
                    let action = self.recovery.handle(&err, attempt);
                    let RecoveryAction::RetryAfter(delay) = action else {
                        return Err(err);
                    };
                    tracing::warn!(
                        task_id = %self.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "model request failed, retrying"
                    );
                    self.emit(TaskEvent::ApiRetry {
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        reason: err.message.clone(),
                    });
                    if self.machine.state() == TaskState::ProcessingResponse {
                        self.goto(TaskState::WaitingForApi)?;
                    }
                    let signal = self.signal();
                    tokio::select! {
                        biased;
                        _ = signal.cancelled() => return Err(self.cancel_error()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// 一轮模型请求；进入时处于 WaitingForApi
    async fn run_turn(&mut self) -> Result<TurnEnd, TaskError> {
        let signal = self.signal();
        signal.check()?;
        self.requests += 1;
        tracing::debug!(task_id = %self.id, request = self.requests, "requesting model turn");

        let opened = tokio::select! {
            biased;
            _ = signal.cancelled() => return Err(self.cancel_error()),
            r = self.model.stream_turn(&self.system_prompt, self.history.messages(), &signal) => r,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => return Ok(TurnEnd::Retry(e.into())),
        };
        self.turn_active = true;
        self.fragment_announced = false;
        self.partial_len = 0;

        let mut extractor = FragmentExtractor::new(self.schemas.clone());
        let mut end = None;
        loop {
            let next = tokio::select! {
                biased;
                _ = signal.cancelled() => return Err(self.cancel_error()),
                next = stream.next() => next,
            };
            match next {
                None => break,
                Some(Err(e)) => {
                    // 未闭合的片段不是模型的错，直接丢弃
                    tracing::warn!(task_id = %self.id, error = %e, "model stream failed mid-turn");
                    return Ok(TurnEnd::Retry(e.into()));
                }
                Some(Ok(chunk)) => {
                    if self.machine.state() == TaskState::WaitingForApi {
                        self.goto(TaskState::ProcessingResponse)?;
                    }
                    self.turn_text.push_str(&chunk);
                    let items = extractor.push(&chunk);
                    end = self.handle_items(items, &signal).await?;
                    if end.is_some() {
                        // 本轮已交给用户或完成，剩余输出不再读取
                        break;
                    }
                    self.report_progress(&extractor);
                }
            }
        }
        drop(stream);

        if end.is_none() {
            if self.machine.state() == TaskState::WaitingForApi {
                self.goto(TaskState::ProcessingResponse)?;
            }
            let items = extractor.finish();
            end = self.handle_items(items, &signal).await?;
        }

        Ok(match end {
            Some(end) => end,
            None if self.turn_results.is_empty() => {
                let text = self.turn_text.trim();
                TurnEnd::NoAction(if text.is_empty() {
                    "The model returned no actionable response.".to_string()
                } else {
                    text.to_string()
                })
            }
            None => TurnEnd::NextTurn,
        })
    }

    /// 按顺序处理提取结果；同一时刻最多一个工具在执行
    async fn handle_items(
        &mut self,
        items: Vec<StreamItem>,
        signal: &CancellationSignal,
    ) -> Result<Option<TurnEnd>, TaskError> {
        let mut end = None;
        for item in items {
            match item {
                StreamItem::Text(text) => {
                    if end.is_none() {
                        self.emit(TaskEvent::TextDelta { text });
                    }
                }
                StreamItem::Fragment(fragment) => {
                    if !std::mem::take(&mut self.fragment_announced) {
                        self.emit(TaskEvent::ToolDetected {
                            tool: fragment.tag_name.clone(),
                        });
                    }
                    if end.is_some() {
                        let reason =
                            "Skipped: an earlier tool call in this message already ended the turn";
                        self.emit(TaskEvent::ToolRejected {
                            tool: fragment.tag_name.clone(),
                            reason: reason.to_string(),
                        });
                        self.turn_results
                            .push(Message::tool_error(&fragment.tag_name, reason));
                        continue;
                    }
                    end = self.handle_fragment(fragment, signal).await?;
                }
            }
        }
        Ok(end)
    }

    /// 打开的片段：首次出现发 ToolDetected，正文增长时发 ToolUpdate
    fn report_progress(&mut self, extractor: &FragmentExtractor) {
        let Some((tool, partial)) = extractor.in_progress() else {
            return;
        };
        if !self.fragment_announced {
            self.fragment_announced = true;
            self.partial_len = 0;
            self.emit(TaskEvent::ToolDetected {
                tool: tool.to_string(),
            });
        }
        if partial.len() > self.partial_len {
            self.partial_len = partial.len();
            self.emit(TaskEvent::ToolUpdate {
                tool: tool.to_string(),
                partial: partial.to_string(),
            });
        }
    }

    async fn handle_fragment(
        &mut self,
        fragment: ExtractedFragment,
        signal: &CancellationSignal,
    ) -> Result<Option<TurnEnd>, TaskError> {
        let tool = fragment.tag_name.clone();
        let call = match validate(&fragment, &self.schemas) {
            Ok(call) => call,
            Err(err) => {
                self.emit(TaskEvent::ToolRejected {
                    tool: tool.clone(),
                    reason: err.message.clone(),
                });
                self.feed_back_failure(&tool, err)?;
                return Ok(None);
            }
        };

        let call_id = call.id().to_string();
        self.emit(TaskEvent::ToolStarted {
            call_id: call_id.clone(),
            tool: tool.clone(),
        });
        let result = self.dispatcher.dispatch(call, &mut self.machine, signal).await;

        match result {
            Ok(output) => {
                self.machine.record_tool_success();
                self.emit(TaskEvent::ToolFinished {
                    call_id,
                    tool: tool.clone(),
                    ok: true,
                    preview: preview(&output.text),
                });
                match output.effect {
                    ToolEffect::Continue => {
                        self.turn_results.push(Message::tool_result(&tool, &output.text));
                        self.goto(TaskState::ProcessingResponse)?;
                        Ok(None)
                    }
                    ToolEffect::AwaitUser => {
                        self.pending_user_tool = Some(tool);
                        self.goto(TaskState::WaitingForUser)?;
                        Ok(Some(TurnEnd::AwaitUser(output.text)))
                    }
                    ToolEffect::Complete => {
                        self.turn_results.push(Message::tool_result(&tool, &output.text));
                        self.goto(TaskState::Completed)?;
                        Ok(Some(TurnEnd::Complete(output.text)))
                    }
                }
            }
            Err(err) if err.is_terminal() => Err(err),
            Err(err) => {
                self.emit(TaskEvent::ToolFinished {
                    call_id,
                    tool: tool.clone(),
                    ok: false,
                    preview: preview(&err.message),
                });
                if self.machine.state() == TaskState::ExecutingTool {
                    self.goto(TaskState::ProcessingResponse)?;
                }
                self.feed_back_failure(&tool, err)?;
                Ok(None)
            }
        }
    }

    /// 可恢复的工具失败作为工具结果写回，让模型决定是否重试；
    /// 连续失败次数超过恢复策略的上限则终止
    fn feed_back_failure(&mut self, tool: &str, err: TaskError) -> Result<(), TaskError> {
        let attempt = self.machine.record_tool_error();
        self.turn_results.push(Message::tool_error(tool, &err.message));
        match self.recovery.handle(&err, attempt) {
            RecoveryAction::FeedBackToModel(_) | RecoveryAction::RetryAfter(_) => {
                tracing::warn!(
                    task_id = %self.id,
                    tool = %tool,
                    kind = %err.kind,
                    attempt,
                    error = %err.message,
                    "tool failure fed back to model"
                );
                Ok(())
            }
            RecoveryAction::Abort if err.kind == TaskErrorKind::ToolError => Err(TaskError::tool(
                format!("{} consecutive tool errors; last: {}", attempt, err.message),
            )),
            RecoveryAction::Abort => Err(err),
        }
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > PREVIEW_CHARS {
        format!("{}...", text.chars().take(PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}
