//! 取消协调器：组合取消信号
//!
//! 用户中止、超时、父信号（会话 / 进程关闭）等多个来源合并为一个 CancellationSignal。
//! 任一来源触发后信号永久锁存为已取消；记录最先触发的原因。底层基于 tokio_util 的 CancellationToken。

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::TaskError;

/// 取消原因（只记录第一次）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    UserAbort,
    Timeout,
    /// 父信号被取消（会话关闭、进程退出等）
    Parent,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CancelReason::UserAbort => "cancelled by user",
            CancelReason::Timeout => "timed out",
            CancelReason::Parent => "cancelled by parent",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct SignalInner {
    token: CancellationToken,
    reason: OnceLock<CancelReason>,
    deadline: Mutex<Option<Instant>>,
}

/// 组合取消信号：克隆廉价，观察无副作用
#[derive(Clone, Debug)]
pub struct CancellationSignal {
    inner: Arc<SignalInner>,
}

impl CancellationSignal {
    fn with_token(token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                token,
                reason: OnceLock::new(),
                deadline: Mutex::new(None),
            }),
        }
    }

    /// 永不取消的信号（测试或无需取消的调用点）
    pub fn never() -> Self {
        Self::with_token(CancellationToken::new())
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// 最先触发的原因；由父信号传导而来的取消没有显式原因，记为 Parent
    pub fn reason(&self) -> Option<CancelReason> {
        if !self.is_cancelled() {
            return None;
        }
        Some(self.inner.reason.get().copied().unwrap_or(CancelReason::Parent))
    }

    /// 超时截止时间；未设置或已清除时为 None
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline.lock().map(|d| *d).unwrap_or(None)
    }

    /// 等待取消
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    /// 已取消时返回 UserAbort 错误
    pub fn check(&self) -> Result<(), TaskError> {
        match self.reason() {
            None => Ok(()),
            Some(reason) => Err(TaskError::user_abort(format!("Task {}", reason))),
        }
    }

    fn latch(&self, reason: CancelReason) -> bool {
        // OnceLock 保证只有一个调用者写入原因；已被父信号取消时同样视为非首次
        if self.is_cancelled() {
            return false;
        }
        let first = self.inner.reason.set(reason).is_ok();
        self.inner.token.cancel();
        first
    }

    fn set_deadline(&self, deadline: Option<Instant>) {
        if let Ok(mut d) = self.inner.deadline.lock() {
            *d = deadline;
        }
    }
}

/// 取消协调器：持有组合信号与可选的超时计时任务
#[derive(Debug)]
pub struct CancellationCoordinator {
    signal: CancellationSignal,
    /// 取消它即可停止超时计时
    timer: Option<CancellationToken>,
}

impl CancellationCoordinator {
    pub fn new() -> Self {
        Self {
            signal: CancellationSignal::with_token(CancellationToken::new()),
            timer: None,
        }
    }

    /// 以父信号为来源之一：父取消时子信号随之取消
    pub fn with_parent(parent: &CancellationSignal) -> Self {
        Self {
            signal: CancellationSignal::with_token(parent.inner.token.child_token()),
            timer: None,
        }
    }

    /// 增加超时来源，必须在 tokio 运行时内调用
    pub fn with_timeout(mut self, duration: Duration) -> Self {
        if let Some(old) = self.timer.take() {
            old.cancel();
        }
        let deadline = Instant::now() + duration;
        self.signal.set_deadline(Some(deadline));

        let timer = CancellationToken::new();
        let stop = timer.clone();
        let signal = self.signal.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    if signal.latch(CancelReason::Timeout) {
                        tracing::debug!(?duration, "cancellation timeout fired");
                    }
                }
                _ = stop.cancelled() => {}
                _ = signal.cancelled() => {}
            }
        });
        self.timer = Some(timer);
        self
    }

    pub fn signal(&self) -> CancellationSignal {
        self.signal.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// 显式取消；只有真正完成锁存的那次调用返回 true，重复取消为空操作
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let first = self.signal.latch(reason);
        if first {
            tracing::info!(%reason, "cancellation signal latched");
        }
        first
    }

    /// 清除超时来源；已取消时不产生任何影响
    pub fn clear_timeout(&mut self) {
        if self.signal.is_cancelled() {
            return;
        }
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        self.signal.set_deadline(None);
    }
}

impl Default for CancellationCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancellationCoordinator {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}
