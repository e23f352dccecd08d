//! 优雅关闭
//!
//! ShutdownManager 持有进程级取消信号，作为所有任务的父信号：
//! Ctrl+C / SIGTERM / quit 命令触发后，正在运行的任务在下一个挂起点以 UserAbort 终止。

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::core::{CancelReason, CancellationCoordinator, CancellationSignal};

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// 用户发起的退出 (Ctrl+C 或 quit 命令)
    UserInitiated,
    /// SIGTERM 信号
    Signal,
}

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    coordinator: Arc<CancellationCoordinator>,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            coordinator: Arc::new(CancellationCoordinator::new()),
            reason_tx,
        }
    }

    /// 进程级取消信号，任务以它为父信号
    pub fn signal(&self) -> CancellationSignal {
        self.coordinator.signal()
    }

    /// 触发关闭；重复触发为空操作
    pub fn shutdown(&self, reason: ShutdownReason) {
        if self.coordinator.cancel(CancelReason::Parent) {
            tracing::info!(?reason, "shutdown requested");
            let _ = self.reason_tx.send(reason);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.coordinator.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.coordinator.signal().cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 运行主应用直到其结束或收到关闭信号，然后执行清理
///
/// 应用先结束时返回其输出；被关闭信号打断时返回 None
pub async fn run_with_graceful_shutdown<F, T, Fut>(
    shutdown_manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) -> Option<T>
where
    F: Future<Output = T>,
    Fut: Future<Output = ()>,
{
    shutdown_manager.install_signal_handlers();

    let output = tokio::select! {
        output = app => {
            tracing::info!("Application finished normally");
            Some(output)
        }
        _ = shutdown_manager.wait_for_shutdown() => {
            tracing::info!("Shutdown signal received");
            None
        }
    };

    cleanup().await;
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_latches_once() {
        let manager = ShutdownManager::new();
        let mut reasons = manager.subscribe();
        assert!(!manager.is_shutdown());
        manager.shutdown(ShutdownReason::UserInitiated);
        manager.shutdown(ShutdownReason::Signal);
        assert!(manager.is_shutdown());
        assert_eq!(reasons.try_recv().unwrap(), ShutdownReason::UserInitiated);
        assert!(reasons.try_recv().is_err());
    }

    #[test]
    fn test_task_signal_follows_shutdown() {
        let manager = ShutdownManager::new();
        let child = CancellationCoordinator::with_parent(&manager.signal());
        manager.shutdown(ShutdownReason::Signal);
        let err = child.signal().check().unwrap_err();
        assert_eq!(err.message, "Task cancelled by parent");
    }

    #[tokio::test]
    async fn test_run_until_app_finishes() {
        let manager = Arc::new(ShutdownManager::new());
        let cleaned = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = cleaned.clone();
        let output = run_with_graceful_shutdown(manager, async { 7 }, || async move {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        })
        .await;
        assert_eq!(output, Some(7));
        assert!(cleaned.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_app_and_still_cleans_up() {
        let manager = Arc::new(ShutdownManager::new());
        manager.shutdown(ShutdownReason::UserInitiated);
        let cleaned = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = cleaned.clone();
        let output = run_with_graceful_shutdown(
            manager,
            std::future::pending::<()>(),
            || async move {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
            },
        )
        .await;
        assert_eq!(output, None);
        assert!(cleaned.load(std::sync::atomic::Ordering::SeqCst));
    }
}
