//! 核心层：错误分类与恢复、组合取消、任务状态机、主控循环、优雅关闭

pub mod cancel;
pub mod error;
pub mod orchestrator;
pub mod recovery;
pub mod shutdown;
pub mod state;

pub use cancel::{CancelReason, CancellationCoordinator, CancellationSignal};
pub use error::{TaskError, TaskErrorKind};
pub use orchestrator::{create_agent, Command};
pub use recovery::{RecoveryAction, RecoveryEngine, RetryPolicy};
pub use shutdown::{run_with_graceful_shutdown, ShutdownManager, ShutdownReason};
pub use state::{TaskState, TaskStateMachine, TransitionError, UiState};
