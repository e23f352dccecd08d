//! 主控循环
//!
//! 建立 cmd / state / event 三通道，并在后台任务中消费用户命令（Submit / Respond / Cancel / Clear / Quit）。
//! 任务的每一步（start / resume）在独立的 tokio 任务中运行，主循环保持响应，Cancel 可在运行中送达。

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{JoinError, JoinHandle};

use crate::agent::{AgentComponents, Task, TaskCanceller, TaskEvent, TaskOutcome};
use crate::core::{CancellationSignal, TaskError, TaskState, UiState};

/// 从前端发往主控循环的命令
#[derive(Debug, Clone)]
pub enum Command {
    /// 提交新任务；当前任务在等待用户时视为回复
    Submit(String),
    /// 回复等待中的任务
    Respond(String),
    /// 取消当前任务
    Cancel,
    /// 丢弃已结束或等待中的任务
    Clear,
    Quit,
}

type StepResult = (Task, Result<TaskOutcome, TaskError>);

struct Running {
    handle: JoinHandle<StepResult>,
    canceller: TaskCanceller,
}

async fn join_running(running: &mut Option<Running>) -> Result<StepResult, JoinError> {
    match running {
        Some(r) => (&mut r.handle).await,
        None => std::future::pending().await,
    }
}

fn spawn_step(mut task: Task, input: String, resume: bool) -> Running {
    let canceller = task.canceller();
    let handle = tokio::spawn(async move {
        let result = if resume {
            task.resume(&input).await
        } else {
            task.start(&input).await
        };
        (task, result)
    });
    Running { handle, canceller }
}

/// 事件 -> UI 投影
fn apply_event(ui: &mut UiState, event: &TaskEvent) {
    match event {
        TaskEvent::StateChanged { to, .. } => {
            ui.phase = *to;
            ui.input_locked = !matches!(
                to,
                TaskState::Idle
                    | TaskState::WaitingForUser
                    | TaskState::Completed
                    | TaskState::Aborted
            );
        }
        TaskEvent::ToolStarted { tool, .. } => {
            ui.phase = TaskState::ExecutingTool;
            ui.active_tool = Some(tool.clone());
        }
        TaskEvent::ToolFinished { .. } => ui.active_tool = None,
        TaskEvent::Aborted { message, .. } => {
            ui.active_tool = None;
            ui.error_message = Some(message.clone());
        }
        _ => {}
    }
}

/// 一步结束后用任务的真实状态覆盖投影
fn publish(state_tx: &watch::Sender<UiState>, task: Option<&Task>) {
    let snapshot = match task {
        Some(task) => UiState {
            phase: task.state(),
            history: task.history().to_vec(),
            active_tool: None,
            input_locked: false,
            error_message: task.terminal_error().map(|e| e.message.clone()),
        },
        None => UiState::default(),
    };
    state_tx.send_replace(snapshot);
}

/// 创建主控循环：返回命令发送端、状态接收端、事件接收端。shutdown 为所有任务的父信号
pub fn create_agent(
    components: Arc<AgentComponents>,
    shutdown: CancellationSignal,
) -> (
    mpsc::UnboundedSender<Command>,
    watch::Receiver<UiState>,
    broadcast::Receiver<TaskEvent>,
) {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
    let (state_tx, state_rx) = watch::channel(UiState::default());
    let state_tx = Arc::new(state_tx);
    let (event_tx, event_rx) = broadcast::channel::<TaskEvent>(256);
    let (task_event_tx, mut task_event_rx) = mpsc::unbounded_channel::<TaskEvent>();

    // 任务事件 -> broadcast + UI 投影
    {
        let state_tx = state_tx.clone();
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = task_event_rx.recv().await {
                state_tx.send_modify(|ui| apply_event(ui, &event));
                let _ = event_tx.send(event);
            }
        });
    }

    tokio::spawn(async move {
        let mut current: Option<Task> = None;
        let mut running: Option<Running> = None;

        loop {
            tokio::select! {
                joined = join_running(&mut running) => {
                    running = None;
                    match joined {
                        Ok((task, result)) => {
                            match &result {
                                Ok(outcome) => {
                                    tracing::info!(task_id = %task.id(), ?outcome, "task step finished")
                                }
                                Err(e) => {
                                    tracing::warn!(task_id = %task.id(), error = %e, "task aborted")
                                }
                            }
                            publish(&state_tx, Some(&task));
                            current = Some(task);
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "task step panicked");
                            state_tx.send_modify(|ui| {
                                ui.phase = TaskState::Aborted;
                                ui.input_locked = false;
                                ui.error_message = Some(e.to_string());
                            });
                        }
                    }
                }
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        Command::Submit(input) | Command::Respond(input) if running.is_some() => {
                            tracing::warn!(input_len = input.len(), "task is running, input ignored");
                        }
                        Command::Submit(input) | Command::Respond(input)
                            if current.as_ref().map(Task::state) == Some(TaskState::WaitingForUser) =>
                        {
                            if let Some(task) = current.take() {
                                running = Some(spawn_step(task, input, true));
                            }
                        }
                        Command::Submit(input) => {
                            let task = Task::new(&components, &shutdown)
                                .with_events(task_event_tx.clone());
                            tracing::info!(task_id = %task.id(), "submitting task");
                            current = None;
                            running = Some(spawn_step(task, input, false));
                        }
                        Command::Respond(_) => {
                            tracing::warn!("no task is waiting for input");
                        }
                        Command::Cancel => {
                            if let Some(r) = &running {
                                r.canceller.cancel();
                            } else if let Some(task) = current.as_mut() {
                                if task.cancel() {
                                    publish(&state_tx, Some(&*task));
                                }
                            }
                        }
                        Command::Clear => {
                            if running.is_none() {
                                current = None;
                                publish(&state_tx, None);
                            }
                        }
                        Command::Quit => {
                            if let Some(r) = &running {
                                r.canceller.cancel();
                            }
                            break;
                        }
                    }
                }
            }
        }

        // 等待运行中的一步在取消后收尾
        if let Some(r) = running.take() {
            if let Ok((task, _)) = r.handle.await {
                publish(&state_tx, Some(&task));
            }
        }
    });

    (cmd_tx, state_rx, event_rx)
}
