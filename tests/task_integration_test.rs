//! 任务运行器集成测试：脚本化模型 + 记录型工具

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use coder::agent::{build_system_prompt, AgentComponents, Task, TaskEvent, TaskOutcome};
use coder::config::TaskSection;
use coder::core::{
    create_agent, CancellationSignal, Command, RecoveryEngine, RetryPolicy, ShutdownManager,
    ShutdownReason, TaskError, TaskErrorKind, TaskState,
};
use coder::llm::{LlmError, ScriptedModelClient, ScriptedTurn};
use coder::parser::ToolInput;
use coder::tools::{
    AskFollowupQuestionTool, AttemptCompletionTool, SchemaRegistry, Tool, ToolDispatcher,
    ToolOutput, ToolRegistry,
};
use tokio::sync::mpsc;

/// 记录开始 / 结束顺序的 read_file 替身；path 等于 fail_on 的路径时返回对应种类的错误
struct RecordingReadFile {
    log: Arc<Mutex<Vec<String>>>,
    fail_on: Option<(&'static str, TaskErrorKind)>,
}

#[async_trait]
impl Tool for RecordingReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    async fn execute(
        &self,
        input: &ToolInput,
        _signal: &CancellationSignal,
    ) -> Result<ToolOutput, TaskError> {
        let path = input.require_text("path")?.to_string();
        self.log.lock().unwrap().push(format!("start {path}"));
        if let Some((target, kind)) = self.fail_on {
            if target == path {
                let message = match kind {
                    TaskErrorKind::Unauthorized => "key revoked",
                    _ => "upstream 503 from file host",
                };
                return Err(TaskError::new(kind, message));
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.log.lock().unwrap().push(format!("end {path}"));
        Ok(ToolOutput::text(format!("contents of {path}")))
    }
}

struct Harness {
    model: Arc<ScriptedModelClient>,
    log: Arc<Mutex<Vec<String>>>,
    components: AgentComponents,
}

fn harness(
    turns: Vec<ScriptedTurn>,
    task: TaskSection,
    fail_on: Option<(&'static str, TaskErrorKind)>,
) -> Harness {
    let model = Arc::new(ScriptedModelClient::new(turns));
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut tools = ToolRegistry::new();
    tools.register(RecordingReadFile {
        log: log.clone(),
        fail_on,
    });
    tools.register(AskFollowupQuestionTool);
    tools.register(AttemptCompletionTool);

    let schemas = Arc::new(SchemaRegistry::builtin().unwrap());
    let components = AgentComponents {
        system_prompt: build_system_prompt(&schemas, Path::new("/work")).into(),
        schemas,
        dispatcher: ToolDispatcher::new(Arc::new(tools), Duration::from_secs(30)),
        model: model.clone(),
        recovery: RecoveryEngine::new(RetryPolicy::from(&task)),
        max_requests_per_task: task.max_requests_per_task,
        task_timeout: task.task_timeout_secs.map(Duration::from_secs),
    };
    Harness {
        model,
        log,
        components,
    }
}

fn read(path: &str) -> String {
    format!("<read_file>\n<path>{path}</path>\n</read_file>")
}

fn complete(result: &str) -> String {
    format!("<attempt_completion>\n<result>\n{result}\n</result>\n</attempt_completion>")
}

fn drain(rx: &mut mpsc::UnboundedReceiver<TaskEvent>) -> Vec<TaskEvent> {
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    events
}

fn aborted_count(events: &[TaskEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, TaskEvent::Aborted { .. }))
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_tools_run_one_at_a_time_in_stream_order() {
    let first = format!("I'll read both files.\n{}\n{}", read("a.txt"), read("b.txt"));
    let h = harness(
        vec![ScriptedTurn::split(&first, 3), ScriptedTurn::split(&complete("done"), 5)],
        TaskSection::default(),
        None,
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut task = Task::new(&h.components, &CancellationSignal::never()).with_events(tx);

    let outcome = task.start("read a and b").await.unwrap();
    assert_eq!(
        outcome,
        TaskOutcome::Completed {
            result: "done".into()
        }
    );
    assert_eq!(task.state(), TaskState::Completed);
    assert_eq!(
        *h.log.lock().unwrap(),
        vec!["start a.txt", "end a.txt", "start b.txt", "end b.txt"]
    );

    // 第二次请求看到：任务、助手原文、两条按顺序的工具结果
    let second = &h.model.requests()[1];
    assert_eq!(second.len(), 4);
    assert_eq!(second[1].content, first);
    assert_eq!(second[2].content, "[read_file] Result: contents of a.txt");
    assert_eq!(second[3].content, "[read_file] Result: contents of b.txt");

    let events = drain(&mut rx);
    let started: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, TaskEvent::ToolStarted { .. }))
        .collect();
    assert_eq!(started.len(), 3);
    assert!(matches!(events.last(), Some(TaskEvent::Completed { result }) if result == "done"));
}

#[tokio::test(start_paused = true)]
async fn test_unauthorized_tool_error_aborts_remaining_calls() {
    let turn = format!("{}\n{}", read("secret"), read("b.txt"));
    let h = harness(
        vec![ScriptedTurn::text(turn)],
        TaskSection::default(),
        Some(("secret", TaskErrorKind::Unauthorized)),
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut task = Task::new(&h.components, &CancellationSignal::never()).with_events(tx);

    let err = task.start("go").await.unwrap_err();
    assert_eq!(err.kind, TaskErrorKind::Unauthorized);
    assert_eq!(task.state(), TaskState::Aborted);
    assert_eq!(task.terminal_error(), Some(&err));
    assert_eq!(*h.log.lock().unwrap(), vec!["start secret"]);
    assert!(task
        .transitions()
        .contains(&(TaskState::ExecutingTool, TaskState::Aborted)));

    let events = drain(&mut rx);
    assert_eq!(aborted_count(&events), 1);
    assert!(task.history().last().unwrap().content.contains("Task aborted"));
}

#[tokio::test(start_paused = true)]
async fn test_double_cancel_produces_single_abort() {
    let h = harness(
        vec![ScriptedTurn::split(&"thinking ".repeat(50), 4).with_chunk_delay(Duration::from_secs(1))],
        TaskSection::default(),
        None,
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut task = Task::new(&h.components, &CancellationSignal::never()).with_events(tx);
    let canceller = task.canceller();

    let (result, (first, second)) = tokio::join!(task.start("think"), async {
        tokio::time::sleep(Duration::from_millis(2500)).await;
        (canceller.cancel(), canceller.cancel())
    });
    assert!(first);
    assert!(!second);

    let err = result.unwrap_err();
    assert_eq!(err.kind, TaskErrorKind::UserAbort);
    assert_eq!(err.message, "Task cancelled by user");
    assert!(!task.cancel());

    let events = drain(&mut rx);
    assert_eq!(aborted_count(&events), 1);
    // 部分输出仍保留在历史中
    assert!(task.history()[1].content.starts_with("thinking"));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_waiting_for_user() {
    let question = "<ask_followup_question>\n<question>Which branch?</question>\n</ask_followup_question>";
    let h = harness(vec![ScriptedTurn::text(question)], TaskSection::default(), None);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut task = Task::new(&h.components, &CancellationSignal::never()).with_events(tx);

    assert!(matches!(
        task.start("ship it").await.unwrap(),
        TaskOutcome::WaitingForUser { .. }
    ));
    assert!(task.cancel());
    assert!(!task.cancel());
    assert_eq!(task.state(), TaskState::Aborted);
    assert_eq!(aborted_count(&drain(&mut rx)), 1);

    let err = task.resume("main").await.unwrap_err();
    assert_eq!(err.kind, TaskErrorKind::UserAbort);
}

#[tokio::test(start_paused = true)]
async fn test_api_errors_retried_until_exhausted() {
    let h = harness(
        vec![
            ScriptedTurn::error(LlmError::http(503, "overloaded")),
            ScriptedTurn::error(LlmError::http(503, "overloaded")),
            ScriptedTurn::error(LlmError::Transport("connection reset".into())),
        ],
        TaskSection::default(),
        None,
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut task = Task::new(&h.components, &CancellationSignal::never()).with_events(tx);

    let err = task.start("go").await.unwrap_err();
    assert_eq!(err.kind, TaskErrorKind::ApiError);
    assert_eq!(h.model.request_count(), 3);

    let events = drain(&mut rx);
    let retries = events
        .iter()
        .filter(|e| matches!(e, TaskEvent::ApiRetry { .. }))
        .count();
    assert_eq!(retries, 2);
    assert_eq!(aborted_count(&events), 1);
}

#[tokio::test(start_paused = true)]
async fn test_mid_stream_failure_retries_turn() {
    let h = harness(
        vec![
            ScriptedTurn::chunks(["Let me ", "look", "..."]).fail_after(2, LlmError::http(500, "boom")),
            ScriptedTurn::text(complete("recovered")),
        ],
        TaskSection::default(),
        None,
    );
    let mut task = Task::new(&h.components, &CancellationSignal::never());

    let outcome = task.start("go").await.unwrap();
    assert_eq!(
        outcome,
        TaskOutcome::Completed {
            result: "recovered".into()
        }
    );
    // 重试请求看到了中断前的部分输出
    assert_eq!(h.model.requests()[1][1].content, "Let me look");
}

#[tokio::test]
async fn test_fatal_api_error_is_not_retried() {
    let h = harness(
        vec![ScriptedTurn::error(LlmError::http(402, "insufficient balance"))],
        TaskSection::default(),
        None,
    );
    let mut task = Task::new(&h.components, &CancellationSignal::never());
    let err = task.start("go").await.unwrap_err();
    assert_eq!(err.kind, TaskErrorKind::PaymentRequired);
    assert_eq!(h.model.request_count(), 1);
}

#[tokio::test]
async fn test_question_waits_and_resume_continues() {
    let question = "Need input.\n<ask_followup_question>\n<question>\nWhich color?\n</question>\n</ask_followup_question>";
    let h = harness(
        vec![ScriptedTurn::split(question, 7), ScriptedTurn::text(complete("painted blue"))],
        TaskSection::default(),
        None,
    );
    let mut task = Task::new(&h.components, &CancellationSignal::never());

    let outcome = task.start("paint it").await.unwrap();
    assert_eq!(
        outcome,
        TaskOutcome::WaitingForUser {
            prompt: "Which color?".into()
        }
    );
    assert_eq!(task.state(), TaskState::WaitingForUser);
    assert!(h.log.lock().unwrap().is_empty());

    let outcome = task.resume("blue").await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed { result } if result == "painted blue"));

    let last = h.model.requests()[1].last().cloned().unwrap();
    assert!(last.content.starts_with("[ask_followup_question] Result:"));
    assert!(last.content.contains("blue"));
}

#[tokio::test]
async fn test_resume_rejected_unless_waiting() {
    let h = harness(vec![], TaskSection::default(), None);
    let mut task = Task::new(&h.components, &CancellationSignal::never());
    let err = task.resume("hello").await.unwrap_err();
    assert_eq!(err.kind, TaskErrorKind::ToolError);
    assert_eq!(task.state(), TaskState::Idle);
}

#[tokio::test]
async fn test_plain_reply_waits_for_user() {
    let h = harness(
        vec![ScriptedTurn::text("Could you tell me more about the bug?")],
        TaskSection::default(),
        None,
    );
    let mut task = Task::new(&h.components, &CancellationSignal::never());
    let outcome = task.start("fix the bug").await.unwrap();
    assert_eq!(
        outcome,
        TaskOutcome::WaitingForUser {
            prompt: "Could you tell me more about the bug?".into()
        }
    );
}

#[tokio::test]
async fn test_empty_turn_gets_placeholder() {
    let h = harness(vec![ScriptedTurn::chunks(Vec::<String>::new())], TaskSection::default(), None);
    let mut task = Task::new(&h.components, &CancellationSignal::never());
    assert!(matches!(
        task.start("anything").await.unwrap(),
        TaskOutcome::WaitingForUser { .. }
    ));
    assert_eq!(
        task.history()[1].content,
        "Failure: I did not provide a response."
    );
}

#[tokio::test(start_paused = true)]
async fn test_request_limit_pauses_for_user() {
    let task_cfg = TaskSection {
        max_requests_per_task: 2,
        ..TaskSection::default()
    };
    let h = harness(
        vec![
            ScriptedTurn::text(read("a")),
            ScriptedTurn::text(read("b")),
            ScriptedTurn::text(complete("ok")),
        ],
        task_cfg,
        None,
    );
    let mut task = Task::new(&h.components, &CancellationSignal::never());

    let outcome = task.start("loop").await.unwrap();
    assert!(matches!(&outcome, TaskOutcome::WaitingForUser { prompt } if prompt.contains("limit of 2")));
    assert_eq!(h.model.request_count(), 2);

    let outcome = task.resume("keep going").await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed { .. }));
    assert_eq!(h.model.requests()[2].last().unwrap().content, "keep going");
}

#[tokio::test]
async fn test_invalid_call_fed_back_to_model() {
    let h = harness(
        vec![
            ScriptedTurn::text("<read_file>\n</read_file>"),
            ScriptedTurn::text(complete("fine")),
        ],
        TaskSection::default(),
        None,
    );
    let mut task = Task::new(&h.components, &CancellationSignal::never());
    assert!(matches!(
        task.start("go").await.unwrap(),
        TaskOutcome::Completed { .. }
    ));
    let feedback = h.model.requests()[1].last().cloned().unwrap();
    assert!(feedback.content.starts_with("[read_file] Error:"));
    assert!(feedback.content.contains("path"));
}

#[tokio::test]
async fn test_truncated_call_fed_back_to_model() {
    let h = harness(
        vec![
            ScriptedTurn::text("<read_file>\n<path>src/ma"),
            ScriptedTurn::text(complete("fine")),
        ],
        TaskSection::default(),
        None,
    );
    let mut task = Task::new(&h.components, &CancellationSignal::never());
    assert!(task.start("go").await.is_ok());
    let feedback = h.model.requests()[1].last().cloned().unwrap();
    assert!(feedback.content.starts_with("[read_file] Error:"));
    assert!(h.log.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_tool_api_error_is_fed_back_and_task_completes() {
    let h = harness(
        vec![
            ScriptedTurn::text(read("remote.txt")),
            ScriptedTurn::text(complete("worked around it")),
        ],
        TaskSection::default(),
        Some(("remote.txt", TaskErrorKind::ApiError)),
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut task = Task::new(&h.components, &CancellationSignal::never()).with_events(tx);

    let outcome = task.start("fetch remote").await.unwrap();
    assert_eq!(
        outcome,
        TaskOutcome::Completed {
            result: "worked around it".into()
        }
    );
    assert_eq!(task.state(), TaskState::Completed);
    let feedback = h.model.requests()[1].last().cloned().unwrap();
    assert_eq!(feedback.content, "[read_file] Error: upstream 503 from file host");

    let events = drain(&mut rx);
    assert_eq!(aborted_count(&events), 0);
    assert!(events.iter().any(|e| matches!(
        e,
        TaskEvent::ToolFinished { ok: false, tool, .. } if tool == "read_file"
    )));
}

#[tokio::test(start_paused = true)]
async fn test_repeated_tool_api_errors_abort_with_api_error() {
    let turns = (0..3).map(|_| ScriptedTurn::text(read("remote.txt"))).collect();
    let h = harness(
        turns,
        TaskSection::default(),
        Some(("remote.txt", TaskErrorKind::ApiError)),
    );
    let mut task = Task::new(&h.components, &CancellationSignal::never());
    let err = task.start("fetch remote").await.unwrap_err();
    assert_eq!(err.kind, TaskErrorKind::ApiError);
    assert_eq!(task.state(), TaskState::Aborted);
    assert_eq!(h.model.requests().len(), 3);
}

#[tokio::test]
async fn test_consecutive_tool_errors_abort() {
    let task_cfg = TaskSection {
        max_consecutive_tool_errors: 1,
        ..TaskSection::default()
    };
    let h = harness(
        vec![ScriptedTurn::text("<read_file>\n</read_file>\n<read_file>\n</read_file>")],
        task_cfg,
        None,
    );
    let mut task = Task::new(&h.components, &CancellationSignal::never());
    let err = task.start("go").await.unwrap_err();
    assert_eq!(err.kind, TaskErrorKind::ToolError);
    assert_eq!(task.state(), TaskState::Aborted);
}

#[tokio::test]
async fn test_calls_after_completion_are_skipped() {
    let turn = format!("{}\n{}", complete("all done"), read("late.txt"));
    let h = harness(vec![ScriptedTurn::text(turn)], TaskSection::default(), None);
    let mut task = Task::new(&h.components, &CancellationSignal::never());
    assert!(matches!(
        task.start("go").await.unwrap(),
        TaskOutcome::Completed { .. }
    ));
    assert!(h.log.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_task_timeout_aborts() {
    let task_cfg = TaskSection {
        task_timeout_secs: Some(5),
        ..TaskSection::default()
    };
    let h = harness(
        vec![ScriptedTurn::chunks(["a", "b", "c"]).with_chunk_delay(Duration::from_secs(10))],
        task_cfg,
        None,
    );
    let mut task = Task::new(&h.components, &CancellationSignal::never());
    let err = task.start("slow").await.unwrap_err();
    assert_eq!(err.kind, TaskErrorKind::UserAbort);
    assert_eq!(err.message, "Task timed out");
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_running_task() {
    let h = harness(
        vec![ScriptedTurn::chunks(["a", "b"]).with_chunk_delay(Duration::from_secs(10))],
        TaskSection::default(),
        None,
    );
    let shutdown = ShutdownManager::new();
    let mut task = Task::new(&h.components, &shutdown.signal());
    let (result, _) = tokio::join!(task.start("go"), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.shutdown(ShutdownReason::Signal);
    });
    let err = result.unwrap_err();
    assert_eq!(err.message, "Task cancelled by parent");
}

#[tokio::test(start_paused = true)]
async fn test_orchestrator_cancel_reaches_running_task() {
    let h = harness(
        vec![ScriptedTurn::split(&"slow ".repeat(20), 3).with_chunk_delay(Duration::from_secs(1))],
        TaskSection::default(),
        None,
    );
    let shutdown = ShutdownManager::new();
    let (cmd_tx, state_rx, mut events) = create_agent(Arc::new(h.components), shutdown.signal());
    cmd_tx.send(Command::Submit("go".into())).unwrap();

    let mut cancelled = false;
    let mut aborted = 0;
    loop {
        match events.recv().await.unwrap() {
            TaskEvent::TextDelta { .. } if !cancelled => {
                cmd_tx.send(Command::Cancel).unwrap();
                cmd_tx.send(Command::Cancel).unwrap();
                cancelled = true;
            }
            TaskEvent::Aborted { kind, .. } => {
                assert_eq!(kind, TaskErrorKind::UserAbort);
                aborted += 1;
                break;
            }
            _ => {}
        }
    }
    assert_eq!(aborted, 1);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let ui = state_rx.borrow().clone();
    assert_eq!(ui.phase, TaskState::Aborted);
    assert!(!ui.input_locked);
    cmd_tx.send(Command::Quit).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_open_fragment_reports_detection_and_partial_body() {
    let body = format!("Checking.\n{}", read("a.txt"));
    let h = harness(
        vec![ScriptedTurn::split(&body, 4), ScriptedTurn::text(complete("done"))],
        TaskSection::default(),
        None,
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut task = Task::new(&h.components, &CancellationSignal::never()).with_events(tx);
    task.start("read a").await.unwrap();

    let events = drain(&mut rx);
    let detected = events
        .iter()
        .position(|e| matches!(e, TaskEvent::ToolDetected { tool } if tool == "read_file"))
        .unwrap();
    let started = events
        .iter()
        .position(|e| matches!(e, TaskEvent::ToolStarted { .. }))
        .unwrap();
    assert!(detected < started);
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, TaskEvent::ToolDetected { .. }))
            .count(),
        1
    );

    let partials: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            TaskEvent::ToolUpdate { tool, partial } if tool == "read_file" => {
                Some(partial.as_str())
            }
            _ => None,
        })
        .collect();
    assert!(!partials.is_empty());
    assert!(partials.windows(2).all(|w| w[1].starts_with(w[0]) && w[1].len() > w[0].len()));
    let updates_end = events
        .iter()
        .rposition(|e| matches!(e, TaskEvent::ToolUpdate { .. }))
        .unwrap();
    assert!(updates_end < started);
}
