//! Coder 命令行入口
//!
//! 用法：`coder [--config <file>] --script <transcript> <task...>`（clap 解析）
//!
//! 模型输出来自转录文件（各轮以单独一行 `---` 分隔），过程事件以 JSON 行写到 stdout；
//! 任务等待用户时从 stdin 读取一行作为回复。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use coder::agent::{create_agent_components, TaskEvent};
use coder::config::{load_config, AppConfig};
use coder::core::{create_agent, run_with_graceful_shutdown, Command, ShutdownManager};
use coder::llm::ScriptedModelClient;
use coder::tools::NoDiagnostics;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};

#[derive(Parser, Debug)]
#[command(name = "coder", version, about = "Rust 编程智能体")]
struct Args {
    /// 配置文件路径
    #[arg(long)]
    config: Option<PathBuf>,

    /// 模型转录文件（各轮以 `---` 分隔）
    #[arg(long)]
    script: PathBuf,

    /// 任务描述
    #[arg(required = true, trailing_var_arg = true)]
    task: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    coder::observability::init();
    let args = Args::parse();

    let cfg = load_config(args.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let workspace = match cfg.app.workspace_root.clone() {
        Some(root) => root,
        None => std::env::current_dir()
            .context("Failed to read current directory")?
            .join("workspace"),
    };
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("Failed to create workspace {}", workspace.display()))?;
    let workspace = workspace.canonicalize().unwrap_or(workspace);

    let transcript = std::fs::read_to_string(&args.script)
        .with_context(|| format!("Failed to read transcript {}", args.script.display()))?;
    let model = Arc::new(ScriptedModelClient::from_transcript(&transcript, 16));

    let components = create_agent_components(&cfg, &workspace, model, Arc::new(NoDiagnostics))
        .context("Failed to create agent components")?;
    tracing::info!(?components, workspace = %workspace.display(), "agent ready");

    let shutdown = Arc::new(ShutdownManager::new());
    let (cmd_tx, _state_rx, events) = create_agent(Arc::new(components), shutdown.signal());
    cmd_tx
        .send(Command::Submit(args.task.join(" ")))
        .context("Agent loop stopped")?;

    let quit_tx = cmd_tx.clone();
    let outcome = run_with_graceful_shutdown(
        shutdown,
        print_events(events, cmd_tx),
        || async move {
            let _ = quit_tx.send(Command::Quit);
        },
    )
    .await;
    outcome.unwrap_or(Ok(()))
}

/// 把事件以 JSON 行打印，等待用户时读取 stdin；任务结束即返回
async fn print_events(
    mut events: broadcast::Receiver<TaskEvent>,
    cmd_tx: mpsc::UnboundedSender<Command>,
) -> anyhow::Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event stream lagged");
                continue;
            }
            Err(_) => return Ok(()),
        };
        println!("{}", serde_json::to_string(&event)?);
        match event {
            TaskEvent::AwaitingUser { .. } => {
                let Some(line) = stdin.next_line().await.context("Failed to read stdin")? else {
                    let _ = cmd_tx.send(Command::Cancel);
                    continue;
                };
                cmd_tx.send(Command::Respond(line)).context("Agent loop stopped")?;
            }
            TaskEvent::Completed { .. } | TaskEvent::Aborted { .. } => return Ok(()),
            _ => {}
        }
    }
}
