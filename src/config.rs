//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CODER__*` 覆盖（双下划线表示嵌套，如 `CODER__TASK__MAX_API_ATTEMPTS=5`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub task: TaskSection,
    #[serde(default)]
    pub tools: ToolsSection,
}

/// [app] 段：应用名、工作目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 沙箱根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
}

/// [task] 段：请求上限、重试与超时
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSection {
    /// 单个任务最多发起的模型请求数，超出后转入 WaitingForUser
    #[serde(default = "default_max_requests_per_task")]
    pub max_requests_per_task: u32,
    /// ApiError 最多尝试次数（含首次）
    #[serde(default = "default_max_api_attempts")]
    pub max_api_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// 连续 ToolError 超过该值则终止任务
    #[serde(default = "default_max_consecutive_tool_errors")]
    pub max_consecutive_tool_errors: u32,
    /// 整个任务的超时（秒），作为取消来源之一
    pub task_timeout_secs: Option<u64>,
}

fn default_max_requests_per_task() -> u32 {
    25
}

fn default_max_api_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

fn default_max_consecutive_tool_errors() -> u32 {
    3
}

impl Default for TaskSection {
    fn default() -> Self {
        Self {
            max_requests_per_task: default_max_requests_per_task(),
            max_api_attempts: default_max_api_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            max_consecutive_tool_errors: default_max_consecutive_tool_errors(),
            task_timeout_secs: None,
        }
    }
}

/// [tools] 段：工具超时、读取上限、搜索结果上限、Shell 白名单
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_max_read_bytes")]
    pub max_read_bytes: usize,
    #[serde(default = "default_search_max_results")]
    pub search_max_results: usize,
    #[serde(default)]
    pub shell: ShellSection,
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_max_read_bytes() -> usize {
    256 * 1024
}

fn default_search_max_results() -> usize {
    50
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            max_read_bytes: default_max_read_bytes(),
            search_max_results: default_search_max_results(),
            shell: ShellSection::default(),
        }
    }
}

/// [tools.shell] 段：允许执行的命令名（仅首词，如 ls、grep、cargo）
#[derive(Debug, Clone, Deserialize)]
pub struct ShellSection {
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: default_allowed_commands(),
        }
    }
}

fn default_allowed_commands() -> Vec<String> {
    vec![
        "ls".into(),
        "grep".into(),
        "cat".into(),
        "head".into(),
        "tail".into(),
        "wc".into(),
        "find".into(),
        "echo".into(),
        "mkdir".into(),
        "git".into(),
        "cargo".into(),
        "rustc".into(),
        "npm".into(),
        "node".into(),
        "python3".into(),
    ]
}

/// 从 config 目录加载配置，环境变量 CODER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CODER__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CODER")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.task.max_api_attempts, 3);
        assert_eq!(cfg.task.max_requests_per_task, 25);
        assert_eq!(cfg.tools.tool_timeout_secs, 30);
        assert!(cfg.tools.shell.allowed_commands.iter().any(|c| c == "ls"));
        assert!(cfg.task.task_timeout_secs.is_none());
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coder.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "[task]\nmax_api_attempts = 5\ntask_timeout_secs = 600\n\n[tools]\ntool_timeout_secs = 10\n"
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.task.max_api_attempts, 5);
        assert_eq!(cfg.task.task_timeout_secs, Some(600));
        assert_eq!(cfg.task.max_consecutive_tool_errors, 3);
        assert_eq!(cfg.tools.tool_timeout_secs, 10);
        assert_eq!(cfg.tools.search_max_results, 50);
    }
}
