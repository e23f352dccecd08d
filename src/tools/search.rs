//! search_files：在工作区目录下做正则搜索
//!
//! walkdir 遍历（跳过隐藏目录、target、node_modules 与过大的文件），glob 过滤文件名，
//! 按文件分组输出匹配行及其前后各 CONTEXT_LINES 行，重叠的上下文合并为一段；
//! 总匹配数受 max_results 限制。

use std::path::Path;

use async_trait::async_trait;
use regex::Regex;
use walkdir::WalkDir;

use crate::core::{CancellationSignal, TaskError};
use crate::parser::ToolInput;
use crate::tools::definitions::SEARCH_FILES;
use crate::tools::filesystem::SafeFs;
use crate::tools::{Tool, ToolOutput};

const MAX_FILE_SIZE: u64 = 1024 * 1024;
const MAX_LINE_CHARS: usize = 300;
/// 每个匹配前后附带的行数
const CONTEXT_LINES: usize = 1;

/// 输出中的一行：匹配行或上下文行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchLine {
    /// 从 1 开始
    pub line: usize,
    pub text: String,
    pub is_match: bool,
}

impl SearchLine {
    fn new(line: usize, text: &str, is_match: bool) -> Self {
        Self {
            line,
            text: text.chars().take(MAX_LINE_CHARS).collect(),
            is_match,
        }
    }
}

/// 单个文件的匹配，blocks 为互不相邻的连续行段
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMatches {
    pub path: String,
    pub matches: usize,
    pub blocks: Vec<Vec<SearchLine>>,
}

/// 正则搜索工具
#[derive(Debug, Clone)]
pub struct SearchFilesTool {
    fs: SafeFs,
    max_results: usize,
}

impl SearchFilesTool {
    pub fn new(fs: SafeFs, max_results: usize) -> Self {
        Self {
            fs,
            max_results: max_results.max(1),
        }
    }

    /// 同步搜索，返回分组结果与是否达到上限
    pub fn search(
        &self,
        dir: &str,
        pattern: &str,
        file_pattern: Option<&str>,
        signal: &CancellationSignal,
    ) -> Result<(Vec<FileMatches>, bool), TaskError> {
        let re = Regex::new(pattern)
            .map_err(|e| TaskError::tool(format!("Invalid regex pattern: {}", e)))?;
        let include = file_pattern
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| TaskError::tool(format!("Invalid file_pattern: {}", e)))?;
        let base = self.fs.resolve(dir)?;
        if !base.is_dir() {
            return Err(TaskError::tool(format!("Not a directory: {}", dir)));
        }

        let mut results = Vec::new();
        let mut total = 0usize;
        let walker = WalkDir::new(&base)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                e.depth() == 0
                    || (!name.starts_with('.') && name != "target" && name != "node_modules")
            })
            .filter_map(|e| e.ok());

        for entry in walker {
            if signal.is_cancelled() {
                signal.check()?;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.metadata().map(|m| m.len() > MAX_FILE_SIZE).unwrap_or(true) {
                continue;
            }
            if let Some(ref include) = include {
                let name = entry.file_name().to_string_lossy();
                if !include.matches(&name) {
                    continue;
                }
            }
            let Some((matches, blocks)) =
                search_in_file(entry.path(), &re, self.max_results - total)
            else {
                continue;
            };
            total += matches;
            results.push(FileMatches {
                path: self.fs.display(entry.path()),
                matches,
                blocks,
            });
            if total >= self.max_results {
                return Ok((results, true));
            }
        }
        Ok((results, false))
    }
}

/// 返回 (匹配数, 行段)；没有匹配时为 None。最多取 limit 个匹配
fn search_in_file(
    path: &Path,
    re: &Regex,
    limit: usize,
) -> Option<(usize, Vec<Vec<SearchLine>>)> {
    // 二进制或非 UTF-8 文件直接跳过
    let content = std::fs::read_to_string(path).ok()?;
    let lines: Vec<&str> = content.lines().collect();
    let hits: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| re.is_match(line))
        .map(|(i, _)| i)
        .take(limit)
        .collect();
    if hits.is_empty() {
        return None;
    }

    let mut blocks: Vec<Vec<SearchLine>> = Vec::new();
    // 已输出到的行（不含）
    let mut emitted = 0;
    for &hit in &hits {
        let start = hit.saturating_sub(CONTEXT_LINES);
        let end = (hit + CONTEXT_LINES + 1).min(lines.len());
        let from = if !blocks.is_empty() && start <= emitted {
            emitted
        } else {
            blocks.push(Vec::new());
            start
        };
        if let Some(block) = blocks.last_mut() {
            for i in from..end {
                block.push(SearchLine::new(i + 1, lines[i], hits.binary_search(&i).is_ok()));
            }
        }
        emitted = end.max(emitted);
    }
    Some((hits.len(), blocks))
}

fn format_results(results: &[FileMatches], limited: bool, max: usize) -> String {
    if results.is_empty() {
        return "Found 0 results.".to_string();
    }
    let total: usize = results.iter().map(|r| r.matches).sum();
    let mut out = format!("Found {} result{}.\n", total, if total == 1 { "" } else { "s" });
    for r in results {
        out.push('\n');
        out.push_str(&r.path);
        out.push('\n');
        for (i, block) in r.blocks.iter().enumerate() {
            if i > 0 {
                out.push_str("  ----\n");
            }
            for l in block {
                let mark = if l.is_match { '>' } else { '|' };
                out.push_str(&format!("{:>5} {} {}\n", l.line, mark, l.text));
            }
        }
    }
    if limited {
        out.push_str(&format!(
            "\n(Showing the first {} results. Use a more specific search if necessary.)\n",
            max
        ));
    }
    out
}

#[async_trait]
impl Tool for SearchFilesTool {
    fn name(&self) -> &str {
        SEARCH_FILES
    }

    async fn execute(
        &self,
        input: &ToolInput,
        signal: &CancellationSignal,
    ) -> Result<ToolOutput, TaskError> {
        let path = input.require_text("path")?.trim();
        let regex = input.require_text("regex")?;
        let file_pattern = input.text("file_pattern");
        tracing::info!(path = %path, regex = %regex, file_pattern = ?file_pattern, "search_files");

        let tool = self.clone();
        let (path, regex) = (path.to_string(), regex.to_string());
        let file_pattern = file_pattern.map(str::to_string);
        let signal = signal.clone();
        let (results, limited) = tokio::task::spawn_blocking(move || {
            tool.search(&path, &regex, file_pattern.as_deref(), &signal)
        })
        .await
        .map_err(|e| TaskError::unknown(format!("search_files worker failed: {}", e)))??;
        Ok(ToolOutput::text(format_results(&results, limited, self.max_results)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskErrorKind;

    fn workspace() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("src/a.rs"), "fn a() {}\n// TODO: b\n").unwrap();
        std::fs::write(dir.path().join("src/b.txt"), "TODO text\n").unwrap();
        std::fs::write(dir.path().join("target/c.rs"), "// TODO: skipped\n").unwrap();
        dir
    }

    #[test]
    fn test_search_with_glob() {
        let dir = workspace();
        let tool = SearchFilesTool::new(SafeFs::new(dir.path()), 50);
        let (results, limited) = tool
            .search(".", "TODO", Some("*.rs"), &CancellationSignal::never())
            .unwrap();
        assert!(!limited);
        assert_eq!(
            results,
            vec![FileMatches {
                path: "src/a.rs".into(),
                matches: 1,
                blocks: vec![vec![
                    SearchLine::new(1, "fn a() {}", false),
                    SearchLine::new(2, "// TODO: b", true),
                ]],
            }]
        );
    }

    #[test]
    fn test_context_lines_merge_and_split() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("lib.rs"),
            "use a;\nfn hit1() {}\nfn hit2() {}\nstruct S;\nconst X: u8 = 1;\nenum E {}\nfn hit3() {}\n",
        )
        .unwrap();
        let tool = SearchFilesTool::new(SafeFs::new(dir.path()), 10);
        let (results, _) = tool
            .search(".", "hit", None, &CancellationSignal::never())
            .unwrap();
        assert_eq!(results[0].matches, 3);
        let shape: Vec<Vec<(usize, bool)>> = results[0]
            .blocks
            .iter()
            .map(|b| b.iter().map(|l| (l.line, l.is_match)).collect())
            .collect();
        assert_eq!(
            shape,
            vec![
                vec![(1, false), (2, true), (3, true), (4, false)],
                vec![(6, false), (7, true)],
            ]
        );

        let text = format_results(&results, false, 10);
        assert!(text.starts_with("Found 3 results."));
        assert!(text.contains("    2 > fn hit1() {}\n"));
        assert!(text.contains("    4 | struct S;\n  ----\n    6 | enum E {}\n"));
    }

    #[test]
    fn test_search_limit() {
        let dir = workspace();
        let tool = SearchFilesTool::new(SafeFs::new(dir.path()), 1);
        let (results, limited) = tool
            .search(".", "TODO", None, &CancellationSignal::never())
            .unwrap();
        assert!(limited);
        assert_eq!(results.len(), 1);
        let text = format_results(&results, limited, 1);
        assert!(text.starts_with("Found 1 result."));
        assert!(text.contains("Showing the first 1 results"));
    }

    #[test]
    fn test_invalid_regex_is_tool_error() {
        let dir = workspace();
        let tool = SearchFilesTool::new(SafeFs::new(dir.path()), 10);
        let err = tool
            .search(".", "(", None, &CancellationSignal::never())
            .unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::ToolError);
        assert!(err.message.contains("Invalid regex"));
    }
}
