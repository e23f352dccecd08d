//! 沙箱文件系统工具
//!
//! SafeFs 绑定工作区根目录，所有路径必须落在根下（禁止 ../ 或绝对路径逃逸）；
//! read_file / write_to_file / list_files 基于 SafeFs 实现。

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use walkdir::WalkDir;

use crate::core::{CancellationSignal, TaskError};
use crate::parser::ToolInput;
use crate::tools::definitions::{LIST_FILES, READ_FILE, WRITE_TO_FILE};
use crate::tools::diagnostics::{format_problems, DiagnosticsProvider};
use crate::tools::{Tool, ToolOutput};

/// list_files 最多返回的条目数
const LIST_LIMIT: usize = 200;

/// 沙箱文件系统：绑定根目录，校验路径在根下
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 词法归一化后检查是否在根下；目标可以尚不存在（供写入使用）
    pub fn resolve(&self, path: &str) -> Result<PathBuf, TaskError> {
        let trimmed = path.trim();
        let mut resolved = self.root_dir.clone();
        for component in Path::new(trimmed).components() {
            match component {
                Component::CurDir => {}
                Component::Normal(part) => resolved.push(part),
                Component::ParentDir => {
                    if resolved == self.root_dir || !resolved.pop() {
                        return Err(escape_error(trimmed));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    let absolute = PathBuf::from(trimmed);
                    return if absolute.starts_with(&self.root_dir) {
                        let relative = absolute.strip_prefix(&self.root_dir).unwrap_or(&absolute);
                        self.resolve(&relative.to_string_lossy())
                    } else {
                        Err(escape_error(trimmed))
                    };
                }
            }
        }
        // 最近的已存在祖先（可能是目标本身）再按真实路径检查，挡住经由符号链接的逃逸；
        // 新文件的父目录是指向根外的链接时同样拒绝
        let existing = resolved
            .ancestors()
            .take_while(|p| p.starts_with(&self.root_dir))
            .find(|p| p.symlink_metadata().is_ok());
        if let Some(existing) = existing {
            match existing.canonicalize() {
                Ok(canonical) if canonical.starts_with(&self.root_dir) => {}
                // 悬空链接或指向根外
                _ => return Err(escape_error(trimmed)),
            }
        }
        Ok(resolved)
    }

    /// 相对根目录的显示路径
    pub fn display(&self, path: &Path) -> String {
        path.strip_prefix(&self.root_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    pub async fn read_file(&self, path: &str, max_bytes: usize) -> Result<String, TaskError> {
        let resolved = self.resolve(path)?;
        let bytes = tokio::fs::read(&resolved)
            .await
            .map_err(|e| TaskError::tool(format!("Read failed for {}: {}", path, e)))?;
        if bytes.len() > max_bytes {
            let head = String::from_utf8_lossy(&bytes[..max_bytes]);
            return Ok(format!(
                "{}\n[truncated: file is {} bytes, showing the first {}]",
                head,
                bytes.len(),
                max_bytes
            ));
        }
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    /// 写入完整内容，按需创建父目录；返回实际路径
    pub async fn write_file(&self, path: &str, content: &str) -> Result<PathBuf, TaskError> {
        let resolved = self.resolve(path)?;
        if resolved == self.root_dir {
            return Err(TaskError::tool("Write failed: path points at the workspace root"));
        }
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TaskError::tool(format!("Create dir failed: {}", e)))?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| TaskError::tool(format!("Write failed for {}: {}", path, e)))?;
        Ok(resolved)
    }

    /// 列目录（隐藏文件跳过，目录名带 `/` 后缀）；返回条目与是否被截断
    pub fn list_dir(&self, path: &str, recursive: bool) -> Result<(Vec<String>, bool), TaskError> {
        let base = self.resolve(path)?;
        if !base.is_dir() {
            return Err(TaskError::tool(format!("Not a directory: {}", path)));
        }
        let max_depth = if recursive { usize::MAX } else { 1 };
        let mut entries = Vec::new();
        let mut truncated = false;
        let walker = WalkDir::new(&base)
            .min_depth(1)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));
        for entry in walker {
            let entry = entry.map_err(|e| TaskError::tool(format!("List failed: {}", e)))?;
            if entries.len() >= LIST_LIMIT {
                truncated = true;
                break;
            }
            let rel = self.display(entry.path());
            let suffix = if entry.file_type().is_dir() { "/" } else { "" };
            entries.push(format!("{}{}", rel, suffix));
        }
        Ok((entries, truncated))
    }
}

fn escape_error(path: &str) -> TaskError {
    TaskError::tool(format!("Path escapes the workspace: {}", path))
}

/// read_file：读取文件内容
pub struct ReadFileTool {
    fs: SafeFs,
    max_bytes: usize,
}

impl ReadFileTool {
    pub fn new(fs: SafeFs, max_bytes: usize) -> Self {
        Self { fs, max_bytes }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        READ_FILE
    }

    async fn execute(
        &self,
        input: &ToolInput,
        _signal: &CancellationSignal,
    ) -> Result<ToolOutput, TaskError> {
        let path = input.require_text("path")?.trim();
        tracing::info!(path = %path, "read_file");
        let content = self.fs.read_file(path, self.max_bytes).await?;
        Ok(ToolOutput::text(content))
    }
}

/// write_to_file：覆盖写入并附带诊断结果
pub struct WriteToFileTool {
    fs: SafeFs,
    diagnostics: Arc<dyn DiagnosticsProvider>,
}

impl WriteToFileTool {
    pub fn new(fs: SafeFs, diagnostics: Arc<dyn DiagnosticsProvider>) -> Self {
        Self { fs, diagnostics }
    }
}

#[async_trait]
impl Tool for WriteToFileTool {
    fn name(&self) -> &str {
        WRITE_TO_FILE
    }

    async fn execute(
        &self,
        input: &ToolInput,
        signal: &CancellationSignal,
    ) -> Result<ToolOutput, TaskError> {
        let path = input.require_text("path")?.trim();
        let content = input.text("content").unwrap_or_default();
        signal.check()?;

        let written = self.fs.write_file(path, content).await?;
        tracing::info!(path = %path, bytes = content.len(), "write_to_file");

        let rel = PathBuf::from(self.fs.display(&written));
        let diagnostics = self.diagnostics.get_diagnostics(&[rel]).await;
        let mut text = format!("The content was successfully saved to {}.", path);
        if let Some(problems) = format_problems(&diagnostics) {
            text.push_str("\n\n");
            text.push_str(&problems);
        }
        Ok(ToolOutput::text(text))
    }
}

/// list_files：列目录
pub struct ListFilesTool {
    fs: SafeFs,
}

impl ListFilesTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        LIST_FILES
    }

    async fn execute(
        &self,
        input: &ToolInput,
        _signal: &CancellationSignal,
    ) -> Result<ToolOutput, TaskError> {
        let path = input.require_text("path")?.trim();
        let recursive = input.text("recursive") == Some("true");
        tracing::info!(path = %path, recursive, "list_files");

        let fs = self.fs.clone();
        let owned = path.to_string();
        let (entries, truncated) =
            tokio::task::spawn_blocking(move || fs.list_dir(&owned, recursive))
                .await
                .map_err(|e| TaskError::unknown(format!("list_files worker failed: {}", e)))??;

        if entries.is_empty() {
            return Ok(ToolOutput::text("No files found."));
        }
        let mut text = entries.join("\n");
        if truncated {
            text.push_str(&format!(
                "\n\n(File list truncated at {} entries. Use list_files on specific subdirectories to explore further.)",
                LIST_LIMIT
            ));
        }
        Ok(ToolOutput::text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskErrorKind;
    use crate::parser::FieldValue;
    use crate::tools::diagnostics::{FileDiagnostic, NoDiagnostics};

    fn input(pairs: &[(&str, &str)]) -> ToolInput {
        pairs
            .iter()
            .map(|(k, v)| (*k, FieldValue::Text(v.to_string())))
            .collect()
    }

    #[test]
    fn test_resolve_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(dir.path());
        assert!(fs.resolve("src/../a.txt").is_ok());
        let err = fs.resolve("../etc/passwd").unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::ToolError);
        assert!(err.message.contains("escapes"));
        assert!(fs.resolve("/etc/passwd").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_rejects_new_file_under_outside_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("gone"), dir.path().join("dangling"))
            .unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        let fs = SafeFs::new(dir.path());

        assert!(fs.resolve("link").is_err());
        assert!(fs.resolve("link/new.txt").is_err());
        assert!(fs.resolve("link/deep/new.txt").is_err());
        assert!(fs.resolve("dangling").is_err());
        assert!(fs.resolve("src/new/file.rs").is_ok());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(dir.path());
        let write = WriteToFileTool::new(fs.clone(), Arc::new(NoDiagnostics));
        let out = write
            .execute(
                &input(&[("path", "nested/dir/a.txt"), ("content", "hello")]),
                &CancellationSignal::never(),
            )
            .await
            .unwrap();
        assert!(out.text.contains("successfully saved"));

        let read = ReadFileTool::new(fs, 1024);
        let out = read
            .execute(&input(&[("path", "nested/dir/a.txt")]), &CancellationSignal::never())
            .await
            .unwrap();
        assert_eq!(out.text, "hello");
    }

    #[tokio::test]
    async fn test_read_truncates_large_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(100)).unwrap();
        let read = ReadFileTool::new(SafeFs::new(dir.path()), 10);
        let out = read
            .execute(&input(&[("path", "big.txt")]), &CancellationSignal::never())
            .await
            .unwrap();
        assert!(out.text.starts_with("xxxxxxxxxx\n[truncated"));
    }

    #[tokio::test]
    async fn test_read_missing_file_is_tool_error() {
        let dir = tempfile::tempdir().unwrap();
        let read = ReadFileTool::new(SafeFs::new(dir.path()), 10);
        let err = read
            .execute(&input(&[("path", "nope.txt")]), &CancellationSignal::never())
            .await
            .unwrap_err();
        assert_eq!(err.kind, TaskErrorKind::ToolError);
    }

    struct AlwaysBroken;

    #[async_trait]
    impl DiagnosticsProvider for AlwaysBroken {
        async fn get_diagnostics(&self, paths: &[PathBuf]) -> Vec<FileDiagnostic> {
            paths
                .iter()
                .map(|p| FileDiagnostic {
                    key: p.to_string_lossy().to_string(),
                    error: Some("1:1 syntax error".into()),
                })
                .collect()
        }
    }

    #[tokio::test]
    async fn test_write_reports_diagnostics() {
        let dir = tempfile::tempdir().unwrap();
        let write = WriteToFileTool::new(SafeFs::new(dir.path()), Arc::new(AlwaysBroken));
        let out = write
            .execute(
                &input(&[("path", "src/lib.rs"), ("content", "fn")]),
                &CancellationSignal::never(),
            )
            .await
            .unwrap();
        assert!(out.text.contains("src/lib.rs\n1:1 syntax error"));
    }

    #[tokio::test]
    async fn test_list_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/bin")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "").unwrap();
        std::fs::write(dir.path().join("src/bin/main.rs"), "").unwrap();
        std::fs::write(dir.path().join(".hidden"), "").unwrap();
        let list = ListFilesTool::new(SafeFs::new(dir.path()));

        let out = list
            .execute(&input(&[("path", ".")]), &CancellationSignal::never())
            .await
            .unwrap();
        assert_eq!(out.text, "src/");

        let recursive: ToolInput = [
            ("path", FieldValue::Text(".".into())),
            ("recursive", FieldValue::Enum("true".into())),
        ]
        .into_iter()
        .collect();
        let out = list.execute(&recursive, &CancellationSignal::never()).await.unwrap();
        assert_eq!(out.text, "src/\nsrc/bin/\nsrc/bin/main.rs\nsrc/lib.rs");
    }
}
