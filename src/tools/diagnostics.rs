//! 诊断能力：写文件后查询编辑器 / 编译器给出的错误
//!
//! 宿主侧实现 DiagnosticsProvider；内置 NoDiagnostics 不报告任何问题。

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;

/// 单个文件的诊断结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDiagnostic {
    /// 相对工作区的路径
    pub key: String,
    pub error: Option<String>,
}

#[async_trait]
pub trait DiagnosticsProvider: Send + Sync {
    async fn get_diagnostics(&self, paths: &[PathBuf]) -> Vec<FileDiagnostic>;
}

/// 不报告任何诊断
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDiagnostics;

#[async_trait]
impl DiagnosticsProvider for NoDiagnostics {
    async fn get_diagnostics(&self, paths: &[PathBuf]) -> Vec<FileDiagnostic> {
        paths
            .iter()
            .map(|p| FileDiagnostic {
                key: p.to_string_lossy().to_string(),
                error: None,
            })
            .collect()
    }
}

/// 把有错误的文件拼成追加在工具结果后的说明；没有错误时返回 None
pub fn format_problems(diagnostics: &[FileDiagnostic]) -> Option<String> {
    let problems: Vec<String> = diagnostics
        .iter()
        .filter_map(|d| d.error.as_ref().map(|e| format!("{}\n{}", d.key, e.trim_end())))
        .collect();
    if problems.is_empty() {
        None
    } else {
        Some(format!(
            "New problems detected after saving the file:\n\n{}",
            problems.join("\n\n")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_diagnostics_reports_clean() {
        let d = NoDiagnostics
            .get_diagnostics(&[PathBuf::from("src/lib.rs")])
            .await;
        assert_eq!(d.len(), 1);
        assert!(d[0].error.is_none());
        assert!(format_problems(&d).is_none());
    }

    #[test]
    fn test_format_problems() {
        let d = vec![
            FileDiagnostic {
                key: "src/a.rs".into(),
                error: Some("3:1 expected `;`\n".into()),
            },
            FileDiagnostic {
                key: "src/b.rs".into(),
                error: None,
            },
        ];
        let text = format_problems(&d).unwrap();
        assert!(text.contains("src/a.rs\n3:1 expected `;`"));
        assert!(!text.contains("src/b.rs"));
    }
}
