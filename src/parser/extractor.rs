//! 流式 XML 标签提取器
//!
//! 每轮模型输出一个实例。只识别注册表中的 `<toolName>` 开始标记，其他 `<` 一律当作普通文本；
//! 可能成为已知开始标记前缀的尾部文本会被暂存，直到下一个 chunk 消除歧义。
//! 片段内部对同名标签做深度计数，保证取到最大的平衡区域。片段在闭合标签出现时立即产出，
//! 产出序列与 chunk 的切分方式无关。

use std::sync::Arc;

use crate::tools::SchemaRegistry;

/// 片段是否完整闭合
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    Complete,
    /// 流结束时仍未闭合
    Partial,
}

/// 一次工具调用的原始片段；偏移量为本轮累计输出中的字节位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFragment {
    pub tag_name: String,
    pub raw_inner: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub kind: FragmentKind,
}

impl ExtractedFragment {
    pub fn is_complete(&self) -> bool {
        self.kind == FragmentKind::Complete
    }
}

/// 提取器输出：普通文本或工具片段，保持原始顺序
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Text(String),
    Fragment(ExtractedFragment),
}

#[derive(Debug)]
struct OpenFragment {
    name: String,
    open_marker: String,
    close_marker: String,
    start: usize,
    body_start: usize,
    depth: usize,
}

/// 单轮流式提取器
#[derive(Debug)]
pub struct FragmentExtractor {
    registry: Arc<SchemaRegistry>,
    markers: Vec<(String, String)>,
    /// 尚未丢弃的输出；buf[0] 对应累计偏移 base
    buf: String,
    base: usize,
    /// 下一次扫描位置（buf 内）
    scan: usize,
    /// 尚未作为 Text 产出的普通文本起点（buf 内）
    text_start: usize,
    open: Option<OpenFragment>,
}

impl FragmentExtractor {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        let markers = registry
            .names()
            .map(|name| (name.to_string(), format!("<{}>", name)))
            .collect();
        Self {
            registry,
            markers,
            buf: String::new(),
            base: 0,
            scan: 0,
            text_start: 0,
            open: None,
        }
    }

    /// 追加一个 chunk，返回本次可确定的文本与片段
    pub fn push(&mut self, chunk: &str) -> Vec<StreamItem> {
        self.buf.push_str(chunk);
        let mut items = Vec::new();
        loop {
            let progressed = if self.open.is_some() {
                self.scan_fragment(&mut items)
            } else {
                self.scan_text(&mut items)
            };
            if !progressed {
                break;
            }
        }
        self.compact();
        items
    }

    /// 当前打开的片段：(工具名, 已收到的正文)
    pub fn in_progress(&self) -> Option<(&str, &str)> {
        self.open
            .as_ref()
            .map(|open| (open.name.as_str(), &self.buf[open.body_start..]))
    }

    /// 流结束：未闭合的片段以 Partial 产出，暂存文本原样冲刷
    pub fn finish(self) -> Vec<StreamItem> {
        let mut items = Vec::new();
        match self.open {
            Some(open) => {
                if open.start > self.text_start {
                    items.push(StreamItem::Text(
                        self.buf[self.text_start..open.start].to_string(),
                    ));
                }
                items.push(StreamItem::Fragment(ExtractedFragment {
                    tag_name: open.name,
                    raw_inner: self.buf[open.body_start..].to_string(),
                    start_offset: self.base + open.start,
                    end_offset: self.base + self.buf.len(),
                    kind: FragmentKind::Partial,
                }));
            }
            None => {
                if self.text_start < self.buf.len() {
                    items.push(StreamItem::Text(self.buf[self.text_start..].to_string()));
                }
            }
        }
        items
    }

    /// 片段外扫描；返回 true 表示进入了片段，需要继续
    fn scan_text(&mut self, items: &mut Vec<StreamItem>) -> bool {
        while let Some(rel) = self.buf[self.scan..].find('<') {
            let at = self.scan + rel;
            let matched = {
                let rest = &self.buf[at..];
                self.markers
                    .iter()
                    .find(|(_, m)| rest.starts_with(m.as_str()))
                    .cloned()
            };

            if let Some((name, marker)) = matched {
                self.flush_text(at, items);
                tracing::debug!(tool = %name, offset = self.base + at, "tool fragment opened");
                self.scan = at + marker.len();
                self.open = Some(OpenFragment {
                    close_marker: format!("</{}>", name),
                    name,
                    open_marker: marker,
                    start: at,
                    body_start: self.scan,
                    depth: 1,
                });
                return true;
            }

            if self.could_become_marker(&self.buf[at..]) {
                // 暂存：等待后续 chunk 决定这是否是开始标记
                self.flush_text(at, items);
                self.scan = at;
                return false;
            }

            self.scan = at + 1;
        }
        self.scan = self.buf.len();
        self.flush_text(self.buf.len(), items);
        false
    }

    /// 片段内扫描；返回 true 表示片段已闭合
    fn scan_fragment(&mut self, items: &mut Vec<StreamItem>) -> bool {
        let Some(open) = self.open.as_mut() else {
            return false;
        };
        while let Some(rel) = self.buf[self.scan..].find('<') {
            let at = self.scan + rel;
            let rest = &self.buf[at..];

            if rest.starts_with(open.open_marker.as_str()) {
                open.depth += 1;
                self.scan = at + open.open_marker.len();
                continue;
            }
            if rest.starts_with(open.close_marker.as_str()) {
                open.depth -= 1;
                self.scan = at + open.close_marker.len();
                if open.depth == 0 {
                    let fragment = ExtractedFragment {
                        tag_name: open.name.clone(),
                        raw_inner: self.buf[open.body_start..at].to_string(),
                        start_offset: self.base + open.start,
                        end_offset: self.base + self.scan,
                        kind: FragmentKind::Complete,
                    };
                    tracing::debug!(
                        tool = %fragment.tag_name,
                        start = fragment.start_offset,
                        end = fragment.end_offset,
                        "tool fragment closed"
                    );
                    items.push(StreamItem::Fragment(fragment));
                    self.open = None;
                    self.text_start = self.scan;
                    return true;
                }
                continue;
            }
            let incomplete = (open.open_marker.len() > rest.len()
                && open.open_marker.starts_with(rest))
                || (open.close_marker.len() > rest.len() && open.close_marker.starts_with(rest));
            if incomplete {
                self.scan = at;
                return false;
            }
            self.scan = at + 1;
        }
        self.scan = self.buf.len();
        false
    }

    fn could_become_marker(&self, rest: &str) -> bool {
        self.markers
            .iter()
            .any(|(_, m)| m.len() > rest.len() && m.starts_with(rest))
    }

    fn flush_text(&mut self, upto: usize, items: &mut Vec<StreamItem>) {
        if upto > self.text_start {
            items.push(StreamItem::Text(self.buf[self.text_start..upto].to_string()));
        }
        self.text_start = upto;
    }

    /// 丢弃已产出的前缀，偏移量通过 base 保持累计
    fn compact(&mut self) {
        if self.open.is_some() {
            return;
        }
        let cut = self.text_start.min(self.scan);
        if cut == 0 {
            return;
        }
        self.buf.drain(..cut);
        self.base += cut;
        self.scan -= cut;
        self.text_start -= cut;
    }
}
