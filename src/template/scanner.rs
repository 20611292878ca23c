//! Scanner Module
//!
//! 段落のテキストから`{{NAME}}`形式のタグを検出するモジュール。
//! Wordは1つのタグを複数のラン（`w:r`）に分割して保存することがあるため、
//! 段落内のすべての`w:t`テキストを連結した文字列に対して検出を行います。

use crate::error::TemplateIssue;

/// 開始区切り文字
pub(crate) const OPEN: &str = "{{";
/// 終了区切り文字
pub(crate) const CLOSE: &str = "}}";

/// エラーメッセージに含めるタグ断片の最大文字数
const SNIPPET_CHARS: usize = 12;

/// 段落テキスト内のタグ
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Tag {
    /// 区切り文字間のテキスト（大文字小文字・空白は記述どおり）
    pub name: String,
    /// `{{`の開始バイト位置
    pub start: usize,
    /// `}}`の直後のバイト位置
    pub end: usize,
}

/// 段落テキストを走査してタグを抽出する
///
/// 検出された構文上の問題はすべて`issues`に追加されます（最初の1件で止まりません）。
pub(crate) fn scan(text: &str, issues: &mut Vec<TemplateIssue>) -> Vec<Tag> {
    let mut tags = Vec::new();
    let mut open: Option<usize> = None;
    let mut pos = 0;

    while let Some((at, is_open)) = next_delimiter(text, pos) {
        if is_open {
            if let Some(previous) = open {
                issues.push(
                    TemplateIssue::new("duplicate_open_tag", "Duplicate open tag, expected one open tag")
                        .with_explanation(format!(
                            "The tag beginning with \"{}\" has duplicate open tags",
                            snippet_from(text, previous)
                        )),
                );
            }
            open = Some(at);
            pos = at + OPEN.len();
            continue;
        }

        match open.take() {
            None => {
                issues.push(
                    TemplateIssue::new("unopened_tag", "Unopened tag").with_explanation(format!(
                        "The tag ending with \"{}\" is unopened",
                        snippet_until(text, at + CLOSE.len())
                    )),
                );
            }
            Some(start) => {
                let name = &text[start + OPEN.len()..at];
                if name.trim().is_empty() {
                    issues.push(
                        TemplateIssue::new("empty_tag", "Empty tag").with_explanation(format!(
                            "The tag \"{}\" has no name",
                            &text[start..at + CLOSE.len()]
                        )),
                    );
                } else {
                    tags.push(Tag {
                        name: name.to_string(),
                        start,
                        end: at + CLOSE.len(),
                    });
                }
            }
        }
        pos = at + CLOSE.len();
    }

    if let Some(start) = open {
        issues.push(
            TemplateIssue::new("unclosed_tag", "Unclosed tag").with_explanation(format!(
                "The tag beginning with \"{}\" is unclosed",
                snippet_from(text, start)
            )),
        );
    }

    tags
}

/// `pos`以降で最初に現れる区切り文字を探す
///
/// 戻り値は（位置, 開始区切りかどうか）。
fn next_delimiter(text: &str, pos: usize) -> Option<(usize, bool)> {
    let rest = &text[pos..];
    let open = rest.find(OPEN);
    let close = rest.find(CLOSE);

    match (open, close) {
        (Some(o), Some(c)) if o <= c => Some((pos + o, true)),
        (_, Some(c)) => Some((pos + c, false)),
        (Some(o), None) => Some((pos + o, true)),
        (None, None) => None,
    }
}

fn snippet_from(text: &str, start: usize) -> String {
    text[start..].chars().take(SNIPPET_CHARS).collect()
}

fn snippet_until(text: &str, end: usize) -> String {
    let chars: Vec<char> = text[..end].chars().collect();
    let from = chars.len().saturating_sub(SNIPPET_CHARS);
    chars[from..].iter().collect()
}

/// プレースホルダー名の推奨形式（`[A-Z0-9_]+`、大文字化後）を満たすか判定
pub fn is_valid_placeholder_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .to_uppercase()
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}
