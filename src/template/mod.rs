//! Template Module
//!
//! DOCXテンプレートの解析とレンダリングを行うモジュール。
//!
//! テンプレートは1回だけ解析され、以後は読み取り専用のスナップショットとして扱われます。
//! 各行のレンダリングは独立したコンテキストで行われるため、ある行の失敗が
//! 他の行の出力に影響することはありません。

mod container;
mod document;
mod scanner;

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::error::{MergeZeroError, TemplateError, TemplateIssue};
use crate::security::SecurityConfig;
use crate::types::Row;
use container::Entry;
use document::XmlPart;

pub(crate) use container::deterministic_options;
pub use scanner::is_valid_placeholder_name;

/// メイン文書パート
const MAIN_PART: &str = "word/document.xml";

/// コンテナ内のパート
#[derive(Debug, Clone)]
enum Part {
    /// そのままコピーするエントリ
    Raw(Entry),
    /// タグを置換するXMLパート
    Xml { name: String, part: XmlPart },
}

/// 解析済みのDOCXテンプレート
///
/// # 使用例
///
/// ```rust,no_run
/// use mergezero::{Row, Template};
///
/// # fn main() -> Result<(), mergezero::MergeZeroError> {
/// let bytes = std::fs::read("receipt.docx")?;
/// let template = Template::parse(&bytes)?;
///
/// let row = Row::from_pairs([("Name", "Ana"), ("Amount", "10")]);
/// let rendered = template.render(&row)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Template {
    parts: Vec<Part>,
    placeholders: Vec<String>,
}

impl Template {
    /// テンプレートのバイト列を解析する
    ///
    /// # 戻り値
    ///
    /// * `Ok(Template)` - 解析に成功した場合
    /// * `Err(MergeZeroError::Template)` - コンテナとして開けない、またはタグ構文が不正な場合
    ///   （検出されたすべての問題を含む）
    /// * `Err(MergeZeroError::SecurityViolation)` - セキュリティ制限に違反した場合
    pub fn parse(bytes: &[u8]) -> Result<Self, MergeZeroError> {
        Self::parse_with(bytes, &SecurityConfig::default())
    }

    pub(crate) fn parse_with(bytes: &[u8], security: &SecurityConfig) -> Result<Self, MergeZeroError> {
        let entries = container::read_entries(bytes, security)?;

        if !entries.iter().any(|e| e.name == MAIN_PART && e.data.is_some()) {
            return Err(TemplateError::single(
                TemplateIssue::new("missing_main_part", "Template is not a valid document")
                    .with_explanation(format!("The container has no '{}' part", MAIN_PART)),
            )
            .into());
        }

        let mut issues = Vec::new();
        let mut parts = Vec::with_capacity(entries.len());

        for entry in entries {
            match entry.data {
                Some(ref data) if is_content_part(&entry.name) => {
                    if let Some(part) = XmlPart::parse(&entry.name, data, &mut issues) {
                        parts.push(Part::Xml {
                            name: entry.name,
                            part,
                        });
                    }
                }
                _ => parts.push(Part::Raw(entry)),
            }
        }

        if !issues.is_empty() {
            return Err(TemplateError::new(issues).into());
        }

        let mut seen = HashSet::new();
        let placeholders: Vec<String> = parts
            .iter()
            .filter_map(|part| match part {
                Part::Xml { part, .. } => Some(part.tag_names()),
                Part::Raw(_) => None,
            })
            .flatten()
            .filter(|name| seen.insert(*name))
            .map(str::to_string)
            .collect();

        debug!(
            parts = parts.len(),
            placeholders = placeholders.len(),
            "parsed template"
        );

        Ok(Self {
            parts,
            placeholders,
        })
    }

    /// テンプレート内のプレースホルダー名（重複なし、出現順、記述どおりの大文字小文字）
    pub fn placeholders(&self) -> &[String] {
        &self.placeholders
    }

    /// 1行分のデータを差し込んだ文書を生成する
    ///
    /// 行のキーは大文字化してからプレースホルダーと照合します。
    /// 対応するキーがないプレースホルダーは空文字列になります。
    ///
    /// # 戻り値
    ///
    /// * `Ok(Vec<u8>)` - Deflate圧縮されたDOCXのバイト列
    /// * `Err(TemplateError)` - 値に文書に含められない文字がある場合など（すべての問題を含む）
    pub fn render(&self, row: &Row) -> Result<Vec<u8>, TemplateError> {
        let context = RenderContext::new(row);
        context.check(&self.placeholders)?;

        let mut rendered: Vec<(String, Option<Vec<u8>>)> = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            match part {
                Part::Raw(entry) => rendered.push((entry.name.clone(), entry.data.clone())),
                Part::Xml { name, part } => {
                    let xml = part.render(|tag| context.value(tag).to_string()).map_err(|e| {
                        TemplateError::single(
                            TemplateIssue::new("render_failed", "Failed to write document part")
                                .with_explanation(e.to_string())
                                .in_part(name.as_str()),
                        )
                    })?;
                    rendered.push((name.clone(), Some(xml)));
                }
            }
        }

        container::write_entries(
            rendered
                .iter()
                .map(|(name, data)| (name.as_str(), data.as_deref())),
        )
        .map_err(|e| {
            TemplateError::single(
                TemplateIssue::new("render_failed", "Failed to write document container")
                    .with_explanation(e.to_string()),
            )
        })
    }
}

/// 1行分のレンダリングコンテキスト
///
/// キーは大文字化されています。
struct RenderContext<'a> {
    values: HashMap<String, &'a str>,
}

impl<'a> RenderContext<'a> {
    fn new(row: &'a Row) -> Self {
        Self {
            values: row.iter().map(|(k, v)| (k.to_uppercase(), v)).collect(),
        }
    }

    fn value(&self, tag: &str) -> &'a str {
        self.values.get(&tag.to_uppercase()).copied().unwrap_or("")
    }

    /// 差し込む値がXML文書に含められるか検証する
    fn check(&self, placeholders: &[String]) -> Result<(), TemplateError> {
        let issues: Vec<TemplateIssue> = placeholders
            .iter()
            .filter_map(|name| {
                let value = self.value(name);
                value.chars().find(|c| !is_xml_char(*c)).map(|c| {
                    TemplateIssue::new(
                        "invalid_character",
                        format!("Value for {{{{{}}}}} contains a character not allowed in documents", name),
                    )
                    .with_explanation(format!("Character U+{:04X} cannot be written", c as u32))
                })
            })
            .collect();

        if issues.is_empty() {
            Ok(())
        } else {
            Err(TemplateError::new(issues))
        }
    }
}

/// XML 1.0で許可される文字か判定
fn is_xml_char(c: char) -> bool {
    matches!(c,
        '\u{9}' | '\u{A}' | '\u{D}'
        | '\u{20}'..='\u{D7FF}'
        | '\u{E000}'..='\u{FFFD}'
        | '\u{10000}'..='\u{10FFFF}')
}

/// タグ置換の対象となるパートか判定
fn is_content_part(name: &str) -> bool {
    if name == MAIN_PART || name == "word/footnotes.xml" || name == "word/endnotes.xml" {
        return true;
    }
    match name.strip_prefix("word/") {
        Some(rest) => {
            !rest.contains('/')
                && rest.ends_with(".xml")
                && (rest.starts_with("header") || rest.starts_with("footer"))
        }
        None => false,
    }
}

/// テンプレートからプレースホルダー名を抽出する
///
/// # 戻り値
///
/// * `Ok(Vec<String>)` - 重複を除いたプレースホルダー名（出現順）
/// * `Err(MergeZeroError::Template)` - テンプレートが不正な場合
pub fn extract_placeholders(bytes: &[u8]) -> Result<Vec<String>, MergeZeroError> {
    Ok(Template::parse(bytes)?.placeholders)
}

#[cfg(test)]
pub(crate) mod testing {
    //! テスト用のDOCX生成ヘルパー

    /// 段落ごとにランのテキストを指定してDOCXを生成する
    pub fn docx_with_runs(paragraphs: &[&[&str]]) -> Vec<u8> {
        let mut body = String::new();
        for runs in paragraphs {
            body.push_str("<w:p>");
            for run in *runs {
                body.push_str("<w:r><w:t>");
                body.push_str(run);
                body.push_str("</w:t></w:r>");
            }
            body.push_str("</w:p>");
        }
        docx_with_body(&body, &[])
    }

    /// 1段落1ランのDOCXを生成する
    pub fn docx(paragraphs: &[&str]) -> Vec<u8> {
        let runs: Vec<[&str; 1]> = paragraphs.iter().map(|p| [*p]).collect();
        let refs: Vec<&[&str]> = runs.iter().map(|r| &r[..]).collect();
        docx_with_runs(&refs)
    }

    /// 本文XMLと追加パートからDOCXを生成する
    pub fn docx_with_body(body: &str, extra: &[(&str, &str)]) -> Vec<u8> {
        let document = format!(
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
                r#"<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">"#,
                "<w:body>{}</w:body></w:document>"
            ),
            body
        );

        let mut entries: Vec<(&str, Option<&[u8]>)> = vec![
            ("[Content_Types].xml", Some(CONTENT_TYPES.as_bytes())),
            ("_rels/.rels", Some(RELS.as_bytes())),
            ("word/document.xml", Some(document.as_bytes())),
        ];
        for (name, xml) in extra {
            entries.push((*name, Some(xml.as_bytes())));
        }

        super::container::write_entries(entries).unwrap()
    }

    const CONTENT_TYPES: &str = concat!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
        r#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">"#,
        r#"<Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>"#,
        r#"<Default Extension="xml" ContentType="application/xml"/>"#,
        r#"<Override PartName="/word/document.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml"/>"#,
        "</Types>"
    );

    const RELS: &str = concat!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
        r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
        r#"<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="word/document.xml"/>"#,
        "</Relationships>"
    );

    /// DOCXのバイト列から本文XMLを取り出す
    pub fn document_xml(bytes: &[u8]) -> String {
        part_xml(bytes, "word/document.xml")
    }

    pub fn part_xml(bytes: &[u8], name: &str) -> String {
        use std::io::Read;

        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        let mut file = archive.by_name(name).unwrap();
        let mut xml = String::new();
        file.read_to_string(&mut xml).unwrap();
        xml
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_placeholders_are_deduplicated_in_order() {
        let bytes = docx(&["{{NAME}} owes {{AMOUNT}}", "Thanks {{NAME}}", "{{name}}"]);
        let template = Template::parse(&bytes).unwrap();
        assert_eq!(template.placeholders(), &["NAME", "AMOUNT", "name"]);
    }

    #[test]
    fn test_placeholders_split_across_runs() {
        let bytes = docx_with_runs(&[&["Dear {{NA", "ME}}", ","]]);
        assert_eq!(extract_placeholders(&bytes).unwrap(), vec!["NAME"]);
    }

    #[test]
    fn test_placeholders_in_headers_and_footers() {
        let bytes = docx_with_body(
            "<w:p><w:r><w:t>{{NAME}}</w:t></w:r></w:p>",
            &[
                ("word/header1.xml", "<w:hdr><w:p><w:r><w:t>{{COMPANY}}</w:t></w:r></w:p></w:hdr>"),
                ("word/footer2.xml", "<w:ftr><w:p><w:r><w:t>{{PAGE_NOTE}}</w:t></w:r></w:p></w:ftr>"),
                ("word/styles.xml", "<w:styles><w:p><w:r><w:t>{{IGNORED}}</w:t></w:r></w:p></w:styles>"),
            ],
        );
        let template = Template::parse(&bytes).unwrap();
        assert_eq!(template.placeholders(), &["NAME", "COMPANY", "PAGE_NOTE"]);
    }

    #[test]
    fn test_parse_aggregates_all_issues() {
        let bytes = docx(&["{{NAME", "AMOUNT}}", "{{A {{B}}"]);
        match Template::parse(&bytes) {
            Err(MergeZeroError::Template(e)) => {
                let ids: Vec<&str> = e.issues().iter().map(|i| i.id.as_str()).collect();
                assert_eq!(ids, vec!["unclosed_tag", "unopened_tag", "duplicate_open_tag"]);
                let message = e.to_string();
                assert!(message.starts_with("Template Error:\n[unclosed_tag] Unclosed tag"));
                assert_eq!(message.lines().count(), 4);
            }
            other => panic!("Expected template error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_missing_main_part() {
        let bytes = container::write_entries(vec![("other.xml", Some(&b"<a/>"[..]))]).unwrap();
        match Template::parse(&bytes) {
            Err(MergeZeroError::Template(e)) => assert!(e.has_issue("missing_main_part")),
            other => panic!("Expected template error, got {:?}", other),
        }
    }

    #[test]
    fn test_render_binds_case_insensitively() {
        let template = Template::parse(&docx(&["{{name}} / {{AMOUNT}}"])).unwrap();
        let row = Row::from_pairs([("Name", "Ana"), ("amount", "10")]);

        let xml = document_xml(&template.render(&row).unwrap());
        assert!(xml.contains("Ana / 10"));
    }

    #[test]
    fn test_render_missing_key_is_empty() {
        let template = Template::parse(&docx(&["[{{PHONE}}]"])).unwrap();
        let xml = document_xml(&template.render(&Row::new()).unwrap());
        assert!(xml.contains("[]"));
        assert!(!xml.contains("PHONE"));
    }

    #[test]
    fn test_render_is_deterministic() {
        let template = Template::parse(&docx(&["{{NAME}}"])).unwrap();
        let row = Row::from_pairs([("Name", "Ana")]);
        assert_eq!(template.render(&row).unwrap(), template.render(&row).unwrap());
    }

    #[test]
    fn test_render_is_isolated_per_row() {
        let template = Template::parse(&docx(&["{{NAME}}"])).unwrap();
        let first = template.render(&Row::from_pairs([("Name", "Ana")])).unwrap();
        let _ = template.render(&Row::from_pairs([("Name", "Bob")])).unwrap();
        let again = template.render(&Row::from_pairs([("Name", "Ana")])).unwrap();
        assert_eq!(first, again);
        assert_eq!(template.placeholders(), &["NAME"]);
    }

    #[test]
    fn test_render_rejects_control_characters() {
        let template = Template::parse(&docx(&["{{A}} {{B}} {{C}}"])).unwrap();
        let row = Row::from_pairs([("A", "bad\u{1}"), ("B", "ok\ttab"), ("C", "\u{0}")]);

        let error = template.render(&row).unwrap_err();
        assert_eq!(error.issues().len(), 2);
        assert!(error.issues().iter().all(|i| i.id == "invalid_character"));
        assert!(error.to_string().contains("{{A}}"));
        assert!(error.to_string().contains("{{C}}"));
    }

    #[test]
    fn test_render_keeps_other_parts() {
        let bytes = docx_with_body(
            "<w:p><w:r><w:t>{{NAME}}</w:t></w:r></w:p>",
            &[("word/header1.xml", "<w:hdr><w:p><w:r><w:t>Co: {{COMPANY}}</w:t></w:r></w:p></w:hdr>")],
        );
        let template = Template::parse(&bytes).unwrap();
        let out = template
            .render(&Row::from_pairs([("Name", "Ana"), ("Company", "ACME")]))
            .unwrap();

        assert!(part_xml(&out, "word/header1.xml").contains("Co: ACME"));
        assert!(part_xml(&out, "[Content_Types].xml").contains("<Types"));
    }

    #[test]
    fn test_is_content_part() {
        assert!(is_content_part("word/document.xml"));
        assert!(is_content_part("word/header3.xml"));
        assert!(is_content_part("word/footer1.xml"));
        assert!(is_content_part("word/footnotes.xml"));
        assert!(!is_content_part("word/styles.xml"));
        assert!(!is_content_part("word/_rels/header1.xml.rels"));
        assert!(!is_content_part("customXml/header1.xml"));
    }
}
