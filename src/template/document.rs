//! Document Part Module
//!
//! WordprocessingMLのパート（`word/document.xml`など）をイベント列として保持し、
//! 段落単位でタグを検出・置換するモジュール。

use std::collections::{HashMap, HashSet};

use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use super::scanner::{self, Tag};
use crate::error::TemplateIssue;

const PARAGRAPH: &[u8] = b"w:p";
const TEXT: &[u8] = b"w:t";

/// `w:t`要素1つ分のテキストノード
#[derive(Debug, Clone)]
struct TextNode {
    /// `w:t`開始タグのイベント位置
    start_event: usize,
    /// テキストイベントの位置
    text_event: usize,
    /// 段落テキスト内の開始バイト位置
    offset: usize,
    /// テキストの長さ（バイト）
    len: usize,
}

/// タグを含む段落
#[derive(Debug, Clone)]
struct Paragraph {
    /// 段落内の全`w:t`を連結したテキスト（アンエスケープ済み）
    text: String,
    nodes: Vec<TextNode>,
    tags: Vec<Tag>,
}

/// 解析済みのXMLパート
///
/// 解析後は読み取り専用で、行ごとのレンダリングは新しいイベント列を生成します。
#[derive(Debug, Clone)]
pub(crate) struct XmlPart {
    events: Vec<Event<'static>>,
    paragraphs: Vec<Paragraph>,
}

/// 構築中の段落
#[derive(Default)]
struct OpenParagraph {
    text: String,
    nodes: Vec<TextNode>,
}

impl XmlPart {
    /// XMLを解析して段落とタグを検出する
    ///
    /// XMLとして不正な場合は`malformed_xml`、タグ構文の問題はそれぞれの識別子で
    /// `issues`に追加されます。
    pub fn parse(part_name: &str, bytes: &[u8], issues: &mut Vec<TemplateIssue>) -> Option<Self> {
        let mut reader = Reader::from_reader(bytes);
        reader.trim_text(false);

        let mut events = Vec::new();
        let mut paragraphs = Vec::new();
        let mut stack: Vec<OpenParagraph> = Vec::new();
        let mut open_text: Option<usize> = None;
        let mut buf = Vec::new();

        loop {
            let event = match reader.read_event_into(&mut buf) {
                Ok(Event::Eof) => break,
                Ok(event) => event.into_owned(),
                Err(e) => {
                    issues.push(
                        TemplateIssue::new("malformed_xml", "Template part is not well-formed XML")
                            .with_explanation(format!(
                                "Error at position {}: {}",
                                reader.buffer_position(),
                                e
                            ))
                            .in_part(part_name),
                    );
                    return None;
                }
            };
            buf.clear();

            let index = events.len();
            match &event {
                Event::Start(e) if e.name().as_ref() == PARAGRAPH => {
                    stack.push(OpenParagraph::default());
                }
                Event::End(e) if e.name().as_ref() == PARAGRAPH => {
                    if let Some(paragraph) = stack.pop() {
                        let tags = scan_paragraph(part_name, &paragraph.text, issues);
                        if !tags.is_empty() {
                            paragraphs.push(Paragraph {
                                text: paragraph.text,
                                nodes: paragraph.nodes,
                                tags,
                            });
                        }
                    }
                }
                Event::Start(e) if e.name().as_ref() == TEXT => open_text = Some(index),
                Event::End(e) if e.name().as_ref() == TEXT => open_text = None,
                Event::Text(e) => {
                    if let (Some(start_event), Some(paragraph)) = (open_text, stack.last_mut()) {
                        let text = match e.unescape() {
                            Ok(text) => text,
                            Err(err) => {
                                issues.push(
                                    TemplateIssue::new(
                                        "malformed_xml",
                                        "Template part contains an invalid escape sequence",
                                    )
                                    .with_explanation(err.to_string())
                                    .in_part(part_name),
                                );
                                return None;
                            }
                        };
                        paragraph.nodes.push(TextNode {
                            start_event,
                            text_event: index,
                            offset: paragraph.text.len(),
                            len: text.len(),
                        });
                        paragraph.text.push_str(&text);
                    }
                }
                _ => {}
            }
            events.push(event);
        }

        Some(Self { events, paragraphs })
    }

    /// パート内のタグ名を出現順に列挙する
    pub fn tag_names(&self) -> impl Iterator<Item = &str> {
        self.paragraphs
            .iter()
            .flat_map(|p| p.tags.iter().map(|t| t.name.as_str()))
    }

    /// タグを値で置換したXMLを生成する
    ///
    /// `lookup`はタグ名から値を返します。改行（`\n`）は`w:br`に変換されます。
    pub fn render<F>(&self, lookup: F) -> Result<Vec<u8>, quick_xml::Error>
    where
        F: Fn(&str) -> String,
    {
        let mut replacements: HashMap<usize, Vec<Event<'static>>> = HashMap::new();
        let mut preserve: HashSet<usize> = HashSet::new();

        for paragraph in &self.paragraphs {
            for node in &paragraph.nodes {
                let Some(new_text) = splice_node(paragraph, node, &lookup) else {
                    continue;
                };
                replacements.insert(node.text_event, text_events(&new_text));
                preserve.insert(node.start_event);
            }
        }

        let mut writer = Writer::new(Vec::new());
        for (index, event) in self.events.iter().enumerate() {
            if let Some(events) = replacements.get(&index) {
                for event in events {
                    writer.write_event(event)?;
                }
            } else if preserve.contains(&index) {
                match event {
                    Event::Start(start) => writer.write_event(Event::Start(preserve_space(start)))?,
                    other => writer.write_event(other)?,
                }
            } else {
                writer.write_event(event)?;
            }
        }

        Ok(writer.into_inner())
    }
}

fn scan_paragraph(part_name: &str, text: &str, issues: &mut Vec<TemplateIssue>) -> Vec<Tag> {
    let mut found = Vec::new();
    let tags = scanner::scan(text, &mut found);
    issues.extend(found.into_iter().map(|issue| issue.in_part(part_name)));
    tags
}

/// テキストノードの置換後の内容を計算する
///
/// タグの開始位置を含むノードに値を挿入し、タグの残りの文字は後続のノードから取り除きます。
/// ノードがどのタグとも重ならない場合は`None`を返します。
fn splice_node<F>(paragraph: &Paragraph, node: &TextNode, lookup: &F) -> Option<String>
where
    F: Fn(&str) -> String,
{
    let node_start = node.offset;
    let node_end = node.offset + node.len;

    let overlapping: Vec<&Tag> = paragraph
        .tags
        .iter()
        .filter(|tag| tag.end > node_start && tag.start < node_end)
        .collect();
    if overlapping.is_empty() {
        return None;
    }

    let text = &paragraph.text;
    let mut out = String::with_capacity(node.len);
    let mut cursor = node_start;

    for tag in overlapping {
        let tag_start = tag.start.max(node_start);
        out.push_str(&text[cursor..tag_start]);
        if tag.start >= node_start {
            out.push_str(&lookup(&tag.name));
        }
        cursor = tag.end.min(node_end);
    }
    out.push_str(&text[cursor..node_end]);

    Some(out)
}

/// 置換後のテキストをイベント列に変換する（改行は`w:br`）
fn text_events(text: &str) -> Vec<Event<'static>> {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut events = Vec::new();

    for (i, line) in normalized.split('\n').enumerate() {
        if i > 0 {
            events.push(Event::End(quick_xml::events::BytesEnd::new("w:t")));
            events.push(Event::Empty(BytesStart::new("w:br")));
            let mut start = BytesStart::new("w:t");
            start.push_attribute(("xml:space", "preserve"));
            events.push(Event::Start(start));
        }
        events.push(Event::Text(BytesText::new(line).into_owned()));
    }

    events
}

/// `xml:space="preserve"`を付加した`w:t`開始タグを生成する
fn preserve_space(start: &BytesStart<'_>) -> BytesStart<'static> {
    let mut out = BytesStart::new("w:t");
    for attr in start.attributes().flatten() {
        if attr.key.as_ref() != b"xml:space" {
            out.push_attribute(attr);
        }
    }
    out.push_attribute(("xml:space", "preserve"));
    out.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(xml: &str) -> (Option<XmlPart>, Vec<TemplateIssue>) {
        let mut issues = Vec::new();
        let part = XmlPart::parse("word/document.xml", xml.as_bytes(), &mut issues);
        (part, issues)
    }

    fn render(part: &XmlPart, values: &[(&str, &str)]) -> String {
        let map: HashMap<String, String> = values
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let bytes = part
            .render(|name| map.get(name).cloned().unwrap_or_default())
            .unwrap();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_tag_in_single_run() {
        let (part, issues) =
            parse(r#"<w:body><w:p><w:r><w:t>Hello {{NAME}}!</w:t></w:r></w:p></w:body>"#);
        assert!(issues.is_empty());
        let part = part.unwrap();
        assert_eq!(part.tag_names().collect::<Vec<_>>(), vec!["NAME"]);

        let xml = render(&part, &[("NAME", "Ana")]);
        assert_eq!(
            xml,
            r#"<w:body><w:p><w:r><w:t xml:space="preserve">Hello Ana!</w:t></w:r></w:p></w:body>"#
        );
    }

    #[test]
    fn test_tag_split_across_runs() {
        let (part, issues) = parse(
            r#"<w:p><w:r><w:t>Total: {{AM</w:t></w:r><w:r><w:rPr><w:b/></w:rPr><w:t>OUNT}} EUR</w:t></w:r></w:p>"#,
        );
        assert!(issues.is_empty());
        let part = part.unwrap();
        assert_eq!(part.tag_names().collect::<Vec<_>>(), vec!["AMOUNT"]);

        let xml = render(&part, &[("AMOUNT", "10")]);
        assert_eq!(
            xml,
            r#"<w:p><w:r><w:t xml:space="preserve">Total: 10</w:t></w:r><w:r><w:rPr><w:b/></w:rPr><w:t xml:space="preserve"> EUR</w:t></w:r></w:p>"#
        );
    }

    #[test]
    fn test_value_is_escaped() {
        let (part, _) = parse(r#"<w:p><w:r><w:t>{{NAME}}</w:t></w:r></w:p>"#);
        let xml = render(&part.unwrap(), &[("NAME", "A & B <c>")]);
        assert!(xml.contains("A &amp; B &lt;c&gt;"));
    }

    #[test]
    fn test_newline_becomes_break() {
        let (part, _) = parse(r#"<w:p><w:r><w:t>{{ADDRESS}}</w:t></w:r></w:p>"#);
        let xml = render(&part.unwrap(), &[("ADDRESS", "Line 1\r\nLine 2")]);
        assert_eq!(
            xml,
            r#"<w:p><w:r><w:t xml:space="preserve">Line 1</w:t><w:br/><w:t xml:space="preserve">Line 2</w:t></w:r></w:p>"#
        );
    }

    #[test]
    fn test_untouched_paragraphs_are_preserved() {
        let source = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><w:document><w:p><w:r><w:t xml:space="preserve"> plain &amp; simple </w:t></w:r></w:p></w:document>"#;
        let (part, issues) = parse(source);
        assert!(issues.is_empty());
        assert_eq!(render(&part.unwrap(), &[]), source);
    }

    #[test]
    fn test_issues_are_tagged_with_part() {
        let (_, issues) = parse(r#"<w:p><w:r><w:t>{{NAME</w:t></w:r></w:p>"#);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].id, "unclosed_tag");
        assert_eq!(issues[0].part.as_deref(), Some("word/document.xml"));
    }

    #[test]
    fn test_tags_do_not_span_paragraphs() {
        let (_, issues) = parse(
            r#"<w:p><w:r><w:t>{{NA</w:t></w:r></w:p><w:p><w:r><w:t>ME}}</w:t></w:r></w:p>"#,
        );
        let ids: Vec<&str> = issues.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["unclosed_tag", "unopened_tag"]);
    }

    #[test]
    fn test_malformed_xml() {
        let (part, issues) = parse(r#"<w:p><w:r><w:t>text</w:r></w:p>"#);
        assert!(part.is_none());
        assert_eq!(issues[0].id, "malformed_xml");
    }
}
