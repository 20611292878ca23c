//! Naming Module
//!
//! 生成される文書のファイル名を決定するモジュール。
//! ファイル名パターンの展開、ファイル名のサニタイズ、行間のファイル名衝突の解消を提供します。

use std::collections::HashSet;

use crate::api::CollisionPolicy;
use crate::types::Row;

/// ファイル名をサニタイズする
///
/// `[A-Za-z0-9._-]`以外のすべての文字を`_`に置換します。
/// パス区切り文字や、ファイルシステムで使用できない文字が取り除かれます。
///
/// # 使用例
///
/// ```rust
/// use mergezero::sanitize_filename;
///
/// assert_eq!(sanitize_filename("a/b\\c:d"), "a_b_c_d");
/// assert_eq!(sanitize_filename("José Núñez"), "Jos__N__ez");
/// ```
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// 行のファイル名を決定する
///
/// # 引数
///
/// * `row_index` - 1始まりの行番号
/// * `row` - 行データ
/// * `pattern` - ファイル名パターン（例: `{{Name}}_{Amount}.docx`）。`None`の場合はデフォルトの命名規則
/// * `default_ext` - 拡張子がない場合に付加する拡張子（ドットなし）
///
/// # 命名規則
///
/// - パターンあり: 行のすべてのキーについて`{{KEY}}`と`{KEY}`を（大文字小文字を区別せず）
///   サニタイズ済みの値で置換し、続いて`{index}`を行番号で置換します。
///   結果が空の場合は`document_<行番号>`になります。
/// - パターンなし: `receipt_<行番号>_<name列の値>.<拡張子>`（name列が空の場合は`row<行番号>`）
pub fn resolve_file_name(
    row_index: usize,
    row: &Row,
    pattern: Option<&str>,
    default_ext: &str,
) -> String {
    match pattern {
        Some(pattern) => {
            let name = expand_pattern(row_index, row, pattern);
            // 値に含まれるドットは拡張子とみなさない
            if has_literal_extension(pattern) || ends_with_extension(&name, default_ext) {
                name
            } else {
                format!("{}.{}", name, default_ext)
            }
        }
        None => {
            let name_field = row
                .get_ignore_case("name")
                .filter(|v| !v.trim().is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("row{}", row_index));
            format!(
                "receipt_{}_{}.{}",
                row_index,
                sanitize_filename(&name_field),
                default_ext
            )
        }
    }
}

fn expand_pattern(row_index: usize, row: &Row, pattern: &str) -> String {
    let mut name = pattern.to_string();

    for (key, value) in row.iter() {
        if key.is_empty() {
            continue;
        }
        let value = sanitize_filename(value);
        name = replace_ignore_case(&name, &format!("{{{{{}}}}}", key), &value);
        name = replace_ignore_case(&name, &format!("{{{}}}", key), &value);
    }
    name = replace_ignore_case(&name, "{index}", &row_index.to_string());

    let trimmed = name.trim();
    if trimmed.is_empty() {
        return format!("document_{}", row_index);
    }

    let sanitized = sanitize_filename(trimmed);
    if sanitized.chars().all(|c| c == '.') {
        return format!("document_{}", row_index);
    }
    sanitized
}

/// パターン自体が拡張子で終わるか判定
///
/// 最後のドット以降が英数字のみ（プレースホルダーを含まない）の場合に拡張子とみなします。
/// 先頭・末尾のドットは拡張子とみなしません。
fn has_literal_extension(pattern: &str) -> bool {
    match pattern.trim().rfind('.') {
        Some(pos) if pos > 0 => {
            let ext = &pattern.trim()[pos + 1..];
            !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric())
        }
        _ => false,
    }
}

/// 名前が指定の拡張子で終わるか判定（大文字小文字を区別しない）
fn ends_with_extension(name: &str, ext: &str) -> bool {
    let suffix = format!(".{}", ext.to_ascii_lowercase());
    name.len() > suffix.len() && name.to_ascii_lowercase().ends_with(&suffix)
}

/// 大文字小文字を区別せずにすべての出現箇所を置換する
fn replace_ignore_case(haystack: &str, needle: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(haystack.len());
    let mut rest = haystack;

    while let Some((start, end)) = find_ignore_case(rest, needle) {
        out.push_str(&rest[..start]);
        out.push_str(replacement);
        rest = &rest[end..];
    }
    out.push_str(rest);
    out
}

fn find_ignore_case(haystack: &str, needle: &str) -> Option<(usize, usize)> {
    if needle.is_empty() {
        return None;
    }

    'outer: for (start, _) in haystack.char_indices() {
        let mut end = start;
        let mut chars = haystack[start..].chars();
        for expected in needle.chars() {
            match chars.next() {
                Some(c) if chars_eq_ignore_case(c, expected) => end += c.len_utf8(),
                _ => continue 'outer,
            }
        }
        return Some((start, end));
    }
    None
}

fn chars_eq_ignore_case(a: char, b: char) -> bool {
    a == b || a.to_lowercase().eq(b.to_lowercase())
}

/// 生成結果内でのファイル名の一意性を保証するレジストリ
///
/// ファイル名は大文字小文字を区別せずに比較します。
#[derive(Debug)]
pub(crate) struct NameRegistry {
    policy: CollisionPolicy,
    taken: HashSet<String>,
}

impl NameRegistry {
    pub fn new(policy: CollisionPolicy) -> Self {
        Self {
            policy,
            taken: HashSet::new(),
        }
    }

    /// ファイル名を登録する
    ///
    /// # 戻り値
    ///
    /// * `Ok(String)` - 一意なファイル名（`Rename`の場合は`<stem>_<行番号>.<ext>`に変更されることがある）
    /// * `Err(String)` - `Reject`で衝突した場合の`Row <n>: ...`形式のエラー
    pub fn claim(&mut self, row_index: usize, name: String) -> Result<String, String> {
        if self.taken.insert(name.to_lowercase()) {
            return Ok(name);
        }

        match self.policy {
            CollisionPolicy::Reject => Err(format!(
                "Row {}: File name '{}' is already used by another row",
                row_index, name
            )),
            CollisionPolicy::Rename => {
                let (stem, ext) = split_extension(&name);
                let mut candidate = format!("{}_{}{}", stem, row_index, ext);
                let mut counter = 2;
                while !self.taken.insert(candidate.to_lowercase()) {
                    candidate = format!("{}_{}_{}{}", stem, row_index, counter, ext);
                    counter += 1;
                }
                Ok(candidate)
            }
        }
    }
}

/// ファイル名を（stem, `.ext`）に分割する
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => name.split_at(pos),
        _ => (name, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a/b\\c:d"), "a_b_c_d");
        assert_eq!(sanitize_filename("ok-name_1.docx"), "ok-name_1.docx");
        assert_eq!(sanitize_filename("../../etc"), ".._.._etc");
        assert_eq!(sanitize_filename("名前"), "__");
    }

    #[test]
    fn test_default_naming() {
        let row = Row::from_pairs([("Name", "Ana"), ("Amount", "10")]);
        assert_eq!(resolve_file_name(1, &row, None, "docx"), "receipt_1_Ana.docx");

        let row = Row::from_pairs([("NAME", "Ana Maria")]);
        assert_eq!(resolve_file_name(2, &row, None, "docx"), "receipt_2_Ana_Maria.docx");
    }

    #[test]
    fn test_default_naming_without_name_field() {
        let row = Row::from_pairs([("Amount", "10")]);
        assert_eq!(resolve_file_name(3, &row, None, "docx"), "receipt_3_row3.docx");

        let row = Row::from_pairs([("name", "  ")]);
        assert_eq!(resolve_file_name(4, &row, None, "docx"), "receipt_4_row4.docx");
    }

    #[test]
    fn test_pattern_substitution() {
        let row = Row::from_pairs([("Name", "Ana"), ("Invoice", "A/17")]);
        assert_eq!(
            resolve_file_name(1, &row, Some("{{name}}-{INVOICE}.docx"), "docx"),
            "Ana-A_17.docx"
        );
    }

    #[test]
    fn test_pattern_replaces_every_occurrence() {
        let row = Row::from_pairs([("Name", "Ana")]);
        assert_eq!(
            resolve_file_name(1, &row, Some("{Name}_{name}"), "docx"),
            "Ana_Ana.docx"
        );
    }

    #[test]
    fn test_pattern_index_token() {
        let row = Row::from_pairs([("Name", "Ana")]);
        assert_eq!(
            resolve_file_name(7, &row, Some("{index}-{Name}"), "pdf"),
            "7-Ana.pdf"
        );
    }

    #[test]
    fn test_pattern_empty_falls_back() {
        let row = Row::from_pairs([("Name", "")]);
        assert_eq!(resolve_file_name(5, &row, Some("{Name}"), "docx"), "document_5.docx");
        assert_eq!(resolve_file_name(5, &row, Some("   "), "docx"), "document_5.docx");
        assert_eq!(resolve_file_name(5, &row, Some(".."), "docx"), "document_5.docx");
    }

    #[test]
    fn test_pattern_output_is_sanitized() {
        let row = Row::from_pairs([("Name", "Ana")]);
        assert_eq!(
            resolve_file_name(1, &row, Some("../{Name} {unknown}.docx"), "docx"),
            ".._Ana__unknown_.docx"
        );
    }

    #[test]
    fn test_has_literal_extension() {
        assert!(has_literal_extension("{Name}.docx"));
        assert!(has_literal_extension("receipt-{index}.PDF"));
        assert!(!has_literal_extension("{Name}"));
        assert!(!has_literal_extension("{Name}.{Ext}"));
        assert!(!has_literal_extension(".hidden"));
        assert!(!has_literal_extension("trailing."));
    }

    #[test]
    fn test_value_dots_are_not_extensions() {
        let row = Row::from_pairs([("Name", "J. Smith")]);
        assert_eq!(resolve_file_name(1, &row, Some("{Name}"), "docx"), "J._Smith.docx");

        let row = Row::from_pairs([("File", "report.docx")]);
        assert_eq!(resolve_file_name(1, &row, Some("{File}"), "docx"), "report.docx");
    }

    #[test]
    fn test_registry_rename() {
        let mut registry = NameRegistry::new(CollisionPolicy::Rename);
        assert_eq!(registry.claim(1, "Ana.docx".to_string()).unwrap(), "Ana.docx");
        assert_eq!(registry.claim(2, "ana.docx".to_string()).unwrap(), "ana_2.docx");
        assert_eq!(registry.claim(3, "Ana.docx".to_string()).unwrap(), "Ana_3.docx");
    }

    #[test]
    fn test_registry_rename_avoids_existing_suffix() {
        let mut registry = NameRegistry::new(CollisionPolicy::Rename);
        registry.claim(1, "x_2.docx".to_string()).unwrap();
        registry.claim(1, "x.docx".to_string()).unwrap();
        assert_eq!(registry.claim(2, "x.docx".to_string()).unwrap(), "x_2_2.docx");
    }

    #[test]
    fn test_registry_reject() {
        let mut registry = NameRegistry::new(CollisionPolicy::Reject);
        registry.claim(1, "Ana.docx".to_string()).unwrap();
        let err = registry.claim(2, "Ana.docx".to_string()).unwrap_err();
        assert!(err.starts_with("Row 2:"));
    }
}
