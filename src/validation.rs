//! Validation Module
//!
//! テンプレートのプレースホルダーとデータセットの列名を照合するモジュール。

use std::collections::HashSet;

use crate::template::is_valid_placeholder_name;
use crate::types::ValidationResult;

/// プレースホルダーと列名を照合する
///
/// 両方を大文字化してから比較します（大文字小文字を区別しない）。
/// 余分な列は許容され、対応する列がないプレースホルダーがある場合のみ`valid`が`false`になります。
///
/// # 使用例
///
/// ```rust
/// use mergezero::validate_template;
///
/// let result = validate_template(
///     &["PHONE".to_string()],
///     &["Name".to_string()],
/// );
/// assert!(!result.valid);
/// assert_eq!(result.missing_in_excel, vec!["PHONE"]);
/// assert_eq!(result.extra_in_excel, vec!["NAME"]);
/// ```
pub fn validate_template(placeholders: &[String], headers: &[String]) -> ValidationResult {
    let template_set = upper_unique(placeholders);
    let excel_set = upper_unique(headers);

    let template_lookup: HashSet<&str> = template_set.iter().map(String::as_str).collect();
    let excel_lookup: HashSet<&str> = excel_set.iter().map(String::as_str).collect();

    let missing_in_excel: Vec<String> = template_set
        .iter()
        .filter(|p| !excel_lookup.contains(p.as_str()))
        .cloned()
        .collect();

    let extra_in_excel: Vec<String> = excel_set
        .iter()
        .filter(|h| !template_lookup.contains(h.as_str()))
        .cloned()
        .collect();

    let mut warnings = Vec::new();

    if !missing_in_excel.is_empty() {
        warnings.push(format!(
            "Template contains placeholders not found in Excel: {}",
            missing_in_excel.join(", ")
        ));
    }

    if !extra_in_excel.is_empty() {
        warnings.push(format!(
            "Excel contains columns not used in template: {}",
            extra_in_excel.join(", ")
        ));
    }

    let irregular: Vec<&str> = template_set
        .iter()
        .map(String::as_str)
        .filter(|p| !is_valid_placeholder_name(p))
        .collect();
    if !irregular.is_empty() {
        warnings.push(format!(
            "Placeholders should contain only letters, digits and underscores: {}",
            irregular.join(", ")
        ));
    }

    ValidationResult {
        valid: missing_in_excel.is_empty(),
        missing_in_excel,
        extra_in_excel,
        warnings,
    }
}

/// 大文字化して重複を除く（初出順）
fn upper_unique(values: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .iter()
        .map(|v| v.to_uppercase())
        .filter(|v| seen.insert(v.clone()))
        .collect()
}
