//! Types Module
//!
//! クレート全体で使用する共通データ型を定義するモジュール。

use serde::{Deserialize, Serialize};

/// データセットの1行
///
/// 列名 → 表示文字列のマッピングです。列の順序はヘッダーの順序を保持します。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    cells: Vec<(String, String)>,
}

impl Row {
    /// 空の行を生成
    pub fn new() -> Self {
        Self::default()
    }

    /// (列名, 値) のペアから行を生成
    ///
    /// # 使用例
    ///
    /// ```rust
    /// use mergezero::Row;
    ///
    /// let row = Row::from_pairs([("Name", "Ana"), ("Amount", "10")]);
    /// assert_eq!(row.get("Name"), Some("Ana"));
    /// ```
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut row = Self::new();
        for (key, value) in pairs {
            row.insert(key, value);
        }
        row
    }

    /// 値を設定する（同名の列が存在する場合は上書き）
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.cells.iter_mut().find(|(k, _)| *k == key) {
            Some(cell) => cell.1 = value,
            None => self.cells.push((key, value)),
        }
    }

    /// 列名で値を取得（大文字小文字を区別）
    pub fn get(&self, key: &str) -> Option<&str> {
        self.cells
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// 列名で値を取得（大文字小文字を区別しない）
    pub fn get_ignore_case(&self, key: &str) -> Option<&str> {
        let key = key.to_uppercase();
        self.cells
            .iter()
            .find(|(k, _)| k.to_uppercase() == key)
            .map(|(_, v)| v.as_str())
    }

    /// (列名, 値) を列の順序で走査する
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cells.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// すべてのセルが空文字列かどうかを判定
    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(|(_, v)| v.is_empty())
    }
}

/// 解析済みの表形式データセット
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    /// 列名（順序付き、重複なし）
    pub headers: Vec<String>,
    /// データ行（少なくとも1つのセルが空でない行のみ）
    pub rows: Vec<Row>,
}

impl Dataset {
    pub fn new(headers: Vec<String>, rows: Vec<Row>) -> Self {
        Self { headers, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// アップロード時のデータセット検証
    ///
    /// # 戻り値
    ///
    /// * `Ok(())` - 列とデータ行が存在し、列名が重複していない場合
    /// * `Err(String)` - 検証に失敗した理由
    pub fn check(&self) -> Result<(), String> {
        if self.headers.is_empty() {
            return Err("Excel file has no columns".to_string());
        }

        if self.rows.is_empty() {
            return Err("Excel file has no data rows".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for header in &self.headers {
            if !seen.insert(header.to_uppercase()) {
                return Err(format!(
                    "Excel file has duplicate column names: {}",
                    header
                ));
            }
        }

        Ok(())
    }
}

/// テンプレートとデータセットの照合結果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    /// すべての必須プレースホルダーに対応する列が存在する場合`true`
    pub valid: bool,
    /// 対応する列がないプレースホルダー（大文字）
    pub missing_in_excel: Vec<String>,
    /// テンプレートで使われていない列（大文字）
    pub extra_in_excel: Vec<String>,
    /// 人間向けの警告メッセージ
    pub warnings: Vec<String>,
}

/// 生成された成果物（ファイル名とバイト列）
#[derive(Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub content: Vec<u8>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            content,
        }
    }

    /// 拡張子を除いたファイル名
    pub fn stem(&self) -> &str {
        match self.name.rfind('.') {
            Some(pos) if pos > 0 => &self.name[..pos],
            _ => &self.name,
        }
    }
}

impl std::fmt::Debug for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Artifact")
            .field("name", &self.name)
            .field("size", &self.content.len())
            .finish()
    }
}

/// バッチ生成の結果
///
/// `errors`が空の場合に限り`success`が`true`になります。
#[derive(Debug, Clone, Default)]
pub struct GenerationResult {
    pub success: bool,
    pub artifacts: Vec<Artifact>,
    pub errors: Vec<String>,
}

impl GenerationResult {
    pub(crate) fn from_parts(artifacts: Vec<Artifact>, errors: Vec<String>) -> Self {
        Self {
            success: errors.is_empty(),
            artifacts,
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_preserves_column_order() {
        let row = Row::from_pairs([("B", "2"), ("A", "1")]);
        let keys: Vec<&str> = row.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["B", "A"]);
    }

    #[test]
    fn test_row_insert_overwrites() {
        let mut row = Row::new();
        row.insert("Name", "Ana");
        row.insert("Name", "Bob");
        assert_eq!(row.len(), 1);
        assert_eq!(row.get("Name"), Some("Bob"));
    }

    #[test]
    fn test_row_get_ignore_case() {
        let row = Row::from_pairs([("Name", "Ana")]);
        assert_eq!(row.get("NAME"), None);
        assert_eq!(row.get_ignore_case("NAME"), Some("Ana"));
        assert_eq!(row.get_ignore_case("name"), Some("Ana"));
    }

    #[test]
    fn test_row_is_blank() {
        assert!(Row::from_pairs([("A", ""), ("B", "")]).is_blank());
        assert!(!Row::from_pairs([("A", ""), ("B", "x")]).is_blank());
    }

    #[test]
    fn test_dataset_check() {
        let ok = Dataset::new(
            vec!["Name".to_string()],
            vec![Row::from_pairs([("Name", "Ana")])],
        );
        assert!(ok.check().is_ok());

        let no_columns = Dataset::new(vec![], vec![]);
        assert_eq!(no_columns.check().unwrap_err(), "Excel file has no columns");

        let no_rows = Dataset::new(vec!["Name".to_string()], vec![]);
        assert_eq!(no_rows.check().unwrap_err(), "Excel file has no data rows");

        let duplicate = Dataset::new(
            vec!["Name".to_string(), "NAME".to_string()],
            vec![Row::from_pairs([("Name", "Ana")])],
        );
        assert!(duplicate.check().unwrap_err().contains("duplicate"));
    }

    #[test]
    fn test_artifact_stem() {
        assert_eq!(Artifact::new("receipt_1_Ana.docx", vec![]).stem(), "receipt_1_Ana");
        assert_eq!(Artifact::new("archive.tar.gz", vec![]).stem(), "archive.tar");
        assert_eq!(Artifact::new("noext", vec![]).stem(), "noext");
        assert_eq!(Artifact::new(".hidden", vec![]).stem(), ".hidden");
    }

    #[test]
    fn test_validation_result_serializes_camel_case() {
        let result = ValidationResult {
            valid: false,
            missing_in_excel: vec!["PHONE".to_string()],
            ..Default::default()
        };
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"missingInExcel\":[\"PHONE\"]"));
        assert!(json.contains("\"extraInExcel\":[]"));
    }
}
