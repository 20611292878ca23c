//! Public API Types
//!
//! 公開APIで使用する列挙型を定義するモジュール。

use std::fmt::Write;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// 日付の出力形式
///
/// スプレッドシートの日付セルを表示文字列に正規化する際の形式を指定します。
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DateFormat {
    /// 日/月/年（DD/MM/YYYY、デフォルト）
    ///
    /// 例: `05/03/2024`
    DayMonthYear,

    /// ISO 8601形式（YYYY-MM-DD）
    ///
    /// 例: `2024-03-05`
    Iso8601,

    /// カスタム形式（chrono互換フォーマット文字列）
    ///
    /// # 使用例
    ///
    /// ```rust,no_run
    /// use mergezero::{DateFormat, PipelineBuilder};
    ///
    /// # fn main() -> Result<(), mergezero::MergeZeroError> {
    /// let pipeline = PipelineBuilder::new()
    ///     .with_date_format(DateFormat::Custom("%Y年%m月%d日".to_string()))
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    Custom(String),
}

impl DateFormat {
    /// chrono互換のフォーマット文字列を取得
    pub(crate) fn pattern(&self) -> &str {
        match self {
            DateFormat::DayMonthYear => "%d/%m/%Y",
            DateFormat::Iso8601 => "%Y-%m-%d",
            DateFormat::Custom(format_str) => format_str,
        }
    }

    /// フォーマット文字列を検証する
    ///
    /// chronoが解釈できない指定子を含む場合や、出力が空になる場合はエラーです。
    pub(crate) fn validate(&self) -> Result<(), String> {
        let DateFormat::Custom(format_str) = self else {
            return Ok(());
        };

        let test_date = NaiveDate::from_ymd_opt(2025, 1, 1)
            .ok_or_else(|| "Failed to create test date".to_string())?;
        let mut formatted = String::new();
        if write!(formatted, "{}", test_date.format(format_str)).is_err() || formatted.is_empty() {
            return Err(format!("Invalid date format string: '{}'", format_str));
        }
        Ok(())
    }
}

impl Default for DateFormat {
    fn default() -> Self {
        DateFormat::DayMonthYear
    }
}

/// シート選択方式
///
/// データセットとして読み込むワークシートを指定します。
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SheetSelector {
    /// インデックス指定（0始まり、デフォルトは最初のシート）
    Index(usize),

    /// シート名指定
    ///
    /// 例: `SheetSelector::Name("Receipts".to_string())`
    Name(String),
}

impl Default for SheetSelector {
    fn default() -> Self {
        SheetSelector::Index(0)
    }
}

/// アーカイブの配信方式
///
/// どちらの方式でも、アーカイブの論理的な内容（エントリ構成）は同一です。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum DeliveryMode {
    /// ローカルストレージにアーカイブを書き出してから、ストレージにアップロードする
    Materialize,

    /// 圧縮しながらストレージへ直接ストリーミングする（デフォルト）
    ///
    /// ローカルディスクにアーカイブ全体を書き出さないため、大量のバッチに向いています。
    Stream,
}

impl Default for DeliveryMode {
    fn default() -> Self {
        DeliveryMode::Stream
    }
}

impl std::str::FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "materialize" | "local" => Ok(DeliveryMode::Materialize),
            "stream" | "streaming" => Ok(DeliveryMode::Stream),
            other => Err(format!("Unknown delivery mode: '{}'", other)),
        }
    }
}

/// ファイル名衝突時の処理方針
///
/// ファイル名パターンに行番号が含まれない場合、複数の行が同じ名前に解決されることがあります。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum CollisionPolicy {
    /// 衝突した名前に行番号を付加して一意にする（デフォルト）
    ///
    /// 例: `receipt.docx`が2行目で衝突した場合 → `receipt_2.docx`
    Rename,

    /// 衝突した行をエラーとして記録する
    ///
    /// 生成結果は失敗となり、アーカイブは作成されません。
    Reject,
}

impl Default for CollisionPolicy {
    fn default() -> Self {
        CollisionPolicy::Rename
    }
}

impl std::str::FromStr for CollisionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rename" => Ok(CollisionPolicy::Rename),
            "reject" => Ok(CollisionPolicy::Reject),
            other => Err(format!("Unknown collision policy: '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_format_patterns() {
        assert_eq!(DateFormat::default().pattern(), "%d/%m/%Y");
        assert_eq!(DateFormat::Iso8601.pattern(), "%Y-%m-%d");
        assert_eq!(DateFormat::Custom("%Y".to_string()).pattern(), "%Y");
    }

    #[test]
    fn test_date_format_validate() {
        assert!(DateFormat::DayMonthYear.validate().is_ok());
        assert!(DateFormat::Custom("%Y年%m月%d日".to_string()).validate().is_ok());

        let error = DateFormat::Custom("%Q".to_string()).validate().unwrap_err();
        assert!(error.contains("'%Q'"));
        assert!(DateFormat::Custom(String::new()).validate().is_err());
    }

    #[test]
    fn test_delivery_mode_from_str() {
        assert_eq!("stream".parse::<DeliveryMode>(), Ok(DeliveryMode::Stream));
        assert_eq!(
            " Materialize ".parse::<DeliveryMode>(),
            Ok(DeliveryMode::Materialize)
        );
        assert!("ftp".parse::<DeliveryMode>().is_err());
    }

    #[test]
    fn test_collision_policy_from_str() {
        assert_eq!("REJECT".parse::<CollisionPolicy>(), Ok(CollisionPolicy::Reject));
        assert_eq!(CollisionPolicy::default(), CollisionPolicy::Rename);
        assert!("overwrite".parse::<CollisionPolicy>().is_err());
    }

    #[test]
    fn test_delivery_mode_serialization() {
        assert_eq!(
            serde_json::to_string(&DeliveryMode::Materialize).unwrap(),
            "\"materialize\""
        );
    }
}
