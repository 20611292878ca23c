//! Formatter Module
//!
//! セル値を表示文字列に正規化するモジュール。
//! 日付は設定された形式（デフォルト: DD/MM/YYYY）、数式セルはキャッシュされた計算結果、
//! リッチテキストはプレーンテキストとして出力します。

use std::fmt::Write;

use calamine::Data;
use chrono::{NaiveDate, NaiveDateTime};

use crate::api::DateFormat;

/// セルフォーマッター
///
/// calamineのセル値を、テンプレートに差し込む表示文字列に変換します。
#[derive(Debug, Clone, Default)]
pub(crate) struct CellFormatter {
    /// 日付の出力形式
    date_format: DateFormat,
}

impl CellFormatter {
    /// 新しいCellFormatterインスタンスを生成
    pub fn new(date_format: DateFormat) -> Self {
        Self { date_format }
    }

    pub fn date_format(&self) -> &DateFormat {
        &self.date_format
    }

    /// セル値をフォーマット
    ///
    /// # 引数
    ///
    /// * `cell` - calamineのセルデータ（数式セルの場合はキャッシュされた結果）
    ///
    /// # 戻り値
    ///
    /// 表示文字列（空セルは空文字列）
    pub fn format_cell(&self, cell: &Data) -> String {
        match cell {
            Data::Empty => String::new(),
            Data::String(s) => s.clone(),
            Data::Int(i) => i.to_string(),
            Data::Float(f) => self.format_number(*f),
            Data::Bool(b) => b.to_string(),
            // エラー値（#DIV/0!など）は差し込まない
            Data::Error(_) => String::new(),
            Data::DateTime(dt) => match dt.as_datetime() {
                Some(datetime) if dt.is_datetime() => self.format_date(datetime.date()),
                // 期間（duration）書式の場合はシリアル値をそのまま出力
                _ => self.format_number(dt.as_f64()),
            },
            Data::DateTimeIso(s) => self.format_iso_date(s),
            Data::DurationIso(s) => s.clone(),
        }
    }

    /// 数値をフォーマット
    ///
    /// 整数値の浮動小数点は小数点なしで出力します（例: `10.0` → `10`）。
    fn format_number(&self, value: f64) -> String {
        if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
            format!("{}", value as i64)
        } else {
            value.to_string()
        }
    }

    /// 日付をフォーマット
    ///
    /// 解釈できないフォーマット文字列の場合は空文字列を返します。
    fn format_date(&self, date: NaiveDate) -> String {
        let mut formatted = String::new();
        match write!(formatted, "{}", date.format(self.date_format.pattern())) {
            Ok(()) => formatted,
            Err(_) => String::new(),
        }
    }

    /// ISO 8601文字列の日付をフォーマット
    ///
    /// 解析できない場合は元の文字列をそのまま返します。
    fn format_iso_date(&self, s: &str) -> String {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
            return self.format_date(datetime.date());
        }
        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return self.format_date(date);
        }
        s.to_string()
    }
}
