//! Parser Module
//!
//! calamineを使用したExcelファイル解析。
//! 1枚のシートを読み込み、ヘッダー行と表示文字列化されたデータ行に変換します。

mod workbook;

pub(crate) use workbook::DatasetParser;

use crate::api::{DateFormat, SheetSelector};
use crate::error::MergeZeroError;
use crate::types::Dataset;

/// XLSXのバイト列をデータセットに変換する
///
/// 解析のみを行い、`Dataset::check`による検証は行いません。
///
/// # 使用例
///
/// ```rust,no_run
/// use mergezero::{parse_dataset, DateFormat, SheetSelector};
///
/// # fn main() -> Result<(), mergezero::MergeZeroError> {
/// let bytes = std::fs::read("data.xlsx")?;
/// let dataset = parse_dataset(&bytes, SheetSelector::Index(0), DateFormat::DayMonthYear)?;
/// println!("{} rows", dataset.row_count());
/// # Ok(())
/// # }
/// ```
pub fn parse_dataset(
    bytes: &[u8],
    sheet_selector: SheetSelector,
    date_format: DateFormat,
) -> Result<Dataset, MergeZeroError> {
    DatasetParser::new(sheet_selector, date_format).parse(bytes)
}
