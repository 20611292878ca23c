//! Workbook Parser
//!
//! calamineのワークブックをラップし、選択されたシートを`Dataset`に変換します。

use calamine::{open_workbook_auto_from_rs, Data, Range, Reader, Sheets, Xlsx};
use std::io::Cursor;

use tracing::debug;

use crate::api::{DateFormat, SheetSelector};
use crate::error::MergeZeroError;
use crate::formatter::CellFormatter;
use crate::security::SecurityConfig;
use crate::types::{Dataset, Row};

/// データセットパーサー
///
/// ヘッダー行は使用範囲の先頭行です。空のヘッダーセルは`Column<n>`（1始まりの列番号）
/// という名前になり、すべてのセルが空の行はスキップされます。
#[derive(Debug, Clone, Default)]
pub(crate) struct DatasetParser {
    /// シート選択方式
    sheet_selector: SheetSelector,
    /// セル値のフォーマッター
    formatter: CellFormatter,
    /// セキュリティ設定
    security: SecurityConfig,
}

impl DatasetParser {
    pub fn new(sheet_selector: SheetSelector, date_format: DateFormat) -> Self {
        Self {
            sheet_selector,
            formatter: CellFormatter::new(date_format),
            security: SecurityConfig::default(),
        }
    }

    /// XLSXのバイト列を解析してデータセットを生成
    ///
    /// # 戻り値
    ///
    /// * `Ok(Dataset)` - 解析に成功した場合（空のデータ行も許容）
    /// * `Err(MergeZeroError::Spreadsheet)` - ワークブックとして開けない場合
    /// * `Err(MergeZeroError::Dataset)` - シートが存在しない、またはヘッダーが重複している場合
    /// * `Err(MergeZeroError::Config)` - 日付のフォーマット文字列が不正な場合
    pub fn parse(&self, bytes: &[u8]) -> Result<Dataset, MergeZeroError> {
        self.formatter
            .date_format()
            .validate()
            .map_err(MergeZeroError::Config)?;

        // セキュリティチェック: 入力ファイルサイズの上限
        self.security.check_input_size(bytes.len())?;

        let mut workbook = Self::open_xlsx(bytes)?;
        let sheet_name = self.select_sheet(&workbook)?;

        let range = workbook
            .worksheet_range(&sheet_name)
            .map_err(|e| MergeZeroError::Spreadsheet(e.into()))?;

        let dataset = self.range_to_dataset(&range)?;
        debug!(
            sheet = %sheet_name,
            columns = dataset.headers.len(),
            rows = dataset.rows.len(),
            "parsed dataset"
        );
        Ok(dataset)
    }

    fn open_xlsx(bytes: &[u8]) -> Result<Xlsx<Cursor<&[u8]>>, MergeZeroError> {
        let sheets = open_workbook_auto_from_rs(Cursor::new(bytes))?;
        match sheets {
            Sheets::Xlsx(workbook) => Ok(workbook),
            _ => Err(MergeZeroError::Dataset(
                "Only XLSX format is supported".to_string(),
            )),
        }
    }

    /// シート選択方式に基づいてシート名を決定
    fn select_sheet<R>(&self, workbook: &Xlsx<R>) -> Result<String, MergeZeroError>
    where
        R: std::io::Read + std::io::Seek,
    {
        let sheet_names = workbook.sheet_names();

        if sheet_names.is_empty() {
            return Err(MergeZeroError::Dataset(
                "Excel file contains no worksheets".to_string(),
            ));
        }

        match &self.sheet_selector {
            SheetSelector::Index(index) => sheet_names.get(*index).cloned().ok_or_else(|| {
                MergeZeroError::Dataset(format!(
                    "Sheet index {} is out of range (total: {})",
                    index,
                    sheet_names.len()
                ))
            }),
            SheetSelector::Name(name) => {
                if !sheet_names.contains(name) {
                    return Err(MergeZeroError::Dataset(format!("Sheet '{}' not found", name)));
                }
                Ok(name.clone())
            }
        }
    }

    /// セル範囲をヘッダーとデータ行に変換
    fn range_to_dataset(&self, range: &Range<Data>) -> Result<Dataset, MergeZeroError> {
        let mut rows_iter = range.rows();

        let header_cells = match rows_iter.next() {
            Some(cells) => cells,
            None => return Ok(Dataset::default()),
        };

        // 使用範囲がA列から始まらない場合も、列番号はシート上の位置で数える
        let first_column = range.start().map_or(0, |(_, col)| col as usize);
        let headers = self.build_headers(header_cells, first_column);
        if headers.is_empty() {
            return Ok(Dataset::default());
        }

        let mut seen = std::collections::HashSet::new();
        for header in &headers {
            if !seen.insert(header.to_uppercase()) {
                return Err(MergeZeroError::Dataset(format!(
                    "Excel file has duplicate column names: {}",
                    header
                )));
            }
        }

        let mut rows = Vec::new();
        for cells in rows_iter {
            let mut row = Row::new();
            for (col_idx, header) in headers.iter().enumerate() {
                let value = cells
                    .get(col_idx)
                    .map(|cell| self.formatter.format_cell(cell))
                    .unwrap_or_default();
                row.insert(header.clone(), value);
            }

            // すべてのセルが空の行はスキップ
            if !row.is_blank() {
                rows.push(row);
            }
        }

        Ok(Dataset::new(headers, rows))
    }

    /// ヘッダー行から列名を生成
    ///
    /// 末尾の空セルは列として扱いません。`first_column`は先頭セルの列位置（0始まり）です。
    fn build_headers(&self, cells: &[Data], first_column: usize) -> Vec<String> {
        let texts: Vec<String> = cells
            .iter()
            .map(|cell| self.formatter.format_cell(cell).trim().to_string())
            .collect();

        let width = texts
            .iter()
            .rposition(|text| !text.is_empty())
            .map_or(0, |pos| pos + 1);

        texts
            .into_iter()
            .take(width)
            .enumerate()
            .map(|(idx, text)| {
                if text.is_empty() {
                    format!("Column{}", first_column + idx + 1)
                } else {
                    text
                }
            })
            .collect()
    }
}
