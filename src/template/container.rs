//! Container Module
//!
//! DOCX（ZIPコンテナ）の読み込みと書き出しを行うモジュール。
//! 読み込み時にZIP bomb攻撃とパストラバーサル攻撃への対策を適用します。

use std::io::{Cursor, Read, Write};

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{MergeZeroError, TemplateError, TemplateIssue};
use crate::security::{validate_zip_path, SecurityConfig};

/// コンテナ内の1エントリ
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    /// エントリ名（例: `word/document.xml`）
    pub name: String,
    /// 展開後のバイト列（ディレクトリの場合は`None`）
    pub data: Option<Vec<u8>>,
}

/// ZIPコンテナを読み込み、すべてのエントリを展開する
///
/// # 戻り値
///
/// * `Ok(Vec<Entry>)` - コンテナ内の順序を保持したエントリ
/// * `Err(MergeZeroError::Template)` - ZIPコンテナとして開けない場合（`invalid_container`）
/// * `Err(MergeZeroError::SecurityViolation)` - セキュリティ制限に違反した場合
pub(crate) fn read_entries(
    bytes: &[u8],
    security: &SecurityConfig,
) -> Result<Vec<Entry>, MergeZeroError> {
    security.check_input_size(bytes.len())?;

    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(|e| {
        TemplateError::single(
            TemplateIssue::new("invalid_container", "Template is not a valid document")
                .with_explanation(e.to_string()),
        )
    })?;

    // セキュリティチェック: ファイル数の上限
    if archive.len() > security.max_file_count {
        return Err(MergeZeroError::SecurityViolation(format!(
            "ZIP archive contains too many files: {} (max: {})",
            archive.len(),
            security.max_file_count
        )));
    }

    let mut entries = Vec::with_capacity(archive.len());
    let mut total_size = 0u64;

    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        let name = file.name().to_string();

        // セキュリティチェック: パストラバーサル
        validate_zip_path(&name).map_err(MergeZeroError::SecurityViolation)?;

        if file.is_dir() {
            entries.push(Entry { name, data: None });
            continue;
        }

        total_size = security.accumulate_entry(&name, file.size(), total_size)?;

        // ヘッダーのサイズ情報が偽装されている場合に備えて、読み込み量を制限する
        let mut data = Vec::with_capacity(file.size() as usize);
        file.by_ref()
            .take(security.max_file_size + 1)
            .read_to_end(&mut data)?;
        if data.len() as u64 > security.max_file_size {
            return Err(MergeZeroError::SecurityViolation(format!(
                "File '{}' exceeds maximum size (max: {} bytes)",
                name, security.max_file_size
            )));
        }

        entries.push(Entry {
            name,
            data: Some(data),
        });
    }

    Ok(entries)
}

/// エントリをZIPコンテナとして書き出す
///
/// 圧縮方式はDeflate（最大圧縮）、タイムスタンプは固定値です。
/// 同じエントリからは常に同じバイト列が生成されます。
pub(crate) fn write_entries<'a, I>(entries: I) -> Result<Vec<u8>, zip::result::ZipError>
where
    I: IntoIterator<Item = (&'a str, Option<&'a [u8]>)>,
{
    let options = deterministic_options(9);
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));

    for (name, data) in entries {
        match data {
            Some(data) => {
                writer.start_file(name, options)?;
                writer.write_all(data)?;
            }
            None => writer.add_directory(name, options)?,
        }
    }

    Ok(writer.finish()?.into_inner())
}

/// 再現性のあるZIPエントリ設定（Deflate、固定タイムスタンプ）
pub(crate) fn deterministic_options(level: i64) -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(level))
        .last_modified_time(zip::DateTime::default())
}
