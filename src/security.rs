//! Security Module
//!
//! セキュリティ対策を実装するモジュール。
//! テンプレート（ZIPコンテナ）のZIP bomb攻撃、パストラバーサル攻撃、
//! ストレージキーの不正なパス指定などへの対策を提供します。

use crate::error::MergeZeroError;

/// セキュリティ設定
///
/// ファイル処理時のセキュリティ制限を定義します。
#[derive(Debug, Clone)]
pub(crate) struct SecurityConfig {
    /// 展開後の最大サイズ（バイト）
    /// デフォルト: 512MB
    pub max_decompressed_size: u64,
    /// ZIPアーカイブ内の最大ファイル数
    /// デフォルト: 10000
    pub max_file_count: usize,
    /// 単一ファイルの最大サイズ（バイト）
    /// デフォルト: 100MB (104_857_600 bytes)
    pub max_file_size: u64,
    /// 入力ファイルの最大サイズ（バイト）
    /// デフォルト: 256MB
    pub max_input_file_size: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_decompressed_size: 536_870_912, // 512MB
            max_file_count: 10_000,
            max_file_size: 104_857_600,       // 100MB
            max_input_file_size: 268_435_456, // 256MB
        }
    }
}

impl SecurityConfig {
    /// 入力サイズの上限チェック
    pub fn check_input_size(&self, len: usize) -> Result<(), MergeZeroError> {
        if len as u64 > self.max_input_file_size {
            return Err(MergeZeroError::SecurityViolation(format!(
                "Input file size exceeds maximum: {} bytes (max: {} bytes)",
                len, self.max_input_file_size
            )));
        }
        Ok(())
    }

    /// ZIPエントリの展開サイズを累計してチェック
    ///
    /// # 戻り値
    ///
    /// * `Ok(u64)` - 加算後の累計サイズ
    /// * `Err(MergeZeroError::SecurityViolation)` - 上限を超えた場合
    pub fn accumulate_entry(
        &self,
        name: &str,
        size: u64,
        total: u64,
    ) -> Result<u64, MergeZeroError> {
        if size > self.max_file_size {
            return Err(MergeZeroError::SecurityViolation(format!(
                "File '{}' exceeds maximum size: {} bytes (max: {} bytes)",
                name, size, self.max_file_size
            )));
        }

        let total = total.checked_add(size).ok_or_else(|| {
            MergeZeroError::SecurityViolation(
                "Total decompressed size calculation overflow".to_string(),
            )
        })?;

        if total > self.max_decompressed_size {
            return Err(MergeZeroError::SecurityViolation(format!(
                "Total decompressed size exceeds maximum: {} bytes (max: {} bytes)",
                total, self.max_decompressed_size
            )));
        }

        Ok(total)
    }
}

/// ファイルパスの検証
///
/// パストラバーサル攻撃を防ぐため、ZIPエントリのパスを検証します。
///
/// # 引数
///
/// * `path` - 検証するファイルパス
///
/// # 戻り値
///
/// * `Ok(())` - パスが安全な場合
/// * `Err(String)` - パスが危険な場合（`..`や絶対パスを含む）
pub(crate) fn validate_zip_path(path: &str) -> Result<(), String> {
    // 空のパスは拒否
    if path.is_empty() {
        return Err("Empty path is not allowed".to_string());
    }

    // 絶対パスを拒否（Windows形式の`C:\`やUnix形式の`/`で始まるパス）
    if path.starts_with('/') || path.starts_with("C:\\") || path.starts_with("c:\\") {
        return Err(format!("Absolute path is not allowed: {}", path));
    }

    // `..`を含むパスを拒否（ディレクトリトラバーサル攻撃）
    if path.split('/').any(|segment| segment == "..") {
        return Err(format!("Path traversal detected: {}", path));
    }

    // `\`を含むパスを拒否（Windows形式のパスセパレータ）
    if path.contains('\\') {
        return Err(format!("Backslash in path is not allowed: {}", path));
    }

    Ok(())
}

/// ストレージキーの検証
///
/// キーはローカルストアではファイルパスとして使用されるため、ZIPパスと同じ規則で検証します。
pub(crate) fn validate_storage_key(key: &str) -> Result<(), MergeZeroError> {
    validate_zip_path(key)
        .map_err(|e| MergeZeroError::SecurityViolation(format!("Invalid storage key: {}", e)))?;

    if key.ends_with('/') {
        return Err(MergeZeroError::SecurityViolation(format!(
            "Invalid storage key: {} refers to a directory",
            key
        )));
    }

    Ok(())
}
