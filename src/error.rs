//! Error Types Module
//!
//! クレート全体で使用する構造化エラー型を定義するモジュール。
//! `thiserror`を使用して、エラーの自動変換とメッセージフォーマットを実現する。

use std::fmt;

use thiserror::Error;

/// mergezeroクレート全体で使用するエラー型
///
/// テンプレートの解析、行のレンダリング、形式変換、アーカイブ作成、
/// ストレージ操作で発生するすべてのエラーを統一的に扱うために使用されます。
///
/// # エラーの種類
///
/// - `Template`: テンプレートが開けない、またはプレースホルダー構文が不正（リクエスト全体を中断）
/// - `Render`: 特定の行のデータをテンプレートに差し込めなかった（その行のみ）
/// - `Conversion`: 1つの（成果物, 形式）ペアの変換失敗（バッチは継続）
/// - `Packaging`: アーカイブの確定またはアップロードの失敗（リクエスト全体で致命的）
///
/// # 使用例
///
/// ```rust,no_run
/// use mergezero::MergeZeroError;
///
/// fn read_template(path: &str) -> Result<Vec<u8>, MergeZeroError> {
///     let bytes = std::fs::read(path)?; // Ioエラーが自動的に変換される
///     Ok(bytes)
/// }
/// ```
#[derive(Error, Debug)]
pub enum MergeZeroError {
    /// I/O操作中に発生したエラー
    ///
    /// `#[from]`属性により、`std::io::Error`から自動的に変換されます。
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// スプレッドシートの解析中に発生したエラー（calamine由来）
    #[error("Failed to parse spreadsheet: {0}")]
    Spreadsheet(#[from] calamine::Error),

    /// テンプレートの解析エラー
    ///
    /// コンテナとして開けない、またはプレースホルダーの区切りが不正な場合に発生します。
    /// 検出されたすべての問題を含みます。
    #[error("{0}")]
    Template(#[from] TemplateError),

    /// 行のレンダリングエラー
    ///
    /// `row`は1始まりの行番号です。
    #[error("Row {row}: {source}")]
    Render {
        /// 1始まりの行番号
        row: usize,
        /// 集約されたテンプレートエラー
        #[source]
        source: TemplateError,
    },

    /// データセットの内容が不正
    ///
    /// 列がない、データ行がない、列名が重複している場合などに発生します。
    #[error("Invalid dataset: {0}")]
    Dataset(String),

    /// 形式変換の失敗
    #[error("Conversion to '{format}' failed: {message}")]
    Conversion {
        /// 変換先の拡張子（ドットなし）
        format: String,
        /// 詳細メッセージ
        message: String,
    },

    /// アーカイブの作成またはアップロードの失敗
    #[error("Packaging failed: {0}")]
    Packaging(String),

    /// オブジェクトストレージの操作失敗
    #[error("Storage error: {0}")]
    Storage(String),

    /// セッションに必要なファイルが登録されていない
    #[error("Session '{session_id}' has no {kind} file")]
    SessionNotFound {
        /// セッションID
        session_id: String,
        /// ファイル種別（template / dataset）
        kind: String,
    },

    /// 1行以上の生成に失敗した
    ///
    /// 部分的なアーカイブは配信しないため、生成全体を失敗として扱います。
    #[error("Some documents failed to generate ({} errors)", .errors.len())]
    RowsFailed {
        /// `Row <n>: ...` 形式のエラー一覧
        errors: Vec<String>,
    },

    /// 設定の検証に失敗したエラー
    ///
    /// `PipelineBuilder::build()`時に無効な設定が検出された場合に発生します。
    #[error("Configuration error: {0}")]
    Config(String),

    /// セキュリティ制限に違反したエラー
    ///
    /// ZIP bomb攻撃、パストラバーサル攻撃、ファイルサイズ制限などの
    /// セキュリティ制限に違反した場合に発生します。
    #[error("Security violation: {0}")]
    SecurityViolation(String),

    /// ZIPアーカイブの読み書きエラー
    #[error("ZIP archive error: {0}")]
    Zip(String),
}

impl From<zip::result::ZipError> for MergeZeroError {
    fn from(err: zip::result::ZipError) -> Self {
        MergeZeroError::Zip(err.to_string())
    }
}

/// テンプレートの個別の問題
///
/// 識別子（`id`）と人間向けの説明を持ちます。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateIssue {
    /// 問題の識別子（例: `unclosed_tag`）
    pub id: String,
    /// 短いメッセージ
    pub message: String,
    /// 詳細な説明
    pub explanation: Option<String>,
    /// 問題が見つかったコンテナ内のパート名（例: `word/document.xml`）
    pub part: Option<String>,
}

impl TemplateIssue {
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
            explanation: None,
            part: None,
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }

    pub fn in_part(mut self, part: impl Into<String>) -> Self {
        self.part = Some(part.into());
        self
    }
}

impl fmt::Display for TemplateIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.id, self.message)?;
        if let Some(ref explanation) = self.explanation {
            write!(f, " ({})", explanation)?;
        }
        Ok(())
    }
}

/// 集約されたテンプレートエラー
///
/// 最初の問題だけでなく、検出されたすべての問題を保持します。
/// 表示形式は1行目が`Template Error:`、続いて問題ごとに1行です。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateError {
    issues: Vec<TemplateIssue>,
}

impl TemplateError {
    pub fn new(issues: Vec<TemplateIssue>) -> Self {
        Self { issues }
    }

    pub fn single(issue: TemplateIssue) -> Self {
        Self {
            issues: vec![issue],
        }
    }

    pub fn issues(&self) -> &[TemplateIssue] {
        &self.issues
    }

    pub fn has_issue(&self, id: &str) -> bool {
        self.issues.iter().any(|issue| issue.id == id)
    }
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Template Error:")?;
        for issue in &self.issues {
            write!(f, "\n{}", issue)?;
        }
        Ok(())
    }
}

impl std::error::Error for TemplateError {}

/// クレート内で使用するResult型
pub type Result<T> = std::result::Result<T, MergeZeroError>;
