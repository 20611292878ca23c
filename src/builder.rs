//! Builder Module
//!
//! Fluent Builder APIを提供し、`Pipeline`インスタンスを段階的に構築する。
//! `Pipeline`はセッション単位の操作（アップロード、検証、プレビュー、一括生成、ダウンロード）の
//! ファサードです。

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rayon::ThreadPool;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::{CollisionPolicy, DateFormat, DeliveryMode, SheetSelector};
use crate::archive::{ArchiveContents, ArchiveInfo, ArchivePackager};
use crate::convert::{convert_batch, ConversionFailure, DocumentConverter, SofficeConverter};
use crate::error::{MergeZeroError, TemplateError, TemplateIssue};
use crate::generator::{BatchGenerator, PREVIEW_FILE_NAME};
use crate::naming::sanitize_filename;
use crate::parser::DatasetParser;
use crate::session::{FileKind, MemorySessionStore, SessionFile, SessionStatus, SessionStore};
use crate::storage::{LocalStore, ObjectStore};
use crate::template::Template;
use crate::types::{Dataset, Row, ValidationResult};
use crate::validation::validate_template;

/// パイプラインの設定を保持する内部構造体
#[derive(Debug, Clone)]
pub(crate) struct PipelineConfig {
    /// シート選択方式
    pub sheet_selector: SheetSelector,

    /// 日付形式
    pub date_format: DateFormat,

    /// アーカイブの配信方式
    pub delivery_mode: DeliveryMode,

    /// ファイル名衝突時の処理方針
    pub collision_policy: CollisionPolicy,

    /// 生成される文書の拡張子（アーカイブ内のフォルダ名を兼ねる）
    pub default_extension: String,

    /// アップロードの最大サイズ（バイト）
    pub max_upload_size: u64,

    /// ダウンロードURLの有効期間
    pub presign_ttl: Duration,

    /// ローカル出力ディレクトリ
    pub output_dir: PathBuf,

    /// 変換用の一時ディレクトリの親
    pub work_dir: Option<PathBuf>,

    /// sofficeバイナリのパス（Noneの場合は変換しない）
    pub converter_path: Option<PathBuf>,

    /// 1回の変換のタイムアウト
    pub conversion_timeout: Duration,

    /// 最大ワーカースレッド数（Noneの場合はrayonのグローバルプール）
    pub max_workers: Option<usize>,

    /// アーカイブの圧縮レベル（0-9）
    pub compression_level: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sheet_selector: SheetSelector::Index(0),
            date_format: DateFormat::DayMonthYear,
            delivery_mode: DeliveryMode::Stream,
            collision_policy: CollisionPolicy::Rename,
            default_extension: "docx".to_string(),
            max_upload_size: 10 * 1024 * 1024,
            presign_ttl: Duration::from_secs(3600),
            output_dir: PathBuf::from("uploads"),
            work_dir: None,
            converter_path: None,
            conversion_timeout: SofficeConverter::DEFAULT_TIMEOUT,
            max_workers: None,
            compression_level: 9,
        }
    }
}

/// Fluent Builder APIを提供する構造体
///
/// `Pipeline`インスタンスを段階的に構築するためのビルダーです。
/// すべての設定項目にデフォルト値が設定されており、必要な設定のみをオーバーライドできます。
///
/// # 使用例
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use mergezero::{DeliveryMode, MemoryStore, PipelineBuilder};
///
/// # fn main() -> Result<(), mergezero::MergeZeroError> {
/// let pipeline = PipelineBuilder::new()
///     .with_delivery_mode(DeliveryMode::Materialize)
///     .with_object_store(Arc::new(MemoryStore::new()))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct PipelineBuilder {
    /// 内部設定（構築中）
    config: PipelineConfig,
    store: Option<Arc<dyn ObjectStore>>,
    sessions: Option<Arc<dyn SessionStore>>,
    converter: Option<Arc<dyn DocumentConverter>>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("config", &self.config)
            .field("custom_store", &self.store.is_some())
            .field("custom_sessions", &self.sessions.is_some())
            .field("custom_converter", &self.converter.is_some())
            .finish()
    }
}

impl PipelineBuilder {
    /// デフォルト設定を持つビルダーインスタンスを生成する
    ///
    /// # デフォルト設定
    ///
    /// - シート選択: 最初のシート
    /// - 日付形式: DD/MM/YYYY
    /// - 配信方式: ストリーミング
    /// - ファイル名衝突: 行番号を付加して一意にする
    /// - アップロード上限: 10MiB
    /// - ダウンロードURLの有効期間: 3600秒
    /// - 出力ディレクトリ: `uploads`
    /// - 形式変換: なし
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            store: None,
            sessions: None,
            converter: None,
        }
    }

    /// 環境変数から設定を読み込む
    ///
    /// | 変数 | 設定 |
    /// |---|---|
    /// | `LIBREOFFICE_PATH` | sofficeバイナリのパス |
    /// | `UPLOAD_DIR` | ローカル出力ディレクトリ |
    /// | `MAX_FILE_SIZE` | アップロードの最大サイズ（バイト） |
    /// | `ARCHIVE_DELIVERY` | `stream` または `materialize` |
    /// | `FILENAME_COLLISIONS` | `rename` または `reject` |
    /// | `PRESIGN_TTL_SECS` | ダウンロードURLの有効期間（秒） |
    /// | `MERGE_WORKERS` | 最大ワーカースレッド数 |
    ///
    /// 未設定または空の変数はデフォルト値のままです。
    pub fn from_env() -> Result<Self, MergeZeroError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_vars<F>(lookup: F) -> Result<Self, MergeZeroError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut builder = Self::new();

        if let Some(path) = var("LIBREOFFICE_PATH") {
            builder = builder.with_converter_path(path);
        }
        if let Some(dir) = var("UPLOAD_DIR") {
            builder = builder.with_output_dir(dir);
        }
        if let Some(size) = var("MAX_FILE_SIZE") {
            builder = builder.with_max_upload_size(parse_var("MAX_FILE_SIZE", &size)?);
        }
        if let Some(mode) = var("ARCHIVE_DELIVERY") {
            builder = builder.with_delivery_mode(mode.parse().map_err(MergeZeroError::Config)?);
        }
        if let Some(policy) = var("FILENAME_COLLISIONS") {
            builder =
                builder.with_collision_policy(policy.parse().map_err(MergeZeroError::Config)?);
        }
        if let Some(ttl) = var("PRESIGN_TTL_SECS") {
            builder = builder.with_presign_ttl(Duration::from_secs(parse_var("PRESIGN_TTL_SECS", &ttl)?));
        }
        if let Some(workers) = var("MERGE_WORKERS") {
            builder = builder.with_max_workers(parse_var("MERGE_WORKERS", &workers)?);
        }

        Ok(builder)
    }

    /// データセットとして読み込むシートを選択する
    pub fn with_sheet_selector(mut self, selector: SheetSelector) -> Self {
        self.config.sheet_selector = selector;
        self
    }

    /// 日付の出力形式を指定する
    ///
    /// # 使用例
    ///
    /// ```rust,no_run
    /// use mergezero::{DateFormat, PipelineBuilder};
    ///
    /// let builder = PipelineBuilder::new()
    ///     .with_date_format(DateFormat::Iso8601);
    /// ```
    pub fn with_date_format(mut self, format: DateFormat) -> Self {
        self.config.date_format = format;
        self
    }

    /// アーカイブの配信方式を指定する
    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.config.delivery_mode = mode;
        self
    }

    /// ファイル名衝突時の処理方針を指定する
    pub fn with_collision_policy(mut self, policy: CollisionPolicy) -> Self {
        self.config.collision_policy = policy;
        self
    }

    /// 生成される文書の拡張子を指定する（ドットなし）
    pub fn with_default_extension(mut self, extension: impl Into<String>) -> Self {
        self.config.default_extension = extension.into();
        self
    }

    /// アップロードの最大サイズ（バイト）を指定する
    pub fn with_max_upload_size(mut self, bytes: u64) -> Self {
        self.config.max_upload_size = bytes;
        self
    }

    /// ダウンロードURLの有効期間を指定する
    pub fn with_presign_ttl(mut self, ttl: Duration) -> Self {
        self.config.presign_ttl = ttl;
        self
    }

    /// ローカル出力ディレクトリを指定する
    ///
    /// オブジェクトストアを指定しない場合の保存先（`<dir>/storage`）と、
    /// `DeliveryMode::Materialize`でのアーカイブの書き出し先（`<dir>/archives`）になります。
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    /// 変換用の一時ディレクトリの親を指定する
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.work_dir = Some(dir.into());
        self
    }

    /// sofficeバイナリのパスを指定し、形式変換を有効にする
    pub fn with_converter_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.converter_path = Some(path.into());
        self
    }

    /// 1回の変換のタイムアウトを指定する
    pub fn with_conversion_timeout(mut self, timeout: Duration) -> Self {
        self.config.conversion_timeout = timeout;
        self
    }

    /// 最大ワーカースレッド数を指定する
    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.config.max_workers = Some(workers);
        self
    }

    /// アーカイブの圧縮レベル（0-9）を指定する
    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.config.compression_level = level;
        self
    }

    /// オブジェクトストアを指定する
    pub fn with_object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// セッションストアを指定する
    pub fn with_session_store(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// 文書コンバーターを指定する（`with_converter_path`より優先）
    pub fn with_converter(mut self, converter: Arc<dyn DocumentConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    /// 設定を検証し、`Pipeline`インスタンスを生成する
    ///
    /// # 発生し得るエラー
    ///
    /// * `MergeZeroError::Config(String)`: 設定の検証に失敗した場合
    ///   * カスタム日付形式が不正な書式文字列
    ///   * 拡張子が英数字以外を含む
    ///   * アップロード上限、ワーカー数、URLの有効期間が0
    ///   * 圧縮レベルが9を超える
    pub fn build(self) -> Result<Pipeline, MergeZeroError> {
        let config = self.config;

        // 1. カスタム日付形式の検証
        config.date_format.validate().map_err(MergeZeroError::Config)?;

        // 2. 数値・名前の検証
        if !is_valid_extension(&config.default_extension) {
            return Err(MergeZeroError::Config(format!(
                "Invalid document extension: '{}'",
                config.default_extension
            )));
        }
        if config.max_upload_size == 0 {
            return Err(MergeZeroError::Config(
                "Maximum upload size must be greater than 0".to_string(),
            ));
        }
        if config.presign_ttl.is_zero() {
            return Err(MergeZeroError::Config(
                "Download URL lifetime must be greater than 0".to_string(),
            ));
        }
        if config.compression_level > 9 {
            return Err(MergeZeroError::Config(format!(
                "Invalid compression level: {} (expected 0-9)",
                config.compression_level
            )));
        }

        // 3. ワーカープール
        let pool = match config.max_workers {
            Some(0) => {
                return Err(MergeZeroError::Config(
                    "Worker count must be greater than 0".to_string(),
                ))
            }
            Some(workers) => Some(Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(workers)
                    .thread_name(|i| format!("mergezero-worker-{}", i))
                    .build()
                    .map_err(|e| MergeZeroError::Config(format!("Failed to build worker pool: {}", e)))?,
            )),
            None => None,
        };

        // 4. 依存の組み立て
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(LocalStore::new(config.output_dir.join("storage"))) as Arc<dyn ObjectStore>);
        let sessions = self
            .sessions
            .unwrap_or_else(|| Arc::new(MemorySessionStore::new()) as Arc<dyn SessionStore>);
        let converter = self.converter.or_else(|| {
            config.converter_path.as_ref().map(|path| {
                let mut soffice =
                    SofficeConverter::new(path.clone()).with_timeout(config.conversion_timeout);
                if let Some(ref work_dir) = config.work_dir {
                    soffice = soffice.with_work_root(work_dir.clone());
                }
                Arc::new(soffice) as Arc<dyn DocumentConverter>
            })
        });

        Ok(Pipeline {
            parser: DatasetParser::new(config.sheet_selector.clone(), config.date_format.clone()),
            packager: ArchivePackager::new(config.compression_level),
            config,
            store,
            sessions,
            converter,
            pool,
        })
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, MergeZeroError> {
    value
        .parse()
        .map_err(|_| MergeZeroError::Config(format!("Invalid value for {}: '{}'", key, value)))
}

fn is_valid_extension(ext: &str) -> bool {
    !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric())
}

/// テンプレートのアップロード結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateUpload {
    pub session_id: String,
    pub storage_key: String,
    /// テンプレート内のプレースホルダー（記述どおり）
    pub placeholders: Vec<String>,
}

/// データセットのアップロード結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetUpload {
    pub session_id: String,
    pub headers: Vec<String>,
    pub row_count: usize,
}

/// プレビューの結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewReport {
    pub session_id: String,
    pub storage_key: String,
    pub url: String,
    /// プレビューに使用した行（データセットの最初の行）
    pub row: Row,
}

/// 一括生成のリクエスト
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerateRequest {
    /// ファイル名パターン（例: `{Name}_{index}.docx`）
    pub file_name_pattern: Option<String>,
    /// 追加の出力形式（例: `pdf`, `odt`）
    pub formats: Vec<String>,
}

impl GenerateRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file_name_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.file_name_pattern = Some(pattern.into());
        self
    }

    pub fn with_formats<I, S>(mut self, formats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.formats = formats.into_iter().map(Into::into).collect();
        self
    }
}

/// 一括生成の結果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateReport {
    pub session_id: String,
    /// アーカイブのストレージキー
    pub archive_key: String,
    /// `DeliveryMode::Materialize`の場合のローカルファイルのパス
    pub local_path: Option<PathBuf>,
    pub url: String,
    pub delivery: DeliveryMode,
    /// アーカイブのサイズ（バイト）
    pub size: u64,
    /// 生成された文書の数（行数）
    pub documents: usize,
    /// アーカイブ内のエントリ数（すべての形式の合計）
    pub entries: usize,
    /// 少なくとも1つの変換が成功した追加形式
    pub formats: Vec<String>,
    /// 失敗した変換（`<ファイル> -> <形式>: <エラー>`）
    pub conversion_failures: Vec<String>,
}

/// セッション単位の処理のファサード
///
/// テンプレートとデータセットのアップロードから、アーカイブのダウンロードURL発行までを扱います。
/// ストレージ、セッションストア、コンバーターは明示的な依存として保持され、
/// 異なるセッション間で状態を共有しません。
///
/// # 使用例
///
/// ```rust,no_run
/// use mergezero::{GenerateRequest, PipelineBuilder};
///
/// # fn main() -> Result<(), mergezero::MergeZeroError> {
/// let pipeline = PipelineBuilder::new().build()?;
/// let session = pipeline.new_session();
///
/// pipeline.upload_template(&session, "receipt.docx", &std::fs::read("receipt.docx")?)?;
/// pipeline.upload_dataset(&session, "data.xlsx", &std::fs::read("data.xlsx")?)?;
///
/// let validation = pipeline.validate(&session)?;
/// if validation.valid {
///     let report = pipeline.generate(&session, &GenerateRequest::new())?;
///     println!("{}", report.url);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    config: PipelineConfig,
    parser: DatasetParser,
    packager: ArchivePackager,
    store: Arc<dyn ObjectStore>,
    sessions: Arc<dyn SessionStore>,
    converter: Option<Arc<dyn DocumentConverter>>,
    pool: Option<Arc<ThreadPool>>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("config", &self.config)
            .field("converter", &self.converter.is_some())
            .finish()
    }
}

impl Pipeline {
    /// 新しいセッションIDを発行する
    pub fn new_session(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// オブジェクトストア
    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    /// セッションストア
    pub fn sessions(&self) -> &dyn SessionStore {
        self.sessions.as_ref()
    }

    /// セッションのアーカイブのストレージキー
    pub fn archive_key(session_id: &str) -> String {
        format!("generated/{0}/documents_{0}.zip", session_id)
    }

    /// セッションのプレビューのストレージキー
    pub fn preview_key(session_id: &str) -> String {
        format!("previews/{}/{}", session_id, PREVIEW_FILE_NAME)
    }

    /// テンプレートをアップロードする
    ///
    /// テンプレートは保存前に解析され、構文エラーがある場合は保存されません。
    /// 保存先は`templates/<セッションID>-<ファイル名>`です。
    pub fn upload_template(
        &self,
        session_id: &str,
        original_name: &str,
        bytes: &[u8],
    ) -> Result<TemplateUpload, MergeZeroError> {
        check_session_id(session_id)?;
        self.check_upload_size(original_name, bytes)?;
        if !has_extension(original_name, "docx") {
            return Err(TemplateError::single(
                TemplateIssue::new("unsupported_format", "Only DOCX templates are supported")
                    .with_explanation(format!("'{}' is not a .docx file", original_name)),
            )
            .into());
        }

        let template = Template::parse(bytes)?;

        let storage_key = format!(
            "templates/{}-{}",
            session_id,
            sanitize_filename(base_name(original_name))
        );
        self.store.put(&storage_key, bytes)?;

        let mut record = SessionFile::new(session_id, FileKind::Template, original_name);
        record.storage_key = Some(storage_key.clone());
        self.sessions.put(record)?;

        info!(
            session = session_id,
            key = %storage_key,
            placeholders = template.placeholders().len(),
            "template uploaded"
        );
        Ok(TemplateUpload {
            session_id: session_id.to_string(),
            storage_key,
            placeholders: template.placeholders().to_vec(),
        })
    }

    /// データセットをアップロードする
    ///
    /// データセットはアップロード時に解析され、セッションストアにキャッシュされます。
    /// 列がない、データ行がない、列名が重複している場合は拒否されます。
    pub fn upload_dataset(
        &self,
        session_id: &str,
        original_name: &str,
        bytes: &[u8],
    ) -> Result<DatasetUpload, MergeZeroError> {
        check_session_id(session_id)?;
        self.check_upload_size(original_name, bytes)?;
        if !has_extension(original_name, "xlsx") {
            return Err(MergeZeroError::Dataset(
                "Only XLSX format is supported".to_string(),
            ));
        }

        let dataset = self.parser.parse(bytes)?;
        dataset.check().map_err(MergeZeroError::Dataset)?;

        let upload = DatasetUpload {
            session_id: session_id.to_string(),
            headers: dataset.headers.clone(),
            row_count: dataset.row_count(),
        };

        let mut record = SessionFile::new(session_id, FileKind::Dataset, original_name);
        record.dataset = Some(dataset);
        self.sessions.put(record)?;

        info!(
            session = session_id,
            columns = upload.headers.len(),
            rows = upload.row_count,
            "dataset uploaded"
        );
        Ok(upload)
    }

    /// テンプレートのプレースホルダーとデータセットの列を照合する
    pub fn validate(&self, session_id: &str) -> Result<ValidationResult, MergeZeroError> {
        let template = self.load_template(session_id)?;
        let dataset = self.load_dataset(session_id)?;
        Ok(validate_template(template.placeholders(), &dataset.headers))
    }

    /// 最初の行だけを描画したプレビューを保存し、ダウンロードURLを返す
    pub fn preview(&self, session_id: &str) -> Result<PreviewReport, MergeZeroError> {
        let template = self.load_template(session_id)?;
        let dataset = self.load_dataset(session_id)?;

        let artifact = self.generator(None).preview(&template, &dataset.rows)?;
        let storage_key = Self::preview_key(session_id);
        self.store.put(&storage_key, &artifact.content)?;
        let url = self.store.presigned_url(&storage_key, self.config.presign_ttl)?;

        Ok(PreviewReport {
            session_id: session_id.to_string(),
            storage_key,
            url,
            row: dataset.rows.first().cloned().unwrap_or_default(),
        })
    }

    /// すべての行の文書を生成し、アーカイブとして保存する
    ///
    /// # 処理フロー
    ///
    /// 1. テンプレートを1回だけ解析（失敗した場合はどの行も処理しない）
    /// 2. すべての行を生成（1行でも失敗した場合は`RowsFailed`を返し、アーカイブは作成しない）
    /// 3. 追加形式への変換（失敗したペアは`conversion_failures`に記録して継続）
    /// 4. 配信方式に応じてアーカイブを作成し、セッションを`processed`にする
    pub fn generate(
        &self,
        session_id: &str,
        request: &GenerateRequest,
    ) -> Result<GenerateReport, MergeZeroError> {
        let template = self.load_template(session_id)?;
        let dataset = self.load_dataset(session_id)?;

        let result = self
            .generator(request.file_name_pattern.clone())
            .generate(&template, &dataset.rows);
        if !result.success {
            warn!(session = session_id, failed = result.errors.len(), "generation failed");
            return Err(MergeZeroError::RowsFailed {
                errors: result.errors,
            });
        }
        let documents = result.artifacts.len();

        let (formats, invalid) = self.normalize_formats(&request.formats);
        let mut conversion_failures: Vec<String> = invalid
            .iter()
            .map(|format| format!("{}: Unsupported format", format))
            .collect();

        let mut contents = ArchiveContents::new();
        if !formats.is_empty() {
            match self.converter {
                Some(ref converter) => {
                    let convert = || convert_batch(converter.as_ref(), &result.artifacts, &formats);
                    let outcome = match self.pool {
                        Some(ref pool) => pool.install(convert),
                        None => convert(),
                    };
                    conversion_failures.extend(outcome.failures.iter().map(ToString::to_string));
                    contents.extend(outcome.outputs.into_iter().filter(|(_, a)| !a.is_empty()));
                }
                None => {
                    for format in &formats {
                        for artifact in &result.artifacts {
                            conversion_failures.push(
                                ConversionFailure {
                                    file: artifact.name.clone(),
                                    format: format.clone(),
                                    message: "No document converter is configured".to_string(),
                                }
                                .to_string(),
                            );
                        }
                    }
                }
            }
        }
        let converted_formats: Vec<String> = contents.keys().cloned().collect();
        contents.insert(self.config.default_extension.clone(), result.artifacts);

        let archive_key = Self::archive_key(session_id);
        let (info, local_path) = self.deliver(session_id, &archive_key, &contents)?;

        self.sessions.set_status(session_id, SessionStatus::Processed)?;
        let url = self.store.presigned_url(&archive_key, self.config.presign_ttl)?;

        info!(
            session = session_id,
            documents,
            entries = info.entries,
            size = info.size,
            failures = conversion_failures.len(),
            "generation finished"
        );

        Ok(GenerateReport {
            session_id: session_id.to_string(),
            archive_key,
            local_path,
            url,
            delivery: self.config.delivery_mode,
            size: info.size,
            documents,
            entries: info.entries,
            formats: converted_formats,
            conversion_failures,
        })
    }

    /// 生成済みアーカイブのダウンロードURLを発行する
    pub fn download_url(&self, session_id: &str) -> Result<String, MergeZeroError> {
        check_session_id(session_id)?;
        self.store
            .presigned_url(&Self::archive_key(session_id), self.config.presign_ttl)
    }

    fn deliver(
        &self,
        session_id: &str,
        archive_key: &str,
        contents: &ArchiveContents,
    ) -> Result<(ArchiveInfo, Option<PathBuf>), MergeZeroError> {
        match self.config.delivery_mode {
            DeliveryMode::Stream => {
                let info = self
                    .packager
                    .stream_to_store(contents, self.store.as_ref(), archive_key)?;
                Ok((info, None))
            }
            DeliveryMode::Materialize => {
                let path = self
                    .config
                    .output_dir
                    .join("archives")
                    .join(session_id)
                    .join(format!("documents_{}.zip", session_id));
                let info = self.packager.materialize(contents, &path)?;
                if let Err(e) = self.store.put_file(archive_key, &path) {
                    if let Err(cleanup) = self.store.delete(archive_key) {
                        warn!(key = archive_key, "failed to remove partial archive: {}", cleanup);
                    }
                    return Err(MergeZeroError::Packaging(format!(
                        "Failed to upload archive: {}",
                        e
                    )));
                }
                Ok((
                    ArchiveInfo {
                        location: archive_key.to_string(),
                        ..info
                    },
                    Some(path),
                ))
            }
        }
    }

    fn generator(&self, pattern: Option<String>) -> BatchGenerator {
        BatchGenerator::new()
            .with_file_name_pattern(pattern)
            .with_collision_policy(self.config.collision_policy)
            .with_default_extension(self.config.default_extension.clone())
            .with_pool(self.pool.clone())
    }

    fn load_template(&self, session_id: &str) -> Result<Template, MergeZeroError> {
        check_session_id(session_id)?;
        let record = self.sessions.require(session_id, FileKind::Template)?;
        let key = record.storage_key.ok_or_else(|| MergeZeroError::SessionNotFound {
            session_id: session_id.to_string(),
            kind: FileKind::Template.to_string(),
        })?;
        let bytes = self.store.get(&key)?;
        Template::parse(&bytes)
    }

    fn load_dataset(&self, session_id: &str) -> Result<Dataset, MergeZeroError> {
        check_session_id(session_id)?;
        self.sessions
            .require(session_id, FileKind::Dataset)?
            .dataset
            .ok_or_else(|| MergeZeroError::Dataset("No data available for this session".to_string()))
    }

    fn check_upload_size(&self, name: &str, bytes: &[u8]) -> Result<(), MergeZeroError> {
        if bytes.len() as u64 > self.config.max_upload_size {
            return Err(MergeZeroError::SecurityViolation(format!(
                "File '{}' exceeds maximum upload size: {} bytes (max: {} bytes)",
                name,
                bytes.len(),
                self.config.max_upload_size
            )));
        }
        Ok(())
    }

    /// 追加形式を小文字化・重複除去する
    ///
    /// # 戻り値
    ///
    /// (有効な形式, 不正な形式)。文書自体の拡張子は除外されます。
    fn normalize_formats(&self, formats: &[String]) -> (Vec<String>, Vec<String>) {
        let mut valid: Vec<String> = Vec::new();
        let mut invalid = Vec::new();
        for format in formats {
            let requested = format.trim();
            let format = requested
                .strip_prefix('.')
                .unwrap_or(requested)
                .to_ascii_lowercase();
            if format.is_empty() || format == self.config.default_extension.to_ascii_lowercase() {
                continue;
            }
            if !is_valid_extension(&format) {
                invalid.push(requested.to_string());
            } else if !valid.contains(&format) {
                valid.push(format);
            }
        }
        (valid, invalid)
    }
}

fn check_session_id(session_id: &str) -> Result<(), MergeZeroError> {
    let valid = !session_id.is_empty()
        && session_id.len() <= 64
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(MergeZeroError::SecurityViolation(format!(
            "Invalid session id: '{}'",
            session_id
        )))
    }
}

fn base_name(name: &str) -> &str {
    name.rsplit(&['/', '\\'][..]).next().unwrap_or(name)
}

fn has_extension(name: &str, ext: &str) -> bool {
    Path::new(base_name(name))
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}
