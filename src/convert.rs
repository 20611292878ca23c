//! Convert Module
//!
//! 生成された文書を他の形式（ODT、PDFなど）に変換するモジュール。
//! 変換処理は`DocumentConverter`トレイトの背後に隠蔽され、バッチ生成器は
//! 変換バックエンド（外部プロセス、リモートサービスなど）に依存しません。

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::api::CollisionPolicy;
use crate::error::MergeZeroError;
use crate::naming::NameRegistry;
use crate::types::Artifact;

/// 文書変換のインターフェース
///
/// 1つの文書のバイト列と変換先の拡張子（ドットなし）を受け取り、変換後のバイト列を返します。
/// 再試行は行いません（1回のみ実行）。
pub trait DocumentConverter: Send + Sync {
    fn convert(&self, input: &[u8], target_ext: &str) -> Result<Vec<u8>, MergeZeroError>;
}

/// LibreOffice（soffice）のヘッドレスモードを使用するコンバーター
///
/// 変換ごとに専用の一時ディレクトリとユーザープロファイルを使用するため、
/// 複数の変換を並行して実行できます。
#[derive(Debug, Clone)]
pub struct SofficeConverter {
    /// sofficeバイナリのパス
    binary: PathBuf,
    /// 1回の変換のタイムアウト
    timeout: Duration,
    /// 一時ディレクトリの親（`None`の場合はシステムの一時ディレクトリ）
    work_root: Option<PathBuf>,
}

impl SofficeConverter {
    /// デフォルトのタイムアウト
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: Self::DEFAULT_TIMEOUT,
            work_root: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = Some(root.into());
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// sofficeが実行可能か確認する
    pub fn is_available(&self) -> bool {
        let status = Command::new(&self.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match status {
            Ok(status) => status.success(),
            Err(e) => {
                debug!(binary = %self.binary.display(), "soffice is not available: {}", e);
                false
            }
        }
    }

    fn conversion_error(target_ext: &str, message: impl Into<String>) -> MergeZeroError {
        MergeZeroError::Conversion {
            format: target_ext.to_string(),
            message: message.into(),
        }
    }

    /// 子プロセスの終了をタイムアウト付きで待機する
    fn wait_with_timeout(
        &self,
        child: &mut std::process::Child,
        target_ext: &str,
    ) -> Result<std::process::ExitStatus, MergeZeroError> {
        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            if started.elapsed() >= self.timeout {
                // 終了済みの場合のkill失敗は無視する
                let _ = child.kill();
                let _ = child.wait();
                return Err(Self::conversion_error(
                    target_ext,
                    format!("Converter timed out after {} seconds", self.timeout.as_secs()),
                ));
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

impl DocumentConverter for SofficeConverter {
    fn convert(&self, input: &[u8], target_ext: &str) -> Result<Vec<u8>, MergeZeroError> {
        if target_ext.is_empty() || !target_ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Self::conversion_error(target_ext, "Invalid target format"));
        }

        let mut builder = tempfile::Builder::new();
        builder.prefix("mergezero-convert-");
        let work_dir = match &self.work_root {
            Some(root) => {
                fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };

        let input_path = work_dir.path().join("document.docx");
        let output_dir = work_dir.path().join("out");
        let profile_dir = work_dir.path().join("profile");
        fs::write(&input_path, input)?;
        fs::create_dir_all(&output_dir)?;

        let stderr_path = work_dir.path().join("stderr.log");
        let stderr = File::create(&stderr_path)?;

        let mut command = Command::new(&self.binary);
        command
            .arg(format!("-env:UserInstallation={}", file_url(&profile_dir)))
            .args(["--headless", "--norestore", "--convert-to", target_ext, "--outdir"])
            .arg(&output_dir)
            .arg(&input_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr));
        debug!(command = ?command, "running converter");

        let mut child = command.spawn().map_err(|e| {
            Self::conversion_error(
                target_ext,
                format!("Failed to start '{}': {}", self.binary.display(), e),
            )
        })?;
        let status = self.wait_with_timeout(&mut child, target_ext)?;

        if !status.success() {
            let stderr = fs::read_to_string(&stderr_path).unwrap_or_default();
            return Err(Self::conversion_error(
                target_ext,
                format!("Converter exited with {}: {}", status, stderr.trim()),
            ));
        }

        let output_path = output_dir.join(format!("document.{}", target_ext));
        fs::read(&output_path).map_err(|e| {
            Self::conversion_error(target_ext, format!("Converter produced no output: {}", e))
        })
    }
}

/// パスを`file://`URLに変換する
fn file_url(path: &Path) -> String {
    let path = path.to_string_lossy().replace('\\', "/");
    if path.starts_with('/') {
        format!("file://{}", path)
    } else {
        format!("file:///{}", path)
    }
}

/// 1つの（成果物, 形式）ペアの変換失敗
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionFailure {
    /// 変換元の成果物名
    pub file: String,
    /// 変換先の拡張子
    pub format: String,
    /// エラーメッセージ
    pub message: String,
}

impl std::fmt::Display for ConversionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}: {}", self.file, self.format, self.message)
    }
}

/// 一括変換の結果
#[derive(Debug, Clone, Default)]
pub struct ConversionOutcome {
    /// 形式フォルダ名 → 変換済み成果物（元の成果物の順序）
    pub outputs: BTreeMap<String, Vec<Artifact>>,
    /// 失敗したペア
    pub failures: Vec<ConversionFailure>,
}

/// すべての成果物をすべての形式に変換する
///
/// ペアごとに独立して実行され、ある形式・ある成果物の失敗は他のペアに影響しません。
/// 変換に成功したペアのみが`outputs`に含まれます。
pub fn convert_batch(
    converter: &dyn DocumentConverter,
    artifacts: &[Artifact],
    formats: &[String],
) -> ConversionOutcome {
    let pairs: Vec<(usize, &Artifact, &str)> = formats
        .iter()
        .flat_map(|format| {
            artifacts
                .iter()
                .enumerate()
                .map(move |(index, a)| (index + 1, a, format.as_str()))
        })
        .collect();

    let results: Vec<(usize, &Artifact, &str, Result<Vec<u8>, MergeZeroError>)> = pairs
        .into_par_iter()
        .map(|(index, artifact, format)| {
            (index, artifact, format, converter.convert(&artifact.content, format))
        })
        .collect();

    let mut outcome = ConversionOutcome::default();
    // 形式ごとに変換後のファイル名を一意にする（`a.b.docx`と`a.c.docx`はどちらも`a.pdf`になり得る）
    let mut registries: HashMap<&str, NameRegistry> = HashMap::new();
    for format in formats {
        outcome.outputs.entry(format.clone()).or_default();
    }

    for (index, artifact, format, result) in results {
        match result {
            Ok(content) => {
                let name = format!("{}.{}", artifact.stem(), format);
                let registry = registries
                    .entry(format)
                    .or_insert_with(|| NameRegistry::new(CollisionPolicy::Rename));
                match registry.claim(index, name) {
                    Ok(name) => outcome
                        .outputs
                        .entry(format.to_string())
                        .or_default()
                        .push(Artifact::new(name, content)),
                    Err(message) => outcome.failures.push(ConversionFailure {
                        file: artifact.name.clone(),
                        format: format.to_string(),
                        message,
                    }),
                }
            }
            Err(e) => {
                warn!(file = %artifact.name, format, "conversion failed: {}", e);
                outcome.failures.push(ConversionFailure {
                    file: artifact.name.clone(),
                    format: format.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 入力が`bad`でPDFへの変換の場合だけ失敗するコンバーター
    struct FlakyConverter;

    impl DocumentConverter for FlakyConverter {
        fn convert(&self, input: &[u8], target_ext: &str) -> Result<Vec<u8>, MergeZeroError> {
            if input == b"bad" && target_ext == "pdf" {
                return Err(MergeZeroError::Conversion {
                    format: target_ext.to_string(),
                    message: "boom".to_string(),
                });
            }
            let mut out = input.to_vec();
            out.extend_from_slice(target_ext.as_bytes());
            Ok(out)
        }
    }

    #[test]
    fn test_convert_batch_isolates_failures() {
        let artifacts = vec![
            Artifact::new("a.docx", b"good".to_vec()),
            Artifact::new("b.docx", b"bad".to_vec()),
        ];
        let formats = vec!["odt".to_string(), "pdf".to_string()];

        let outcome = convert_batch(&FlakyConverter, &artifacts, &formats);

        let odt: Vec<&str> = outcome.outputs["odt"].iter().map(|a| a.name.as_str()).collect();
        assert_eq!(odt, vec!["a.odt", "b.odt"]);
        let pdf: Vec<&str> = outcome.outputs["pdf"].iter().map(|a| a.name.as_str()).collect();
        assert_eq!(pdf, vec!["a.pdf"]);
        assert_eq!(outcome.outputs["pdf"][0].content, b"goodpdf".to_vec());

        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].file, "b.docx");
        assert_eq!(outcome.failures[0].format, "pdf");
        assert!(outcome.failures[0].to_string().contains("boom"));
    }

    #[test]
    fn test_convert_batch_disambiguates_converted_names() {
        let artifacts = vec![
            Artifact::new("J._Smith.docx", b"smith".to_vec()),
            Artifact::new("J._Doe.docx", b"doe".to_vec()),
            Artifact::new("j.docx", b"j".to_vec()),
        ];
        let formats = vec!["pdf".to_string()];

        let outcome = convert_batch(&FlakyConverter, &artifacts, &formats);

        let pdf: Vec<&str> = outcome.outputs["pdf"].iter().map(|a| a.name.as_str()).collect();
        assert_eq!(pdf, vec!["J._Smith.pdf", "J._Doe.pdf", "j.pdf"]);
        assert!(outcome.failures.is_empty());

        let artifacts = vec![
            Artifact::new("report.v1.docx", b"one".to_vec()),
            Artifact::new("report.v1.odt", b"two".to_vec()),
        ];
        let outcome = convert_batch(&FlakyConverter, &artifacts, &formats);
        let pdf: Vec<&str> = outcome.outputs["pdf"].iter().map(|a| a.name.as_str()).collect();
        assert_eq!(pdf, vec!["report.v1.pdf", "report.v1_2.pdf"]);
        assert!(outcome.failures.is_empty());
    }

    #[test]
    fn test_convert_batch_without_formats() {
        let artifacts = vec![Artifact::new("a.docx", vec![1])];
        let outcome = convert_batch(&FlakyConverter, &artifacts, &[]);
        assert!(outcome.outputs.is_empty());
        assert!(outcome.failures.is_empty());
    }

    #[test]
    fn test_soffice_missing_binary() {
        let converter = SofficeConverter::new("/nonexistent/soffice-binary")
            .with_timeout(Duration::from_secs(5));
        assert!(!converter.is_available());

        let result = converter.convert(b"doc", "odt");
        match result {
            Err(MergeZeroError::Conversion { format, message }) => {
                assert_eq!(format, "odt");
                assert!(message.contains("Failed to start"));
            }
            other => panic!("Expected conversion error, got {:?}", other),
        }
    }

    #[test]
    fn test_soffice_rejects_invalid_format() {
        let converter = SofficeConverter::new("soffice");
        assert!(converter.convert(b"doc", "../pdf").is_err());
        assert!(converter.convert(b"doc", "").is_err());
    }

    #[test]
    fn test_file_url() {
        assert_eq!(file_url(Path::new("/tmp/x")), "file:///tmp/x");
    }
}
