//! Generator Module
//!
//! テンプレートとデータ行から文書を一括生成するモジュール。
//! 1行の失敗でバッチ全体を中断せず、すべての行を処理してエラーを収集します。

use std::sync::Arc;

use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::{info, warn};

use crate::api::CollisionPolicy;
use crate::error::{MergeZeroError, TemplateError};
use crate::naming::{resolve_file_name, NameRegistry};
use crate::template::Template;
use crate::types::{Artifact, GenerationResult, Row};

/// プレビューのファイル名
pub(crate) const PREVIEW_FILE_NAME: &str = "preview.docx";

/// バッチ生成器
///
/// 行のレンダリングは並列に実行され、ファイル名の決定は行番号順に逐次実行されます。
/// そのため、並列処理の完了順序に関係なく結果は決定的です。
#[derive(Debug, Clone)]
pub struct BatchGenerator {
    /// ファイル名パターン（`None`の場合はデフォルトの命名規則）
    file_name_pattern: Option<String>,
    /// 拡張子がない場合に付加する拡張子
    default_extension: String,
    /// ファイル名衝突時の処理方針
    collision_policy: CollisionPolicy,
    /// ワーカースレッドプール（`None`の場合はrayonのグローバルプール）
    pool: Option<Arc<ThreadPool>>,
}

impl Default for BatchGenerator {
    fn default() -> Self {
        Self {
            file_name_pattern: None,
            default_extension: "docx".to_string(),
            collision_policy: CollisionPolicy::default(),
            pool: None,
        }
    }
}

impl BatchGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file_name_pattern(mut self, pattern: Option<String>) -> Self {
        self.file_name_pattern = pattern.filter(|p| !p.is_empty());
        self
    }

    pub fn with_collision_policy(mut self, policy: CollisionPolicy) -> Self {
        self.collision_policy = policy;
        self
    }

    pub(crate) fn with_default_extension(mut self, extension: impl Into<String>) -> Self {
        self.default_extension = extension.into();
        self
    }

    pub(crate) fn with_pool(mut self, pool: Option<Arc<ThreadPool>>) -> Self {
        self.pool = pool;
        self
    }

    /// テンプレートのバイト列を解析してから一括生成する
    ///
    /// テンプレートの解析に失敗した場合は、どの行も処理せずにエラーを返します。
    pub fn generate_from_bytes(
        &self,
        template: &[u8],
        rows: &[Row],
    ) -> Result<GenerationResult, MergeZeroError> {
        let template = Template::parse(template)?;
        Ok(self.generate(&template, rows))
    }

    /// 解析済みテンプレートですべての行を生成する
    ///
    /// 各行は成果物1つ、またはエラー1つのどちらかになります。
    /// エラーは`Row <n>: <エラー内容>`形式（`n`は1始まり）で記録されます。
    pub fn generate(&self, template: &Template, rows: &[Row]) -> GenerationResult {
        let rendered = self.render_all(template, rows);

        let mut registry = NameRegistry::new(self.collision_policy);
        let mut artifacts = Vec::with_capacity(rows.len());
        let mut errors = Vec::new();

        for (index, (row, result)) in rows.iter().zip(rendered).enumerate() {
            let row_number = index + 1;
            match result {
                Ok(content) => {
                    let name = resolve_file_name(
                        row_number,
                        row,
                        self.file_name_pattern.as_deref(),
                        &self.default_extension,
                    );
                    match registry.claim(row_number, name) {
                        Ok(name) => artifacts.push(Artifact::new(name, content)),
                        Err(message) => {
                            warn!(row = row_number, "{}", message);
                            errors.push(message);
                        }
                    }
                }
                Err(source) => {
                    let error = MergeZeroError::Render {
                        row: row_number,
                        source,
                    };
                    warn!(row = row_number, "failed to render row: {}", error);
                    errors.push(error.to_string());
                }
            }
        }

        info!(
            rows = rows.len(),
            generated = artifacts.len(),
            failed = errors.len(),
            "batch generation finished"
        );

        GenerationResult::from_parts(artifacts, errors)
    }

    /// 最初の行だけを描画したプレビューを生成する
    ///
    /// # 戻り値
    ///
    /// * `Ok(Artifact)` - `preview.docx`という名前の成果物
    /// * `Err(MergeZeroError::Dataset)` - 行が1つもない場合
    /// * `Err(MergeZeroError::Render)` - 行の描画に失敗した場合
    pub fn preview(&self, template: &Template, rows: &[Row]) -> Result<Artifact, MergeZeroError> {
        let row = rows
            .first()
            .ok_or_else(|| MergeZeroError::Dataset("No data available for preview".to_string()))?;

        let content = template
            .render(row)
            .map_err(|source| MergeZeroError::Render { row: 1, source })?;

        Ok(Artifact::new(PREVIEW_FILE_NAME, content))
    }

    /// すべての行を描画する（結果は行の順序）
    fn render_all(&self, template: &Template, rows: &[Row]) -> Vec<Result<Vec<u8>, TemplateError>> {
        let render = || {
            rows.par_iter()
                .map(|row| template.render(row))
                .collect::<Vec<_>>()
        };

        match &self.pool {
            Some(pool) => pool.install(render),
            None => render(),
        }
    }
}
