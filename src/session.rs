//! Session Module
//!
//! セッション（テンプレート1つとデータセット1つの組）のメタデータを管理するモジュール。
//! レコードは（セッションID, ファイル種別）をキーとして保存され、
//! データセットはアップロード時に解析済みの状態でキャッシュされます。

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MergeZeroError;
use crate::types::Dataset;

/// アップロードされたファイルの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Template,
    Dataset,
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileKind::Template => write!(f, "template"),
            FileKind::Dataset => write!(f, "dataset"),
        }
    }
}

/// セッションファイルの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// アップロード済み
    Uploaded,
    /// 文書の一括生成が完了した
    Processed,
}

/// セッションに登録されたファイルのレコード
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFile {
    pub session_id: String,
    pub kind: FileKind,
    /// アップロード時のファイル名
    pub original_name: String,
    /// オブジェクトストレージ上のキー（データセットは保存しないため`None`）
    pub storage_key: Option<String>,
    pub status: SessionStatus,
    /// 解析済みデータセット（`FileKind::Dataset`のみ）
    pub dataset: Option<Dataset>,
    pub created_at: DateTime<Utc>,
}

impl SessionFile {
    pub fn new(session_id: impl Into<String>, kind: FileKind, original_name: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
            original_name: original_name.into(),
            storage_key: None,
            status: SessionStatus::Uploaded,
            dataset: None,
            created_at: Utc::now(),
        }
    }
}

/// セッションメタデータの保存先
///
/// 同じ（セッションID, 種別）への`put`は既存のレコードを置き換えます。
pub trait SessionStore: Send + Sync {
    fn put(&self, file: SessionFile) -> Result<(), MergeZeroError>;

    fn get(&self, session_id: &str, kind: FileKind) -> Result<Option<SessionFile>, MergeZeroError>;

    /// セッションのすべてのレコードの状態を更新する
    ///
    /// # 戻り値
    ///
    /// 更新したレコード数
    fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<usize, MergeZeroError>;

    /// レコードを取得し、存在しない場合は`SessionNotFound`を返す
    fn require(&self, session_id: &str, kind: FileKind) -> Result<SessionFile, MergeZeroError> {
        self.get(session_id, kind)?
            .ok_or_else(|| MergeZeroError::SessionNotFound {
                session_id: session_id.to_string(),
                kind: kind.to_string(),
            })
    }
}

/// メモリ上のセッションストア
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    files: RwLock<HashMap<(String, FileKind), SessionFile>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_error() -> MergeZeroError {
        MergeZeroError::Storage("Session store lock poisoned".to_string())
    }
}

impl SessionStore for MemorySessionStore {
    fn put(&self, file: SessionFile) -> Result<(), MergeZeroError> {
        let mut files = self.files.write().map_err(|_| Self::lock_error())?;
        files.insert((file.session_id.clone(), file.kind), file);
        Ok(())
    }

    fn get(&self, session_id: &str, kind: FileKind) -> Result<Option<SessionFile>, MergeZeroError> {
        let files = self.files.read().map_err(|_| Self::lock_error())?;
        Ok(files.get(&(session_id.to_string(), kind)).cloned())
    }

    fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<usize, MergeZeroError> {
        let mut files = self.files.write().map_err(|_| Self::lock_error())?;
        let mut updated = 0;
        for ((id, _), file) in files.iter_mut() {
            if id == session_id {
                file.status = status;
                updated += 1;
            }
        }
        Ok(updated)
    }
}
