//! Storage Module
//!
//! 生成物を保存するオブジェクトストレージの抽象化。
//! パイプラインはストレージを明示的な依存として受け取るため、テストではメモリ上の実装に
//! 差し替えることができます。

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::MergeZeroError;
use crate::security::validate_storage_key;

/// オブジェクトストレージのインターフェース
///
/// キーは`/`区切りの相対パス（例: `generated/<session>/documents_<session>.zip`）です。
pub trait ObjectStore: Send + Sync {
    /// バイト列を保存する
    fn put(&self, key: &str, data: &[u8]) -> Result<(), MergeZeroError>;

    /// リーダーの内容を保存する
    ///
    /// リーダーがエラーを返した場合、オブジェクトは作成されません。
    ///
    /// # 戻り値
    ///
    /// 保存したバイト数
    fn put_stream(&self, key: &str, reader: &mut dyn Read) -> Result<u64, MergeZeroError>;

    /// オブジェクトを取得する
    fn get(&self, key: &str) -> Result<Vec<u8>, MergeZeroError>;

    /// オブジェクトを削除する（存在しない場合は何もしない）
    fn delete(&self, key: &str) -> Result<(), MergeZeroError>;

    /// 有効期限付きのダウンロードURLを発行する
    fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String, MergeZeroError>;

    /// ローカルファイルを保存する
    fn put_file(&self, key: &str, path: &Path) -> Result<u64, MergeZeroError> {
        let mut file = File::open(path)?;
        self.put_stream(key, &mut file)
    }
}

fn not_found(key: &str) -> MergeZeroError {
    MergeZeroError::Storage(format!("Object not found: {}", key))
}

fn expires_at(ttl: Duration) -> i64 {
    Utc::now().timestamp() + ttl.as_secs() as i64
}

/// ローカルディレクトリをバックエンドとするストレージ
///
/// 書き込みは一時ファイル経由で行われ、完了後にリネームされます。
/// 書き込み途中の不完全なオブジェクトが読み出されることはありません。
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// キーに対応するファイルパス
    pub fn path_for(&self, key: &str) -> Result<PathBuf, MergeZeroError> {
        validate_storage_key(key)?;
        Ok(self.root.join(key))
    }

    fn write_atomically<F>(&self, key: &str, write: F) -> Result<u64, MergeZeroError>
    where
        F: FnOnce(&mut File) -> io::Result<u64>,
    {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| MergeZeroError::Storage(format!("Invalid storage key: {}", key)))?;
        fs::create_dir_all(parent)?;

        let mut tmp = NamedTempFile::new_in(parent)?;
        let written = write(tmp.as_file_mut())?;
        tmp.as_file_mut().flush()?;
        tmp.persist(&path)
            .map_err(|e| MergeZeroError::Storage(format!("Failed to store '{}': {}", key, e)))?;

        debug!(key, bytes = written, "stored object");
        Ok(written)
    }
}

impl ObjectStore for LocalStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<(), MergeZeroError> {
        self.write_atomically(key, |file| {
            file.write_all(data)?;
            Ok(data.len() as u64)
        })?;
        Ok(())
    }

    fn put_stream(&self, key: &str, reader: &mut dyn Read) -> Result<u64, MergeZeroError> {
        self.write_atomically(key, |file| io::copy(reader, file))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, MergeZeroError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(not_found(key)),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, key: &str) -> Result<(), MergeZeroError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String, MergeZeroError> {
        let path = self.path_for(key)?;
        if !path.is_file() {
            return Err(not_found(key));
        }
        let path = path.canonicalize()?;
        Ok(format!(
            "file://{}?expires={}",
            path.to_string_lossy().replace('\\', "/"),
            expires_at(ttl)
        ))
    }
}

/// メモリ上のストレージ
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 保存されているキーの一覧（ソート済み）
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = match self.objects.read() {
            Ok(objects) => objects.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        };
        keys.sort();
        keys
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys().iter().any(|k| k == key)
    }

    fn lock_error() -> MergeZeroError {
        MergeZeroError::Storage("Storage lock poisoned".to_string())
    }
}

impl ObjectStore for MemoryStore {
    fn put(&self, key: &str, data: &[u8]) -> Result<(), MergeZeroError> {
        validate_storage_key(key)?;
        let mut objects = self.objects.write().map_err(|_| Self::lock_error())?;
        objects.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn put_stream(&self, key: &str, reader: &mut dyn Read) -> Result<u64, MergeZeroError> {
        validate_storage_key(key)?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        let len = data.len() as u64;
        let mut objects = self.objects.write().map_err(|_| Self::lock_error())?;
        objects.insert(key.to_string(), data);
        Ok(len)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, MergeZeroError> {
        let objects = self.objects.read().map_err(|_| Self::lock_error())?;
        objects.get(key).cloned().ok_or_else(|| not_found(key))
    }

    fn delete(&self, key: &str) -> Result<(), MergeZeroError> {
        let mut objects = self.objects.write().map_err(|_| Self::lock_error())?;
        objects.remove(key);
        Ok(())
    }

    fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String, MergeZeroError> {
        let objects = self.objects.read().map_err(|_| Self::lock_error())?;
        if !objects.contains_key(key) {
            return Err(not_found(key));
        }
        Ok(format!("memory://{}?expires={}", key, expires_at(ttl)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 指定バイト数を返した後にエラーになるリーダー
    struct BrokenReader {
        remaining: usize,
    }

    impl Read for BrokenReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.remaining == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "connection reset"));
            }
            let n = buf.len().min(self.remaining);
            buf[..n].fill(b'x');
            self.remaining -= n;
            Ok(n)
        }
    }

    #[test]
    fn test_local_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        store.put("templates/abc-receipt.docx", b"data").unwrap();
        assert_eq!(store.get("templates/abc-receipt.docx").unwrap(), b"data");

        let url = store
            .presigned_url("templates/abc-receipt.docx", Duration::from_secs(60))
            .unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.contains("abc-receipt.docx?expires="));

        store.delete("templates/abc-receipt.docx").unwrap();
        store.delete("templates/abc-receipt.docx").unwrap();
        assert!(matches!(
            store.get("templates/abc-receipt.docx"),
            Err(MergeZeroError::Storage(_))
        ));
    }

    #[test]
    fn test_local_store_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        assert!(matches!(
            store.put("../escape.txt", b"x"),
            Err(MergeZeroError::SecurityViolation(_))
        ));
    }

    #[test]
    fn test_local_store_failed_stream_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        let mut reader = BrokenReader { remaining: 10_000 };
        assert!(store.put_stream("generated/s/out.zip", &mut reader).is_err());
        assert!(!dir.path().join("generated/s/out.zip").exists());
        let leftovers = fs::read_dir(dir.path().join("generated/s")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        let mut reader: &[u8] = b"streamed";
        assert_eq!(store.put_stream("a/b.zip", &mut reader).unwrap(), 8);
        assert_eq!(store.get("a/b.zip").unwrap(), b"streamed");
        assert_eq!(store.keys(), vec!["a/b.zip"]);

        let url = store.presigned_url("a/b.zip", Duration::from_secs(1)).unwrap();
        assert!(url.starts_with("memory://a/b.zip?expires="));

        store.delete("a/b.zip").unwrap();
        assert!(!store.contains("a/b.zip"));
        assert!(store.presigned_url("a/b.zip", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_memory_store_failed_stream_leaves_nothing() {
        let store = MemoryStore::new();
        let mut reader = BrokenReader { remaining: 5 };
        assert!(store.put_stream("a/b.zip", &mut reader).is_err());
        assert!(store.keys().is_empty());
    }
}
