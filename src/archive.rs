//! Archive Module
//!
//! 生成されたすべての成果物を1つのZIPアーカイブにまとめるモジュール。
//! 各成果物は`<形式フォルダ>/<ファイル名>`に格納されます。
//!
//! 配信方式は2種類で、どちらもアーカイブの論理的な内容は同一です。
//!
//! - ローカルファイルに書き出す（`materialize`）
//! - 圧縮しながらストレージへ直接ストリーミングする（`stream_to_store`）

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread;

use tempfile::NamedTempFile;
use tracing::{info, warn};
use zip::ZipWriter;

use crate::error::MergeZeroError;
use crate::security::validate_zip_path;
use crate::storage::ObjectStore;
use crate::template::deterministic_options;
use crate::types::Artifact;

/// ストリーミング時のチャンクサイズ
const CHUNK_SIZE: usize = 256 * 1024;
/// 送信待ちにできるチャンク数
const CHANNEL_DEPTH: usize = 8;

/// 形式フォルダ名 → 成果物
pub type ArchiveContents = BTreeMap<String, Vec<Artifact>>;

/// アーカイブの作成結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    /// ストレージのキー、またはローカルファイルのパス
    pub location: String,
    /// アーカイブのサイズ（バイト）
    pub size: u64,
    /// エントリ数
    pub entries: usize,
}

/// アーカイブ作成器
#[derive(Debug, Clone)]
pub struct ArchivePackager {
    /// Deflateの圧縮レベル（0-9）
    compression_level: i64,
}

impl Default for ArchivePackager {
    fn default() -> Self {
        Self {
            compression_level: 9,
        }
    }
}

impl ArchivePackager {
    pub fn new(compression_level: u32) -> Self {
        Self {
            compression_level: i64::from(compression_level.min(9)),
        }
    }

    /// エントリのパスを検証して列挙する
    fn entry_paths(contents: &ArchiveContents) -> Result<Vec<(String, &Artifact)>, MergeZeroError> {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();

        for (folder, artifacts) in contents {
            for artifact in artifacts {
                let path = format!("{}/{}", folder, artifact.name);
                validate_zip_path(&path).map_err(MergeZeroError::Packaging)?;
                if !seen.insert(path.clone()) {
                    return Err(MergeZeroError::Packaging(format!(
                        "Duplicate archive entry: {}",
                        path
                    )));
                }
                entries.push((path, artifact));
            }
        }

        Ok(entries)
    }

    fn write_entries<W: Write + Seek>(
        &self,
        zip: &mut ZipWriter<W>,
        entries: &[(String, &Artifact)],
    ) -> Result<(), MergeZeroError> {
        let options = deterministic_options(self.compression_level);
        for (path, artifact) in entries {
            zip.start_file(path.as_str(), options)?;
            zip.write_all(&artifact.content)?;
        }
        Ok(())
    }

    /// シーク可能なライターにアーカイブを書き出す
    ///
    /// # 戻り値
    ///
    /// 書き出したエントリ数
    pub fn write_to<W: Write + Seek>(
        &self,
        contents: &ArchiveContents,
        writer: W,
    ) -> Result<usize, MergeZeroError> {
        let entries = Self::entry_paths(contents)?;
        let mut zip = ZipWriter::new(writer);
        self.write_entries(&mut zip, &entries)?;
        zip.finish()?;
        Ok(entries.len())
    }

    /// アーカイブをローカルファイルとして作成する
    ///
    /// 同じディレクトリの一時ファイルに書き出してからリネームするため、
    /// 失敗した場合に不完全なファイルが残ることはありません。
    pub fn materialize(
        &self,
        contents: &ArchiveContents,
        path: &Path,
    ) -> Result<ArchiveInfo, MergeZeroError> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent).map_err(|e| packaging(&e))?;

        let mut tmp = NamedTempFile::new_in(&parent).map_err(|e| packaging(&e))?;
        let entries = self
            .write_to(contents, tmp.as_file_mut())
            .map_err(into_packaging)?;
        tmp.as_file_mut().flush().map_err(|e| packaging(&e))?;

        let file = tmp
            .persist(path)
            .map_err(|e| MergeZeroError::Packaging(format!("Failed to persist archive: {}", e)))?;
        let size = file.metadata().map_err(|e| packaging(&e))?.len();

        info!(path = %path.display(), size, entries, "archive written");
        Ok(ArchiveInfo {
            location: path.to_string_lossy().into_owned(),
            size,
            entries,
        })
    }

    /// 圧縮しながらストレージへ直接アップロードする
    ///
    /// アーカイブ全体をローカルディスクやメモリに保持しません。
    /// 圧縮またはアップロードのどちらかが失敗した場合はオブジェクトを削除し、
    /// `MergeZeroError::Packaging`を返します。
    pub fn stream_to_store(
        &self,
        contents: &ArchiveContents,
        store: &dyn ObjectStore,
        key: &str,
    ) -> Result<ArchiveInfo, MergeZeroError> {
        let entries = Self::entry_paths(contents)?;
        let (tx, rx) = mpsc::sync_channel::<Result<Vec<u8>, String>>(CHANNEL_DEPTH);

        let (written, uploaded) = thread::scope(|scope| {
            let producer = scope.spawn(|| {
                let abort = tx.clone();
                let result = self.write_stream(&entries, ChunkWriter::new(tx));
                if let Err(ref e) = result {
                    // 受信側に異常終了を通知し、不完全なアーカイブを確定させない
                    let _ = abort.send(Err(e.to_string()));
                }
                result
            });

            let mut reader = ChunkReader::new(rx);
            let uploaded = store.put_stream(key, &mut reader);
            drop(reader);

            let written = producer
                .join()
                .unwrap_or_else(|_| Err(MergeZeroError::Packaging("Archive writer panicked".to_string())));
            (written, uploaded)
        });

        let failure = match (&written, &uploaded) {
            (Err(e), _) => Some(format!("Failed to build archive: {}", e)),
            (Ok(_), Err(e)) => Some(format!("Failed to upload archive: {}", e)),
            (Ok(_), Ok(_)) => None,
        };

        if let Some(message) = failure {
            warn!(key, "{}", message);
            if let Err(e) = store.delete(key) {
                warn!(key, "failed to remove partial archive: {}", e);
            }
            return Err(MergeZeroError::Packaging(message));
        }

        let size = uploaded?;
        let entries = written?;
        info!(key, size, entries, "archive streamed");
        Ok(ArchiveInfo {
            location: key.to_string(),
            size,
            entries,
        })
    }

    fn write_stream(
        &self,
        entries: &[(String, &Artifact)],
        sink: ChunkWriter,
    ) -> Result<usize, MergeZeroError> {
        let mut zip = ZipWriter::new_stream(sink);
        self.write_entries(&mut zip, entries)?;
        let mut sink = zip.finish()?;
        sink.flush()?;
        Ok(entries.len())
    }
}

fn packaging(e: &io::Error) -> MergeZeroError {
    MergeZeroError::Packaging(e.to_string())
}

fn into_packaging(e: MergeZeroError) -> MergeZeroError {
    match e {
        MergeZeroError::Packaging(_) => e,
        other => MergeZeroError::Packaging(other.to_string()),
    }
}

/// チャネルへチャンク単位で送信するライター
struct ChunkWriter {
    tx: SyncSender<Result<Vec<u8>, String>>,
    buf: Vec<u8>,
}

impl ChunkWriter {
    fn new(tx: SyncSender<Result<Vec<u8>, String>>) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(CHUNK_SIZE),
        }
    }

    fn send_buffer(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(CHUNK_SIZE));
        self.tx.send(Ok(chunk)).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "archive upload was aborted")
        })
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= CHUNK_SIZE {
            self.send_buffer()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffer()
    }
}

/// チャネルからチャンクを受信するリーダー
///
/// 送信側がエラーを通知した場合は読み込みエラーを返します。
/// すべての送信側が破棄されたときにEOFになります。
struct ChunkReader {
    rx: Receiver<Result<Vec<u8>, String>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl ChunkReader {
    fn new(rx: Receiver<Result<Vec<u8>, String>>) -> Self {
        Self {
            rx,
            chunk: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.chunk.len() {
            match self.rx.recv() {
                Ok(Ok(chunk)) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Ok(Err(message)) => return Err(io::Error::new(io::ErrorKind::Other, message)),
                Err(_) => return Ok(0),
            }
        }

        let n = out.len().min(self.chunk.len() - self.pos);
        out[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::io::Cursor;

    fn contents() -> ArchiveContents {
        let mut contents = ArchiveContents::new();
        contents.insert(
            "docx".to_string(),
            vec![
                Artifact::new("receipt_1_Ana.docx", b"ana".to_vec()),
                Artifact::new("receipt_2_Bob.docx", b"bob".to_vec()),
            ],
        );
        contents.insert(
            "odt".to_string(),
            vec![Artifact::new("receipt_1_Ana.odt", b"ana-odt".to_vec())],
        );
        contents
    }

    fn entry_names(bytes: &[u8]) -> Vec<String> {
        let archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        archive.file_names().map(str::to_string).collect::<Vec<_>>()
    }

    fn read_entry(bytes: &[u8], name: &str) -> Vec<u8> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut file = archive.by_name(name).unwrap();
        let mut out = Vec::new();
        file.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_write_to_layout() {
        let mut buffer = Cursor::new(Vec::new());
        let entries = ArchivePackager::default()
            .write_to(&contents(), &mut buffer)
            .unwrap();
        assert_eq!(entries, 3);

        let bytes = buffer.into_inner();
        let mut names = entry_names(&bytes);
        names.sort();
        assert_eq!(
            names,
            vec![
                "docx/receipt_1_Ana.docx",
                "docx/receipt_2_Bob.docx",
                "odt/receipt_1_Ana.odt"
            ]
        );
        assert_eq!(read_entry(&bytes, "odt/receipt_1_Ana.odt"), b"ana-odt");
    }

    #[test]
    fn test_stream_and_materialize_have_same_entries() {
        let store = MemoryStore::new();
        let info = ArchivePackager::default()
            .stream_to_store(&contents(), &store, "generated/s1/documents_s1.zip")
            .unwrap();
        assert_eq!(info.entries, 3);

        let streamed = store.get("generated/s1/documents_s1.zip").unwrap();
        assert_eq!(info.size, streamed.len() as u64);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/documents.zip");
        let local = ArchivePackager::default().materialize(&contents(), &path).unwrap();
        let materialized = fs::read(&path).unwrap();
        assert_eq!(local.size, materialized.len() as u64);

        let mut streamed_names = entry_names(&streamed);
        let mut local_names = entry_names(&materialized);
        streamed_names.sort();
        local_names.sort();
        assert_eq!(streamed_names, local_names);
        assert_eq!(
            read_entry(&streamed, "docx/receipt_2_Bob.docx"),
            read_entry(&materialized, "docx/receipt_2_Bob.docx")
        );
    }

    #[test]
    fn test_stream_large_entries_spans_many_chunks() {
        let mut contents = ArchiveContents::new();
        let big: Vec<u8> = (0..3 * CHUNK_SIZE).map(|i| (i * 7 % 251) as u8).collect();
        contents.insert("docx".to_string(), vec![Artifact::new("big.docx", big.clone())]);

        let store = MemoryStore::new();
        ArchivePackager::new(1)
            .stream_to_store(&contents, &store, "big.zip")
            .unwrap();
        assert_eq!(read_entry(&store.get("big.zip").unwrap(), "docx/big.docx"), big);
    }

    #[test]
    fn test_rejects_unsafe_entry_names() {
        let mut contents = ArchiveContents::new();
        contents.insert("docx".to_string(), vec![Artifact::new("../evil.docx", vec![])]);

        let store = MemoryStore::new();
        let result = ArchivePackager::default().stream_to_store(&contents, &store, "x.zip");
        assert!(matches!(result, Err(MergeZeroError::Packaging(_))));
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_rejects_duplicate_entries() {
        let mut contents = ArchiveContents::new();
        contents.insert(
            "docx".to_string(),
            vec![Artifact::new("a.docx", vec![]), Artifact::new("a.docx", vec![])],
        );
        let result = ArchivePackager::default().write_to(&contents, Cursor::new(Vec::new()));
        assert!(matches!(result, Err(MergeZeroError::Packaging(msg)) if msg.contains("Duplicate")));
    }

    #[test]
    fn test_chunk_reader_reports_abort() {
        let (tx, rx) = mpsc::sync_channel(4);
        tx.send(Ok(b"abc".to_vec())).unwrap();
        tx.send(Err("disk full".to_string())).unwrap();
        drop(tx);

        let mut reader = ChunkReader::new(rx);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.to_string(), "disk full");
        assert_eq!(out, b"abc");
    }
}
