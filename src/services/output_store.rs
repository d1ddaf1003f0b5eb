//! 输出写入服务 - 业务能力层
//!
//! 只负责"追加一条提取结果"能力。文件格式为 JSON Lines，
//! 崩溃后前 N 条记录仍然完整可解析；续跑时对已有文件做一次整理。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::models::ExtractionRecord;

/// JSON Lines 输出文件
pub struct OutputStore {
    path: PathBuf,
    file: File,
    written: usize,
}

impl OutputStore {
    /// 新建（截断）输出文件
    pub async fn create(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        ensure_parent(&path).await?;
        let file = File::create(&path)
            .await
            .map_err(|e| AppError::output(&path, e))?;
        Ok(Self {
            path,
            file,
            written: 0,
        })
    }

    /// 续跑时打开输出文件
    ///
    /// 只保留 `keep_ids` 中每个文档的第一条记录，丢弃：
    /// - 末尾写了一半的行
    /// - 重复记录
    /// - 断点中不是 done 的文档（它们会被重新处理）
    ///
    /// 整理后的内容先写临时文件再 rename，然后以追加模式打开。
    pub async fn resume(path: impl Into<PathBuf>, keep_ids: &HashSet<String>) -> AppResult<Self> {
        let path = path.into();
        let existing = read_records(&path).await?;
        let before = existing.len();

        let mut seen = HashSet::new();
        let kept: Vec<ExtractionRecord> = existing
            .into_iter()
            .filter(|r| keep_ids.contains(&r.document_id) && seen.insert(r.document_id.clone()))
            .collect();

        if kept.len() != before {
            info!(
                "🧹 整理输出文件: 保留 {} 条, 丢弃 {} 条",
                kept.len(),
                before - kept.len()
            );
        }
        let missing = keep_ids.len().saturating_sub(kept.len());
        if missing > 0 {
            warn!("⚠️ 断点中有 {} 个已完成文档在输出文件中没有记录", missing);
        }

        rewrite_atomic(&path, &kept).await?;

        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| AppError::output(&path, e))?;
        Ok(Self {
            path,
            file,
            written: kept.len(),
        })
    }

    /// 追加一条记录（写入一整行后 flush）
    pub async fn append(&mut self, record: &ExtractionRecord) -> AppResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file
            .write_all(&line)
            .await
            .map_err(|e| AppError::output(&self.path, e))?;
        self.file
            .flush()
            .await
            .map_err(|e| AppError::output(&self.path, e))?;
        self.written += 1;
        debug!("写入结果: {} ({})", record.document_name, record.read_status);
        Ok(())
    }

    /// 同步到磁盘并关闭
    pub async fn close(mut self) -> AppResult<usize> {
        self.file
            .flush()
            .await
            .map_err(|e| AppError::output(&self.path, e))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| AppError::output(&self.path, e))?;
        Ok(self.written)
    }

    /// 文件中的记录数（含续跑前保留的）
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// 读取 JSON Lines 文件；不存在时返回空，无法解析的行被跳过
///
/// 按字节切分行：崩溃时最后一行可能断在多字节字符中间，
/// 这样的行和其他残缺行一样跳过，不会让整个文件无法读取。
pub async fn read_records(path: &Path) -> AppResult<Vec<ExtractionRecord>> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(AppError::output(path, e)),
    };

    let mut records = Vec::new();
    let mut lines = BufReader::new(file).split(b'\n');
    let mut line_no = 0usize;
    while let Some(line) = lines
        .next_segment()
        .await
        .map_err(|e| AppError::output(path, e))?
    {
        line_no += 1;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<ExtractionRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!("跳过无法解析的第 {} 行 ({}): {}", line_no, path.display(), e),
        }
    }
    Ok(records)
}

/// 把 JSON Lines 导出为格式化的 JSON 数组
pub async fn export_json_array(jsonl: &Path, json: &Path) -> AppResult<usize> {
    let records = read_records(jsonl).await?;
    let bytes = serde_json::to_vec_pretty(&records)?;
    ensure_parent(json).await?;
    fs::write(json, bytes)
        .await
        .map_err(|e| AppError::output(json, e))?;
    Ok(records.len())
}

async fn rewrite_atomic(path: &Path, records: &[ExtractionRecord]) -> AppResult<()> {
    let mut buf = Vec::new();
    for record in records {
        buf.extend(serde_json::to_vec(record)?);
        buf.push(b'\n');
    }

    ensure_parent(path).await?;
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    let tmp = path.with_file_name(name);

    let mut out = File::create(&tmp)
        .await
        .map_err(|e| AppError::output(&tmp, e))?;
    out.write_all(&buf)
        .await
        .map_err(|e| AppError::output(&tmp, e))?;
    out.sync_all().await.map_err(|e| AppError::output(&tmp, e))?;
    drop(out);

    fs::rename(&tmp, path)
        .await
        .map_err(|e| AppError::output(path, e))
}

async fn ensure_parent(path: &Path) -> AppResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| AppError::output(parent, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentRef;

    fn record(id: &str) -> ExtractionRecord {
        let doc = DocumentRef::new(id, format!("{}.pdf", id), "application/pdf");
        ExtractionRecord::failed(&doc, "x")
    }

    #[tokio::test]
    async fn test_append_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");

        let mut store = OutputStore::create(&path).await.unwrap();
        store.append(&record("a")).await.unwrap();
        store.append(&record("b")).await.unwrap();
        assert_eq!(store.close().await.unwrap(), 2);

        let records = read_records(&path).await.unwrap();
        let ids: Vec<_> = records.iter().map(|r| r.document_id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[tokio::test]
    async fn test_resume_drops_torn_tail_duplicates_and_unchecked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let line = |id: &str| serde_json::to_string(&record(id)).unwrap();
        let content = format!(
            "{}\n{}\n{}\n{}\n{{\"document_id\":\"d\",\"docu",
            line("a"),
            line("b"),
            line("a"),
            line("c")
        );
        std::fs::write(&path, content).unwrap();

        // c 不在断点 done 集合中（断点未落盘），会被重新处理
        let keep: HashSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let mut store = OutputStore::resume(&path, &keep).await.unwrap();
        assert_eq!(store.written(), 2);
        store.append(&record("c")).await.unwrap();
        store.close().await.unwrap();

        let ids: Vec<_> = read_records(&path)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.document_id)
            .collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_resume_survives_tail_cut_inside_multibyte_char() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");

        let doc = DocumentRef::new("b", "處方_002.pdf", "application/pdf");
        let torn = serde_json::to_vec(&ExtractionRecord::failed(&doc, "x")).unwrap();
        let cut = torn
            .windows("處".len())
            .position(|w| w == "處".as_bytes())
            .unwrap()
            + 1;

        let mut content = serde_json::to_vec(&record("a")).unwrap();
        content.push(b'\n');
        content.extend_from_slice(&torn[..cut]);
        std::fs::write(&path, content).unwrap();

        let keep: HashSet<String> = HashSet::from(["a".to_string()]);
        let mut store = OutputStore::resume(&path, &keep).await.unwrap();
        assert_eq!(store.written(), 1);
        store.append(&record("b")).await.unwrap();
        store.close().await.unwrap();

        let ids: Vec<_> = read_records(&path)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.document_id)
            .collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[tokio::test]
    async fn test_resume_without_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.jsonl");
        let store = OutputStore::resume(&path, &HashSet::new()).await.unwrap();
        assert_eq!(store.written(), 0);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_export_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let jsonl = dir.path().join("out.jsonl");
        let json = dir.path().join("out.json");
        let mut store = OutputStore::create(&jsonl).await.unwrap();
        store.append(&record("a")).await.unwrap();
        store.close().await.unwrap();

        assert_eq!(export_json_array(&jsonl, &json).await.unwrap(), 1);
        let parsed: Vec<ExtractionRecord> =
            serde_json::from_slice(&std::fs::read(&json).unwrap()).unwrap();
        assert_eq!(parsed[0].document_id, "a");
    }
}
