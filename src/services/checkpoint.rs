//! 断点存储 - 业务能力层
//!
//! 记录每个文档的终态，用于续跑时跳过已完成的文档。
//!
//! ## 设计特点
//! - 通过 trait 注入，测试使用 `MemoryCheckpointStore`
//! - 写入需要 `&mut self`，并发调用方必须先取得独占访问
//! - 每记录 `flush_every` 个结果落盘一次：先写临时文件，再原子 rename

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::CheckpointError;
use crate::models::{ExtractionRecord, ReadStatus};

const CHECKPOINT_VERSION: u32 = 1;

/// 文档终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Done,
    FailedPermanent,
}

/// 单个文档的断点条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub document_id: String,
    pub outcome: Outcome,
    pub read_status: ReadStatus,
    /// 以 failed_permanent 结束的运行次数
    #[serde(default)]
    pub failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    pub recorded_at: DateTime<Utc>,
}

impl CheckpointEntry {
    pub fn from_record(record: &ExtractionRecord) -> Self {
        let done = record.read_status.is_done();
        Self {
            document_id: record.document_id.clone(),
            outcome: if done { Outcome::Done } else { Outcome::FailedPermanent },
            read_status: record.read_status,
            failures: if done { 0 } else { 1 },
            last_error: (!done).then(|| record.comment.clone()),
            tokens_in: record.tokens_in,
            tokens_out: record.tokens_out,
            recorded_at: Utc::now(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.outcome == Outcome::Done
    }
}

/// `load()` 的结果
#[derive(Debug, Clone, Default)]
pub struct CheckpointState {
    pub entries: HashMap<String, CheckpointEntry>,
}

impl CheckpointState {
    pub fn done_ids(&self) -> HashSet<String> {
        self.entries
            .values()
            .filter(|e| e.is_done())
            .map(|e| e.document_id.clone())
            .collect()
    }

    pub fn failure_counts(&self) -> HashMap<String, u32> {
        self.entries
            .values()
            .filter(|e| e.failures > 0)
            .map(|e| (e.document_id.clone(), e.failures))
            .collect()
    }

    pub fn failed_entries(&self) -> Vec<&CheckpointEntry> {
        let mut failed: Vec<_> = self.entries.values().filter(|e| !e.is_done()).collect();
        failed.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        failed
    }

    fn upsert(&mut self, mut entry: CheckpointEntry) {
        if let Some(prev) = self.entries.get(&entry.document_id) {
            entry.failures += prev.failures;
            if entry.last_error.is_none() && !entry.is_done() {
                entry.last_error = prev.last_error.clone();
            }
        }
        self.entries.insert(entry.document_id.clone(), entry);
    }
}

/// 断点存储
#[async_trait]
pub trait CheckpointStore: Send {
    /// 读取已有断点；文件存在但无法解析时返回 `Corrupt`
    async fn load(&mut self) -> Result<CheckpointState, CheckpointError>;

    /// 记录一个文档的终态（插入或更新），按批次落盘
    async fn record_outcome(&mut self, entry: CheckpointEntry) -> Result<(), CheckpointError>;

    /// 立即落盘
    async fn flush(&mut self) -> Result<(), CheckpointError>;

    /// 操作员重置：清空状态并删除持久化数据
    async fn reset(&mut self) -> Result<(), CheckpointError>;

    /// 结束时调用，落盘所有未写入的结果
    async fn close(&mut self) -> Result<(), CheckpointError> {
        self.flush().await
    }
}

/// 磁盘上的断点文件格式
#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    version: u32,
    updated_at: DateTime<Utc>,
    entries: BTreeMap<String, CheckpointEntry>,
}

/// 基于 JSON 文件的断点存储
pub struct FileCheckpointStore {
    path: PathBuf,
    flush_every: usize,
    state: CheckpointState,
    unflushed: usize,
}

impl FileCheckpointStore {
    pub fn open(path: impl Into<PathBuf>, flush_every: usize) -> Self {
        Self {
            path: path.into(),
            flush_every: flush_every.max(1),
            state: CheckpointState::default(),
            unflushed: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn write_atomic(&self) -> Result<(), CheckpointError> {
        let file = CheckpointFile {
            version: CHECKPOINT_VERSION,
            updated_at: Utc::now(),
            entries: self
                .state
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CheckpointError::io(parent, e))?;
        }

        let tmp = self.temp_path();
        let mut out = fs::File::create(&tmp)
            .await
            .map_err(|e| CheckpointError::io(&tmp, e))?;
        out.write_all(&bytes)
            .await
            .map_err(|e| CheckpointError::io(&tmp, e))?;
        out.sync_all().await.map_err(|e| CheckpointError::io(&tmp, e))?;
        drop(out);

        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| CheckpointError::io(&self.path, e))?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&mut self) -> Result<CheckpointState, CheckpointError> {
        let content = match fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("断点文件不存在，从头开始: {}", self.path.display());
                self.state = CheckpointState::default();
                return Ok(self.state.clone());
            }
            Err(e) => return Err(CheckpointError::io(&self.path, e)),
        };

        let file: CheckpointFile =
            serde_json::from_slice(&content).map_err(|e| CheckpointError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        if file.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::Corrupt {
                path: self.path.clone(),
                reason: format!("不支持的断点版本 {}", file.version),
            });
        }

        self.state = CheckpointState {
            entries: file.entries.into_iter().collect(),
        };
        self.unflushed = 0;
        info!(
            "📂 已加载断点: {} 个文档已完成, {} 个失败",
            self.state.done_ids().len(),
            self.state.failed_entries().len()
        );
        Ok(self.state.clone())
    }

    async fn record_outcome(&mut self, entry: CheckpointEntry) -> Result<(), CheckpointError> {
        self.state.upsert(entry);
        self.unflushed += 1;
        if self.unflushed >= self.flush_every {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), CheckpointError> {
        self.write_atomic().await?;
        debug!("💾 断点已保存 ({} 条)", self.state.entries.len());
        self.unflushed = 0;
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), CheckpointError> {
        self.state = CheckpointState::default();
        self.unflushed = 0;
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("🗑️ 已清除断点文件: {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CheckpointError::io(&self.path, e)),
        }
    }
}

/// 内存断点存储（测试用），“落盘”只是把状态复制到 `persisted`
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    state: CheckpointState,
    persisted: CheckpointState,
    flush_every: usize,
    unflushed: usize,
    pub flush_count: usize,
}

impl MemoryCheckpointStore {
    pub fn new(flush_every: usize) -> Self {
        Self {
            flush_every: flush_every.max(1),
            ..Default::default()
        }
    }

    /// 以已持久化的条目初始化，模拟上一次运行留下的断点
    pub fn with_entries(flush_every: usize, entries: impl IntoIterator<Item = CheckpointEntry>) -> Self {
        let mut persisted = CheckpointState::default();
        for entry in entries {
            persisted.upsert(entry);
        }
        Self {
            state: persisted.clone(),
            persisted,
            ..Self::new(flush_every)
        }
    }

    /// 已持久化（崩溃后仍可见）的状态
    pub fn persisted(&self) -> &CheckpointState {
        &self.persisted
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&mut self) -> Result<CheckpointState, CheckpointError> {
        self.state = self.persisted.clone();
        Ok(self.state.clone())
    }

    async fn record_outcome(&mut self, entry: CheckpointEntry) -> Result<(), CheckpointError> {
        self.state.upsert(entry);
        self.unflushed += 1;
        if self.unflushed >= self.flush_every {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), CheckpointError> {
        self.persisted = self.state.clone();
        self.unflushed = 0;
        self.flush_count += 1;
        Ok(())
    }

    async fn reset(&mut self) -> Result<(), CheckpointError> {
        self.state = CheckpointState::default();
        self.persisted = CheckpointState::default();
        self.unflushed = 0;
        Ok(())
    }
}
