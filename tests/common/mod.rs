//! 集成测试共用的内存实现

#![allow(dead_code)]

use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use rx_harvest::services::{RetryExecutor, RetryPolicy, Sleeper};
use rx_harvest::{
    BatchProcessor, Config, DocumentRef, DocumentStore, ExtractionModel, ModelOutput, RunRequest,
    StopHandle, TaskError,
};

pub const TWO_FIELDS: &str = r#"{"document_quality": "good", "comment": "", "fields": {
    "patient_name": {"value": "Jane Roe", "confidence": "high"},
    "date": {"value": "2025-01-15", "confidence": "medium"}
}}"#;

pub fn docs(n: usize) -> Vec<DocumentRef> {
    (0..n)
        .map(|i| DocumentRef::new(format!("d{}", i), format!("rx_{:03}.pdf", i), "application/pdf"))
        .collect()
}

pub fn config() -> Config {
    Config {
        expected_field_count: Some(2),
        checkpoint_flush_every: 3,
        progress_log_every: 5,
        drive_rate_limit_per_minute: 0,
        llm_rate_limit_per_minute: 0,
        ..Config::default()
    }
}

pub fn request(dir: &tempfile::TempDir, workers: usize, resume: bool) -> RunRequest {
    RunRequest {
        folder_id: "folder-1".into(),
        output_path: dir.path().join("out.jsonl"),
        checkpoint_path: dir.path().join("checkpoint.json"),
        worker_count: workers,
        resume,
        sequential: false,
    }
}

/// 不等待的 sleeper
pub struct NoSleep;

#[async_trait]
impl Sleeper for NoSleep {
    async fn sleep(&self, _duration: Duration) {}
}

pub fn processor(
    config: Config,
    store: Arc<MockStore>,
    model: Arc<MockModel>,
) -> BatchProcessor {
    let retry = RetryExecutor::new(RetryPolicy::from_config(&config), Duration::from_secs(5))
        .with_sleeper(Arc::new(NoSleep));
    BatchProcessor::new(config, store, model)
        .expect("valid config")
        .with_retry(retry)
}

/// 内存云盘
#[derive(Default)]
pub struct MockStore {
    pub docs: Vec<DocumentRef>,
    pub missing: HashSet<String>,
    pub list_failures: usize,
    pub list_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
}

impl MockStore {
    pub fn new(docs: Vec<DocumentRef>) -> Self {
        Self {
            docs,
            ..Default::default()
        }
    }
}

#[async_trait]
impl DocumentStore for MockStore {
    async fn list_files(&self, _folder_id: &str) -> Result<Vec<DocumentRef>, TaskError> {
        let n = self.list_calls.fetch_add(1, Ordering::SeqCst);
        if n < self.list_failures {
            return Err(TaskError::server("drive", 500, "backend error"));
        }
        Ok(self.docs.clone())
    }

    async fn fetch_content(&self, doc: &DocumentRef) -> Result<Vec<u8>, TaskError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.missing.contains(&doc.id) {
            return Err(TaskError::not_found(&doc.id));
        }
        Ok(format!("%PDF {}", doc.id).into_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Good,
    AlwaysTransient,
}

/// 内存模型：记录调用次数和最大并发
pub struct MockModel {
    pub behavior: Behavior,
    /// 每次调用随机等待 0..max_delay_ms 毫秒
    pub max_delay_ms: u64,
    /// 第 N 次调用时触发停止信号
    pub stop_after: Option<usize>,
    pub stop: OnceLock<StopHandle>,
    pub calls: AtomicUsize,
    pub per_doc: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl MockModel {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            max_delay_ms: 0,
            stop_after: None,
            stop: OnceLock::new(),
            calls: AtomicUsize::new(0),
            per_doc: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn stopping_after(mut self, calls: usize) -> Self {
        self.stop_after = Some(calls);
        self
    }

    pub fn calls_for(&self, id: &str) -> usize {
        self.per_doc.lock().unwrap().get(id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl ExtractionModel for MockModel {
    async fn extract(
        &self,
        doc: &DocumentRef,
        _content: &[u8],
        _prompt: &str,
    ) -> Result<ModelOutput, TaskError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self.per_doc.lock().unwrap().entry(doc.id.clone()).or_default() += 1;

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = if self.max_delay_ms > 0 {
            rand::thread_rng().gen_range(0..self.max_delay_ms)
        } else {
            0
        };
        tokio::time::sleep(Duration::from_millis(delay)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.stop_after == Some(call) {
            if let Some(stop) = self.stop.get() {
                stop.stop();
            }
        }

        match self.behavior {
            Behavior::Good => Ok(ModelOutput {
                raw_text: TWO_FIELDS.to_string(),
                tokens_in: 1000,
                tokens_out: 200,
            }),
            Behavior::AlwaysTransient => Err(TaskError::rate_limited("model", None)),
        }
    }
}
