//! 批量文档处理器 - 编排层
//!
//! ## 职责
//!
//! 协调一次完整的批量提取运行：列出文档、跳过已完成的、并发处理剩余文档、
//! 持续写入结果和断点、最后汇总统计。
//!
//! ## 核心功能
//!
//! 1. **参数校验**：并发数越界时在列出文档之前失败
//! 2. **断点续跑**：`resume` 时跳过断点中已完成的文档，并整理输出文件
//! 3. **并发控制**：固定数量的 worker 从共享队列中逐个取文档
//! 4. **单一写者**：worker 只通过 channel 交回记录，统计、输出、断点都只由完成循环修改
//! 5. **可中断**：收到停止信号后 worker 做完手上的文档就退出，已完成的结果全部落盘
//!
//! ## 设计特点
//!
//! - **顶层编排**：不处理单个文档的细节，委托 `DocumentFlow`
//! - **顺序保证**：每个完成的文档依次执行 统计 → 输出 → 断点

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::clients::{DocumentStore, ExtractionModel};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::{DocumentRef, ExtractionRecord, RunStats};
use crate::services::{
    CheckpointEntry, CheckpointState, CheckpointStore, FileCheckpointStore, OutputStore,
    ProgressSnapshot, RateLimits, Reporter, ResultCodec, RetryExecutor, RetryOutcome,
};
use crate::utils::logging;
use crate::workflow::{DocumentCtx, DocumentFlow};

/// 一次运行的参数
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub folder_id: String,
    pub output_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub worker_count: usize,
    /// 为 false 时重置断点并清空输出
    pub resume: bool,
    /// 强制单 worker
    pub sequential: bool,
}

impl RunRequest {
    /// 以配置中的默认值构建
    pub fn from_config(config: &Config) -> Self {
        Self {
            folder_id: config.default_folder_id.clone(),
            output_path: PathBuf::from(&config.output_file),
            checkpoint_path: PathBuf::from(&config.checkpoint_file),
            worker_count: config.max_workers,
            resume: false,
            sequential: false,
        }
    }
}

/// 运行结果汇总
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub total: usize,
    pub processed: usize,
    pub success: usize,
    pub partial: usize,
    pub failed: usize,
    /// 从断点恢复、本次没有重新处理的文档数
    pub resumed: usize,
    /// 中断时还没有开始处理的文档数
    pub not_dispatched: usize,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub elapsed: Duration,
    pub interrupted: bool,
    pub snapshot: ProgressSnapshot,
}

impl RunSummary {
    fn from_stats(stats: &RunStats, snapshot: ProgressSnapshot, not_dispatched: usize, interrupted: bool) -> Self {
        Self {
            total: stats.total_documents,
            processed: stats.processed_count,
            success: stats.success_count,
            partial: stats.partial_count,
            failed: stats.failed_count,
            resumed: stats.resumed_count,
            not_dispatched,
            tokens_in: stats.tokens_in_total,
            tokens_out: stats.tokens_out_total,
            elapsed: stats.started_at.elapsed(),
            interrupted,
            snapshot,
        }
    }
}

/// 停止信号的发送端，可在其他任务（如 Ctrl-C 处理）中使用
///
/// 信号作用于当前（或下一次）运行，运行结束时自动清除。
#[derive(Clone)]
pub struct StopHandle(Arc<watch::Sender<bool>>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    fn clear(&self) {
        self.0.send_replace(false);
    }
}

/// 待派发队列中的一项：派发序号 + 文档
type Pending = Arc<Mutex<VecDeque<(usize, DocumentRef)>>>;

/// 批量处理器
pub struct BatchProcessor {
    config: Config,
    store: Arc<dyn DocumentStore>,
    model: Arc<dyn ExtractionModel>,
    codec: ResultCodec,
    retry: RetryExecutor,
    limits: RateLimits,
    reporter: Reporter,
    stop: StopHandle,
}

impl BatchProcessor {
    /// 创建处理器；`expected_field_count` 未配置时失败
    pub fn new(
        config: Config,
        store: Arc<dyn DocumentStore>,
        model: Arc<dyn ExtractionModel>,
    ) -> AppResult<Self> {
        let codec = ResultCodec::new(config.expected_fields()?);
        let retry = RetryExecutor::from_config(&config);
        let limits = RateLimits::from_config(&config);
        let reporter = Reporter::from_config(&config);
        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            store,
            model,
            codec,
            retry,
            limits,
            reporter,
            stop: StopHandle(Arc::new(stop_tx)),
        })
    }

    /// 替换重试执行器（测试中注入不等待的 sleeper）
    pub fn with_retry(mut self, retry: RetryExecutor) -> Self {
        self.retry = retry;
        self
    }

    /// 替换限速器
    pub fn with_rate_limits(mut self, limits: RateLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// 使用文件断点运行
    pub async fn run(&self, request: &RunRequest) -> AppResult<RunSummary> {
        let mut checkpoint =
            FileCheckpointStore::open(&request.checkpoint_path, self.config.checkpoint_flush_every);
        self.run_with(request, &mut checkpoint).await
    }

    /// 使用注入的断点存储运行
    pub async fn run_with(
        &self,
        request: &RunRequest,
        checkpoint: &mut dyn CheckpointStore,
    ) -> AppResult<RunSummary> {
        let result = self.run_once(request, checkpoint).await;
        self.stop.clear();
        result
    }

    async fn run_once(
        &self,
        request: &RunRequest,
        checkpoint: &mut dyn CheckpointStore,
    ) -> AppResult<RunSummary> {
        // ========== 1. 参数校验（派发之前） ==========
        let worker_count = if request.sequential {
            1
        } else {
            self.config.check_worker_count(request.worker_count)?
        };

        logging::log_run_start(request, worker_count);

        // ========== 2. 列出文档 ==========
        let documents = self.list_documents(&request.folder_id).await?;

        // ========== 3. 读取或重置断点 ==========
        let state = if request.resume {
            checkpoint.load().await?
        } else {
            checkpoint.reset().await?;
            CheckpointState::default()
        };

        let skip_ids = self.skip_ids(&state);
        let mut output = if request.resume {
            OutputStore::resume(&request.output_path, &skip_ids).await?
        } else {
            OutputStore::create(&request.output_path).await?
        };

        // ========== 4. 统计初始化，构建待处理队列 ==========
        let mut stats = RunStats::new(documents.len());
        let mut queue = VecDeque::new();
        for doc in documents {
            match state.entries.get(&doc.id).filter(|e| skip_ids.contains(&e.document_id)) {
                Some(entry) => {
                    stats.record_resumed(entry.read_status, entry.tokens_in, entry.tokens_out)
                }
                None => queue.push_back((queue.len() + 1, doc)),
            }
        }

        let pending_total = queue.len();
        logging::log_documents_loaded(stats.total_documents, stats.resumed_count, pending_total);

        if pending_total == 0 {
            checkpoint.close().await?;
            output.close().await?;
            let snapshot = self.reporter.snapshot(&stats);
            return Ok(RunSummary::from_stats(&stats, snapshot, 0, false));
        }

        // ========== 5. 启动 worker ==========
        let pending: Pending = Arc::new(Mutex::new(queue));
        let (tx, mut rx) = mpsc::channel::<ExtractionRecord>(worker_count * 2);
        let flow = Arc::new(DocumentFlow::new(
            self.store.clone(),
            self.model.clone(),
            self.codec.clone(),
            self.retry.clone(),
            self.limits.clone(),
        ));

        let mut workers = JoinSet::new();
        for worker_id in 1..=worker_count.min(pending_total) {
            workers.spawn(worker_loop(
                worker_id,
                pending_total,
                flow.clone(),
                pending.clone(),
                tx.clone(),
                self.stop.0.subscribe(),
            ));
        }
        drop(tx);

        // ========== 6. 完成循环（唯一写者） ==========
        let mut fatal: Option<AppError> = None;
        while let Some(record) = rx.recv().await {
            if let Err(e) = self
                .complete(&record, &mut stats, &mut output, checkpoint)
                .await
            {
                error!("❌ 写入结果失败，停止派发: {}", e);
                self.stop.stop();
                fatal = Some(e);
                break;
            }
        }
        drop(rx);

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("worker 异常退出: {}", e);
            }
        }

        let not_dispatched = pending.lock().await.len();
        let interrupted = self.stop.is_stopped();

        // ========== 7. 落盘并汇总 ==========
        if let Some(e) = fatal {
            if let Err(flush_err) = checkpoint.flush().await {
                warn!("⚠️ 断点落盘失败: {}", flush_err);
            }
            return Err(e);
        }

        checkpoint.close().await?;
        output.close().await?;

        if interrupted {
            warn!(
                "⏸️ 运行被中断: 已处理 {} 个, 未开始 {} 个（可使用 --resume 继续）",
                stats.processed_this_run(),
                not_dispatched
            );
        }

        let snapshot = self.reporter.snapshot(&stats);
        Ok(RunSummary::from_stats(&stats, snapshot, not_dispatched, interrupted))
    }

    /// 列出并去重；列表失败（重试后）是致命错误
    async fn list_documents(&self, folder_id: &str) -> AppResult<Vec<DocumentRef>> {
        info!("📁 正在列出文件夹 {} 中的文档...", folder_id);

        let listed = match self
            .retry
            .execute("list", |_| self.store.list_files(folder_id))
            .await
        {
            RetryOutcome::Completed { value, .. } => value,
            RetryOutcome::Failed { error, .. } => {
                return Err(AppError::Listing {
                    folder_id: folder_id.to_string(),
                    source: error,
                })
            }
        };

        let listed_count = listed.len();
        let mut seen = HashSet::new();
        let documents: Vec<DocumentRef> = listed
            .into_iter()
            .filter(|d| seen.insert(d.id.clone()))
            .collect();
        if documents.len() != listed_count {
            warn!("⚠️ 列表中有 {} 个重复文档，已去重", listed_count - documents.len());
        }
        Ok(documents)
    }

    /// 续跑时不再处理的文档：已完成的，以及（配置关闭重试时）永久失败的
    fn skip_ids(&self, state: &CheckpointState) -> HashSet<String> {
        state
            .entries
            .values()
            .filter(|e| e.is_done() || !self.config.retry_failed_on_resume)
            .map(|e| e.document_id.clone())
            .collect()
    }

    /// 处理一个完成的文档：统计 → 输出 → 断点
    async fn complete(
        &self,
        record: &ExtractionRecord,
        stats: &mut RunStats,
        output: &mut OutputStore,
        checkpoint: &mut dyn CheckpointStore,
    ) -> AppResult<()> {
        stats.record(record);
        output.append(record).await?;
        checkpoint
            .record_outcome(CheckpointEntry::from_record(record))
            .await?;

        let every = self.config.progress_log_every.max(1);
        if stats.processed_this_run() % every == 0 {
            logging::log_progress(stats, &self.reporter.snapshot(stats));
        }
        Ok(())
    }
}

/// worker：不断从队列取文档，直到队列为空、收到停止信号或完成循环退出
async fn worker_loop(
    worker_id: usize,
    pending_total: usize,
    flow: Arc<DocumentFlow>,
    pending: Pending,
    tx: mpsc::Sender<ExtractionRecord>,
    stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            debug!("[W{}] 收到停止信号，退出", worker_id);
            break;
        }

        let next = pending.lock().await.pop_front();
        let Some((sequence, doc)) = next else {
            break;
        };

        let ctx = DocumentCtx::new(worker_id, sequence, pending_total, doc.name.clone());
        let record = flow.run(&doc, &ctx).await;

        if tx.send(record).await.is_err() {
            break;
        }
    }
}
