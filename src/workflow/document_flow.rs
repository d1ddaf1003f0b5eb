//! 文档处理流程 - 流程层
//!
//! 核心职责：定义"一个文档"的完整处理流程
//!
//! 流程顺序（整体在 `RetryExecutor` 下执行，每次尝试都重新下载）：
//! 1. 从云盘下载文档内容
//! 2. 调用模型提取
//! 3. 解析模型响应，分类读取状态
//!
//! 每次调用云盘或模型之前先经过对应服务的共享限速器。

use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clients::{DocumentStore, ExtractionModel};
use crate::error::TaskError;
use crate::models::{DocumentRef, ExtractionRecord, ReadStatus};
use crate::services::prompts::extraction_prompt_for;
use crate::services::{RateLimiter, RateLimits, ResultCodec, RetryExecutor};
use crate::workflow::DocumentCtx;

/// 文档处理流程
///
/// - 编排单个文档的下载、提取、解析
/// - 不持有共享可变状态，可被多个 worker 同时使用
/// - 永远返回一条记录，失败时为 `failed` 记录
pub struct DocumentFlow {
    store: Arc<dyn DocumentStore>,
    model: Arc<dyn ExtractionModel>,
    codec: ResultCodec,
    retry: RetryExecutor,
    limits: RateLimits,
}

impl DocumentFlow {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        model: Arc<dyn ExtractionModel>,
        codec: ResultCodec,
        retry: RetryExecutor,
        limits: RateLimits,
    ) -> Self {
        Self {
            store,
            model,
            codec,
            retry,
            limits,
        }
    }

    pub async fn run(&self, doc: &DocumentRef, ctx: &DocumentCtx) -> ExtractionRecord {
        let prompt = extraction_prompt_for(&doc.name);
        let prompt = prompt.as_str();

        let record = self
            .retry
            .run_with_retry(doc, |attempt| self.attempt(doc, prompt, attempt, ctx))
            .await;

        match record.read_status {
            ReadStatus::Success => info!(
                "{} ✅ 提取成功 ({} 个字段)",
                ctx,
                record.fields.extracted_count()
            ),
            ReadStatus::PartialSuccess => info!(
                "{} ⚠️ 部分成功 ({}/{} 个字段)",
                ctx,
                record.fields.extracted_count(),
                self.codec.expected_field_count()
            ),
            ReadStatus::Failed => warn!("{} ❌ 提取失败: {}", ctx, record.comment),
        }
        record
    }

    async fn attempt(
        &self,
        doc: &DocumentRef,
        prompt: &str,
        attempt: u32,
        ctx: &DocumentCtx,
    ) -> Result<ExtractionRecord, TaskError> {
        if attempt > 1 {
            info!("{} 🔄 第 {} 次尝试", ctx, attempt);
        }

        let content = throttled(&self.limits.drive, self.store.fetch_content(doc)).await?;
        let output =
            throttled(&self.limits.model, self.model.extract(doc, &content, prompt)).await?;
        Ok(self
            .codec
            .parse(doc, &output.raw_text, output.tokens_in, output.tokens_out))
    }
}

/// 限速后发出请求；服务端给出等待时间时让同一服务的所有请求一起退避
async fn throttled<T, Fut>(limiter: &RateLimiter, call: Fut) -> Result<T, TaskError>
where
    Fut: Future<Output = Result<T, TaskError>>,
{
    limiter.acquire().await;
    let result = call.await;
    if let Some(wait) = result.as_ref().err().and_then(TaskError::retry_after) {
        limiter.set_backoff(wait).await;
    }
    result
}
