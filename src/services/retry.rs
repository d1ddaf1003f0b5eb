//! 重试执行器 - 业务能力层
//!
//! 只负责"带退避地重试一个任务"能力，不持有任何共享可变状态，
//! 可以在多个 worker 中同时使用。
//!
//! ## 状态机
//!
//! ```text
//! Attempt(k) ──成功──────────────▶ Completed
//!     │
//!     ├──暂时性错误 且 k < max──▶ Retry(delay) ──sleep──▶ Attempt(k+1)
//!     ├──暂时性错误 且 k = max──▶ GiveUp(Exhausted)
//!     └──永久性错误────────────▶ GiveUp(Permanent)
//! ```
//!
//! 第 k 次失败后的等待时间：`min(max_delay, base_delay * 2^(k-1)) + jitter`，
//! jitter ∈ [0, base_delay)。

use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::TaskError;
use crate::models::{DocumentRef, ExtractionRecord};

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// 一次失败后的决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptDecision {
    Retry { next_attempt: u32, delay: Duration },
    GiveUp(GiveUpReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    /// 不可重试的错误
    Permanent,
    /// 达到最大尝试次数
    Exhausted,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.retry_attempts.max(1),
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
        }
    }

    /// 第 `attempt` 次（从 1 开始）失败后的退避时间，不含 jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// 第 `attempt` 次尝试失败后决定下一步
    pub fn decide(&self, attempt: u32, error: &TaskError, jitter: Duration) -> AttemptDecision {
        if !error.is_transient() {
            return AttemptDecision::GiveUp(GiveUpReason::Permanent);
        }
        if attempt >= self.max_attempts {
            return AttemptDecision::GiveUp(GiveUpReason::Exhausted);
        }

        let mut delay = self.backoff(attempt) + jitter;
        // 限流时至少等待服务端建议的时间
        if let Some(hint) = error.retry_after() {
            delay = delay.max(hint.min(self.max_delay));
        }
        AttemptDecision::Retry {
            next_attempt: attempt + 1,
            delay,
        }
    }
}

/// 等待能力，测试中替换为不真正等待的实现
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// 基于 tokio 定时器的等待
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// 重试结果
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Completed {
        value: T,
        attempts: u32,
    },
    Failed {
        error: TaskError,
        attempts: u32,
        reason: GiveUpReason,
    },
}

/// 重试执行器
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    attempt_timeout: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, attempt_timeout: Duration) -> Self {
        Self {
            policy,
            attempt_timeout,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(RetryPolicy::from_config(config), config.attempt_timeout())
    }

    /// 替换等待实现
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn jitter(&self) -> Duration {
        let base_ms = self.policy.base_delay.as_millis() as u64;
        if base_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..base_ms))
    }

    /// 执行任务直到成功、遇到永久错误或尝试次数耗尽
    ///
    /// 每次尝试都有超时限制，超时视为暂时性错误。
    pub async fn execute<T, F, Fut>(&self, label: &str, mut task: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.attempt_timeout, task(attempt)).await {
                Ok(result) => result,
                Err(_) => Err(TaskError::timeout(label, self.attempt_timeout)),
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("[{}] 第 {} 次尝试成功", label, attempt);
                    }
                    return RetryOutcome::Completed {
                        value,
                        attempts: attempt,
                    };
                }
                Err(error) => error,
            };

            match self.policy.decide(attempt, &error, self.jitter()) {
                AttemptDecision::Retry {
                    next_attempt,
                    delay,
                } => {
                    warn!(
                        "[{}] ⚠️ 第 {}/{} 次尝试失败: {}，{:.1}s 后重试",
                        label,
                        attempt,
                        self.policy.max_attempts,
                        error,
                        delay.as_secs_f64()
                    );
                    self.sleeper.sleep(delay).await;
                    attempt = next_attempt;
                }
                AttemptDecision::GiveUp(reason) => {
                    return RetryOutcome::Failed {
                        error,
                        attempts: attempt,
                        reason,
                    };
                }
            }
        }
    }

    /// 针对单个文档执行任务，失败时返回终态 `failed` 记录，不会向外抛错
    pub async fn run_with_retry<F, Fut>(&self, doc: &DocumentRef, task: F) -> ExtractionRecord
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<ExtractionRecord, TaskError>>,
    {
        match self.execute(&doc.name, task).await {
            RetryOutcome::Completed { value, .. } => value,
            RetryOutcome::Failed {
                error,
                attempts,
                reason: GiveUpReason::Exhausted,
            } => ExtractionRecord::failed(
                doc,
                format!("Retry exhausted after {} attempts: {}", attempts, error),
            ),
            RetryOutcome::Failed {
                error, attempts, ..
            } => ExtractionRecord::failed(
                doc,
                format!("Permanent error after {} attempt(s): {}", attempts, error),
            ),
        }
    }
}
