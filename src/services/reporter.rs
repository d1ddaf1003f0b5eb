//! 进度与成本统计 - 业务能力层
//!
//! 只读地从 `RunStats` 推导吞吐、剩余时间和 token 成本，无副作用。

use std::time::Duration;

use crate::config::Config;
use crate::models::RunStats;

/// 某一时刻的进度快照
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    /// 本次运行的平均吞吐（文档/分钟）
    pub throughput_per_minute: Option<f64>,
    /// 最近完成窗口内的吞吐（文档/分钟）
    pub recent_throughput_per_minute: Option<f64>,
    pub eta: Option<Duration>,
    /// 按已处理文档的平均成本外推到全部文档（USD）
    pub estimated_cost: f64,
    /// 目前为止的实际成本（USD）
    pub current_cost: f64,
    pub completion_percentage: f64,
}

/// 进度与成本报告器
#[derive(Debug, Clone)]
pub struct Reporter {
    input_price_per_million: f64,
    output_price_per_million: f64,
    sampling_interval: Duration,
}

impl Default for Reporter {
    fn default() -> Self {
        Self {
            input_price_per_million: 3.0,
            output_price_per_million: 15.0,
            sampling_interval: Duration::from_secs(1),
        }
    }
}

impl Reporter {
    pub fn new(
        input_price_per_million: f64,
        output_price_per_million: f64,
        sampling_interval: Duration,
    ) -> Self {
        Self {
            input_price_per_million,
            output_price_per_million,
            sampling_interval,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.input_price_per_million,
            config.output_price_per_million,
            config.sampling_interval(),
        )
    }

    /// 以当前时间生成快照
    pub fn snapshot(&self, stats: &RunStats) -> ProgressSnapshot {
        let mut snapshot = self.snapshot_at(stats, stats.started_at.elapsed());
        snapshot.recent_throughput_per_minute = self.recent_throughput(stats);
        snapshot
    }

    /// 给定已用时间生成快照（纯函数，不含最近窗口吞吐）
    pub fn snapshot_at(&self, stats: &RunStats, elapsed: Duration) -> ProgressSnapshot {
        let throughput = if elapsed < self.sampling_interval || elapsed.is_zero() {
            None
        } else {
            let minutes = elapsed.as_secs_f64() / 60.0;
            Some(stats.processed_this_run() as f64 / minutes)
        };

        let remaining = stats.remaining();
        let eta = if remaining == 0 {
            Some(Duration::ZERO)
        } else {
            match throughput {
                Some(per_minute) if per_minute > 0.0 => Some(Duration::from_secs_f64(
                    remaining as f64 / per_minute * 60.0,
                )),
                _ => None,
            }
        };

        let current_cost = self.cost(stats.tokens_in_total, stats.tokens_out_total);
        let scale = stats.total_documents as f64 / stats.processed_count.max(1) as f64;

        let completion_percentage = if stats.total_documents == 0 {
            100.0
        } else {
            stats.processed_count as f64 / stats.total_documents as f64 * 100.0
        };

        ProgressSnapshot {
            throughput_per_minute: throughput,
            recent_throughput_per_minute: None,
            eta,
            estimated_cost: current_cost * scale,
            current_cost,
            completion_percentage,
        }
    }

    /// token 数换算成美元
    pub fn cost(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        (tokens_in as f64 * self.input_price_per_million
            + tokens_out as f64 * self.output_price_per_million)
            / 1_000_000.0
    }

    fn recent_throughput(&self, stats: &RunStats) -> Option<f64> {
        let first = stats.recent_completions.front()?;
        let last = stats.recent_completions.back()?;
        let span = last.duration_since(*first);
        if stats.recent_completions.len() < 2 || span < self.sampling_interval {
            return None;
        }
        let intervals = (stats.recent_completions.len() - 1) as f64;
        Some(intervals / (span.as_secs_f64() / 60.0))
    }
}

/// 把时长格式化为 `1h 02m 03s` 形式
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {:02}m {:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}
