//! 请求限速 - 业务能力层
//!
//! ## 职责
//!
//! 每个外部服务（云盘、模型）一个滑动窗口限速器，由所有 worker 共享：
//! - 窗口（60 秒）内的请求数达到上限时，`acquire` 等到最早的请求滑出窗口
//! - 服务端返回限流并给出等待时间时，`set_backoff` 让所有 worker 一起暂停
//!
//! 限速和重试是两回事：限速控制发出请求的速率，重试处理已经失败的请求。

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::config::Config;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct WindowState {
    requests: VecDeque<Instant>,
    backoff_until: Option<Instant>,
}

/// 滑动窗口限速器；`max_per_window == 0` 表示不限速
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    max_per_window: usize,
    window: Duration,
    state: Mutex<WindowState>,
}

impl RateLimiter {
    pub fn per_minute(name: impl Into<String>, max_requests: usize) -> Self {
        Self {
            name: name.into(),
            max_per_window: max_requests,
            window: WINDOW,
            state: Mutex::new(WindowState::default()),
        }
    }

    pub fn unlimited(name: impl Into<String>) -> Self {
        Self::per_minute(name, 0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_per_window == 0
    }

    /// 等到可以发出下一个请求，并把这次请求记入窗口
    ///
    /// 等待期间持有锁，排队的调用方按到达顺序依次放行。
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;

        if let Some(until) = state.backoff_until.take() {
            if until > Instant::now() {
                debug!("[{}] 限流退避中，等待 {:?}", self.name, until - Instant::now());
                sleep_until(until).await;
            }
        }

        if self.is_unlimited() {
            return;
        }

        let now = Instant::now();
        prune(&mut state.requests, now, self.window);

        if state.requests.len() >= self.max_per_window {
            if let Some(&oldest) = state.requests.front() {
                let ready_at = oldest + self.window;
                debug!(
                    "[{}] 达到 {} 次/分钟上限，等待 {:?}",
                    self.name,
                    self.max_per_window,
                    ready_at.saturating_duration_since(now)
                );
                sleep_until(ready_at).await;
                prune(&mut state.requests, Instant::now(), self.window);
            }
        }

        state.requests.push_back(Instant::now());
    }

    /// 服务端要求等待时，暂停后续所有请求；已有更晚的退避时间时保留较晚者
    pub async fn set_backoff(&self, wait: Duration) {
        let until = Instant::now() + wait;
        let mut state = self.state.lock().await;
        if state.backoff_until.map_or(true, |current| current < until) {
            state.backoff_until = Some(until);
        }
    }

    pub async fn clear_backoff(&self) {
        self.state.lock().await.backoff_until = None;
    }

    /// 当前窗口内已记录的请求数
    pub async fn in_window(&self) -> usize {
        let mut state = self.state.lock().await;
        prune(&mut state.requests, Instant::now(), self.window);
        state.requests.len()
    }
}

fn prune(requests: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&front) = requests.front() {
        if now.saturating_duration_since(front) >= window {
            requests.pop_front();
        } else {
            break;
        }
    }
}

/// 各外部服务的限速器
#[derive(Debug, Clone)]
pub struct RateLimits {
    pub drive: Arc<RateLimiter>,
    pub model: Arc<RateLimiter>,
}

impl RateLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            drive: Arc::new(RateLimiter::per_minute(
                "drive",
                config.drive_rate_limit_per_minute,
            )),
            model: Arc::new(RateLimiter::per_minute(
                "model",
                config.llm_rate_limit_per_minute,
            )),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            drive: Arc::new(RateLimiter::unlimited("drive")),
            model: Arc::new(RateLimiter::unlimited("model")),
        }
    }
}
