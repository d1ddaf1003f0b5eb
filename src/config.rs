use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// 程序配置
///
/// 加载顺序：默认值 → TOML 配置文件（可选）→ 环境变量 → 命令行参数（在 `main` 中覆盖）
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    // --- Google Drive 配置 ---
    pub drive_api_base_url: String,
    pub drive_access_token: String,
    pub default_folder_id: String,
    // --- 模型配置 ---
    pub llm_api_key: String,
    pub llm_api_base_url: String,
    pub llm_model_name: String,
    pub llm_max_tokens: u32,
    // --- 文件 ---
    pub output_file: String,
    pub checkpoint_file: String,
    // --- 并发 ---
    /// 默认并发数
    pub max_workers: usize,
    pub min_workers: usize,
    /// 并发数硬上限
    pub max_workers_limit: usize,
    // --- 断点 ---
    /// 每记录 N 个结果写一次断点文件
    pub checkpoint_flush_every: usize,
    /// 续跑时是否重新处理之前永久失败的文档
    pub retry_failed_on_resume: bool,
    // --- 重试 ---
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// 单次尝试（下载 + 推理）的超时时间
    pub attempt_timeout_secs: u64,
    /// 单个 HTTP 请求的超时时间
    pub request_timeout_secs: u64,
    // --- 限速（每分钟请求数，0 表示不限速）---
    pub drive_rate_limit_per_minute: usize,
    pub llm_rate_limit_per_minute: usize,
    // --- 提取 ---
    /// 提取模板中期望的字段数，必须配置
    pub expected_field_count: Option<usize>,
    // --- 费用与进度 ---
    pub input_price_per_million: f64,
    pub output_price_per_million: f64,
    pub progress_log_every: usize,
    pub sampling_interval_ms: u64,
    /// 是否显示详细日志
    pub verbose_logging: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            drive_api_base_url: "https://www.googleapis.com/drive/v3".to_string(),
            drive_access_token: String::new(),
            default_folder_id: String::new(),
            llm_api_key: String::new(),
            llm_api_base_url: "https://api.openai.com/v1".to_string(),
            llm_model_name: "gpt-4o".to_string(),
            llm_max_tokens: 8192,
            output_file: "extracted_prescriptions.jsonl".to_string(),
            checkpoint_file: "processing_checkpoint.json".to_string(),
            max_workers: 10,
            min_workers: 1,
            max_workers_limit: 50,
            checkpoint_flush_every: 100,
            retry_failed_on_resume: true,
            retry_attempts: 3,
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 60_000,
            attempt_timeout_secs: 300,
            request_timeout_secs: 120,
            drive_rate_limit_per_minute: 100,
            llm_rate_limit_per_minute: 50,
            expected_field_count: None,
            input_price_per_million: 3.0,
            output_price_per_million: 15.0,
            progress_log_every: 10,
            sampling_interval_ms: 1_000,
            verbose_logging: false,
        }
    }
}

impl Config {
    /// 加载配置：默认值，可选的 TOML 文件，再由环境变量覆盖
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(p) => Self::from_toml_file(p)?,
            None => Self::default(),
        };
        Ok(base.with_env())
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::File { reason, .. } => ConfigError::File {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::File {
            path: Default::default(),
            reason: e.to_string(),
        })
    }

    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// 用环境变量覆盖已有值；无法解析的值被忽略
    pub fn with_env(self) -> Self {
        Self {
            drive_api_base_url: env_string("DRIVE_API_BASE_URL").unwrap_or(self.drive_api_base_url),
            drive_access_token: env_string("DRIVE_ACCESS_TOKEN").unwrap_or(self.drive_access_token),
            default_folder_id: env_string("DRIVE_FOLDER_ID").unwrap_or(self.default_folder_id),
            llm_api_key: env_string("LLM_API_KEY").unwrap_or(self.llm_api_key),
            llm_api_base_url: env_string("LLM_API_BASE_URL").unwrap_or(self.llm_api_base_url),
            llm_model_name: env_string("LLM_MODEL_NAME").unwrap_or(self.llm_model_name),
            llm_max_tokens: env_parse("LLM_MAX_TOKENS").unwrap_or(self.llm_max_tokens),
            output_file: env_string("OUTPUT_FILE").unwrap_or(self.output_file),
            checkpoint_file: env_string("CHECKPOINT_FILE").unwrap_or(self.checkpoint_file),
            max_workers: env_parse("MAX_WORKERS").unwrap_or(self.max_workers),
            min_workers: self.min_workers,
            max_workers_limit: self.max_workers_limit,
            checkpoint_flush_every: env_parse("CHECKPOINT_FLUSH_EVERY")
                .unwrap_or(self.checkpoint_flush_every),
            retry_failed_on_resume: env_parse("RETRY_FAILED_ON_RESUME")
                .unwrap_or(self.retry_failed_on_resume),
            retry_attempts: env_parse("RETRY_ATTEMPTS").unwrap_or(self.retry_attempts),
            retry_base_delay_ms: env_parse("RETRY_BASE_DELAY_MS").unwrap_or(self.retry_base_delay_ms),
            retry_max_delay_ms: env_parse("RETRY_MAX_DELAY_MS").unwrap_or(self.retry_max_delay_ms),
            attempt_timeout_secs: env_parse("ATTEMPT_TIMEOUT_SECS")
                .unwrap_or(self.attempt_timeout_secs),
            request_timeout_secs: env_parse("REQUEST_TIMEOUT_SECS")
                .unwrap_or(self.request_timeout_secs),
            drive_rate_limit_per_minute: env_parse("DRIVE_RATE_LIMIT")
                .unwrap_or(self.drive_rate_limit_per_minute),
            llm_rate_limit_per_minute: env_parse("LLM_RATE_LIMIT")
                .unwrap_or(self.llm_rate_limit_per_minute),
            expected_field_count: env_parse("EXPECTED_FIELD_COUNT").or(self.expected_field_count),
            input_price_per_million: env_parse("INPUT_PRICE_PER_MILLION")
                .unwrap_or(self.input_price_per_million),
            output_price_per_million: env_parse("OUTPUT_PRICE_PER_MILLION")
                .unwrap_or(self.output_price_per_million),
            progress_log_every: env_parse("PROGRESS_LOG_EVERY").unwrap_or(self.progress_log_every),
            sampling_interval_ms: env_parse("SAMPLING_INTERVAL_MS")
                .unwrap_or(self.sampling_interval_ms),
            verbose_logging: env_parse("VERBOSE_LOGGING").unwrap_or(self.verbose_logging),
        }
    }

    /// 允许的并发数范围
    pub fn worker_bounds(&self) -> RangeInclusive<usize> {
        self.min_workers..=self.max_workers_limit
    }

    /// 检查并发数是否在允许范围内
    pub fn check_worker_count(&self, value: usize) -> Result<usize, ConfigError> {
        if self.worker_bounds().contains(&value) {
            Ok(value)
        } else {
            Err(ConfigError::WorkerCountOutOfRange {
                value,
                min: self.min_workers,
                max: self.max_workers_limit,
            })
        }
    }

    pub fn expected_fields(&self) -> Result<usize, ConfigError> {
        match self.expected_field_count {
            None => Err(ConfigError::MissingValue {
                key: "expected_field_count".into(),
            }),
            Some(0) => Err(ConfigError::invalid("expected_field_count", 0, "必须大于 0")),
            Some(n) => Ok(n),
        }
    }

    /// 校验与凭据无关的配置项
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.expected_fields()?;
        if self.min_workers == 0 {
            return Err(ConfigError::invalid("min_workers", 0, "必须大于 0"));
        }
        if self.min_workers > self.max_workers_limit {
            return Err(ConfigError::invalid(
                "min_workers",
                self.min_workers,
                format!("不能大于 max_workers_limit ({})", self.max_workers_limit),
            ));
        }
        self.check_worker_count(self.max_workers)?;
        if self.retry_attempts == 0 {
            return Err(ConfigError::invalid("retry_attempts", 0, "至少为 1"));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(ConfigError::invalid(
                "retry_base_delay_ms",
                self.retry_base_delay_ms,
                "不能大于 retry_max_delay_ms",
            ));
        }
        if self.checkpoint_flush_every == 0 {
            return Err(ConfigError::invalid("checkpoint_flush_every", 0, "至少为 1"));
        }
        if self.attempt_timeout_secs == 0 {
            return Err(ConfigError::invalid("attempt_timeout_secs", 0, "必须大于 0"));
        }
        Ok(())
    }

    /// 校验访问外部服务所需的凭据
    pub fn validate_credentials(&self) -> Result<(), ConfigError> {
        if self.drive_access_token.trim().is_empty() {
            return Err(ConfigError::MissingCredential {
                name: "DRIVE_ACCESS_TOKEN".into(),
            });
        }
        if self.llm_api_key.trim().is_empty() {
            return Err(ConfigError::MissingCredential {
                name: "LLM_API_KEY".into(),
            });
        }
        Ok(())
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.sampling_interval_ms)
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
