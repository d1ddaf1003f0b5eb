use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// 应用程序致命错误（整次运行级别）
///
/// 单个文档的失败不会走到这里，会被转换成 `failed` 记录。
#[derive(Debug, Error)]
pub enum AppError {
    /// 配置错误，派发前快速失败
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    /// 断点文件损坏，交给操作员处理
    #[error("断点文件损坏 ({path}): {reason}")]
    CorruptCheckpoint { path: PathBuf, reason: String },

    /// 断点文件读写失败
    #[error("断点错误: {0}")]
    Checkpoint(CheckpointError),

    /// 输出文件读写失败
    #[error("输出文件错误 ({path}): {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 列出文档失败（重试耗尽或永久错误），无法开始运行
    #[error("无法列出文件夹 {folder_id} 中的文档: {source}")]
    Listing {
        folder_id: String,
        #[source]
        source: TaskError,
    },

    #[error("序列化失败: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<CheckpointError> for AppError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::Corrupt { path, reason } => AppError::CorruptCheckpoint { path, reason },
            other => AppError::Checkpoint(other),
        }
    }
}

impl AppError {
    /// 创建输出文件错误
    pub fn output(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AppError::Output {
            path: path.into(),
            source,
        }
    }
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 并发数超出允许范围
    #[error("并发数 {value} 超出允许范围 [{min}, {max}]")]
    WorkerCountOutOfRange { value: usize, min: usize, max: usize },

    /// 缺少凭据
    #[error("缺少凭据: {name}")]
    MissingCredential { name: String },

    /// 缺少必填配置项
    #[error("缺少必填配置项: {key}")]
    MissingValue { key: String },

    /// 配置值非法
    #[error("配置项 {key} 的值 '{value}' 非法: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    /// 配置文件读取或解析失败
    #[error("配置文件 {path} 加载失败: {reason}")]
    File { path: PathBuf, reason: String },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, value: impl ToString, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.into(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// 断点存储错误
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("断点文件损坏 ({path}): {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("断点文件读写失败 ({path}): {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("断点序列化失败: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CheckpointError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CheckpointError::Io {
            path: path.into(),
            source,
        }
    }
}

/// 单个文档任务的错误：可重试 / 不可重试
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("暂时性错误: {0}")]
    Transient(#[from] TransientError),

    #[error("永久性错误: {0}")]
    Permanent(#[from] PermanentError),
}

impl TaskError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TaskError::Transient(_))
    }

    /// 服务端给出的建议等待时间（仅限流错误）
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TaskError::Transient(TransientError::RateLimited { retry_after, .. }) => *retry_after,
            _ => None,
        }
    }

    pub fn rate_limited(service: impl Into<String>, retry_after: Option<Duration>) -> Self {
        TransientError::RateLimited {
            service: service.into(),
            retry_after,
        }
        .into()
    }

    pub fn timeout(service: impl Into<String>, after: Duration) -> Self {
        TransientError::Timeout {
            service: service.into(),
            after,
        }
        .into()
    }

    pub fn network(service: impl Into<String>, message: impl Into<String>) -> Self {
        TransientError::Network {
            service: service.into(),
            message: message.into(),
        }
        .into()
    }

    pub fn server(service: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        TransientError::Server {
            service: service.into(),
            status,
            message: message.into(),
        }
        .into()
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        PermanentError::NotFound { id: id.into() }.into()
    }

    pub fn unauthorized(service: impl Into<String>, message: impl Into<String>) -> Self {
        PermanentError::Unauthorized {
            service: service.into(),
            message: message.into(),
        }
        .into()
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        PermanentError::InvalidInput(message.into()).into()
    }
}

/// 可重试错误：限流、超时、网络、5xx
#[derive(Debug, Clone, Error)]
pub enum TransientError {
    #[error("{service} 请求频率限制, 建议等待: {retry_after:?}")]
    RateLimited {
        service: String,
        retry_after: Option<Duration>,
    },

    #[error("{service} 请求超时 ({after:?})")]
    Timeout { service: String, after: Duration },

    #[error("{service} 网络错误: {message}")]
    Network { service: String, message: String },

    #[error("{service} 服务端错误 {status}: {message}")]
    Server {
        service: String,
        status: u16,
        message: String,
    },
}

/// 不可重试错误：文档不存在、凭据失效、输入非法、响应无法解析
#[derive(Debug, Clone, Error)]
pub enum PermanentError {
    #[error("文档不存在: {id}")]
    NotFound { id: String },

    #[error("{service} 认证失败: {message}")]
    Unauthorized { service: String, message: String },

    #[error("输入非法: {0}")]
    InvalidInput(String),

    #[error("模型响应无法解析: {0}")]
    MalformedResponse(String),
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
