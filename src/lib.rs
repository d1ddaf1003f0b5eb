//! # Rx Harvest
//!
//! 从云盘批量读取处方扫描件，调用文档理解模型提取结构化字段，
//! 并以可续跑的方式写入 JSON Lines 结果文件。
//!
//! ## 架构设计
//!
//! 本系统采用分层架构：
//!
//! ### ① 外部服务层（Clients）
//! - `clients/` - 只暴露能力，不做重试
//! - `DocumentStore` / `DriveClient` - 列出文档、下载内容
//! - `ExtractionModel` / `LlmClient` - 单次模型推理
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，只处理单个文档或单条记录
//! - `ResultCodec` - 解析模型响应并分类读取状态
//! - `RetryExecutor` - 带退避的重试状态机
//! - `CheckpointStore` / `OutputStore` - 断点与结果持久化
//! - `Reporter` - 吞吐、剩余时间、费用估算
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一个文档"的完整处理流程
//! - `DocumentFlow` - 下载 → 提取 → 解析，整体在重试执行器下运行
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/batch_processor` - 并发、断点续跑、唯一写者
//! - `orchestrator/app` - 配置校验、客户端装配、Ctrl-C
//!
//! ## 模块结构

pub mod clients;
pub mod config;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use clients::{DocumentStore, ExtractionModel, ModelOutput};
pub use config::Config;
pub use error::{AppError, AppResult, ConfigError, TaskError};
pub use models::{DocumentRef, ExtractionRecord, ReadStatus, RunStats};
pub use orchestrator::{App, BatchProcessor, RunRequest, RunSummary, StopHandle};
pub use workflow::{DocumentCtx, DocumentFlow};
