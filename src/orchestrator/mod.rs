//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批量处理和流程调度，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `batch_processor` - 批量文档处理器
//! - 列出文档、读取断点、决定待处理集合
//! - 固定数量的 worker 并发处理（共享队列 + channel）
//! - 唯一写者：统计、输出文件、断点
//! - 停止信号与运行汇总
//!
//! ### `app` - 应用入口
//! - 校验配置、创建客户端
//! - Ctrl-C → 停止信号
//! - `status` / `export` 子命令
//!
//! ## 层次关系
//!
//! ```text
//! app (CLI 级别的装配)
//!     ↓
//! batch_processor (处理 Vec<DocumentRef>)
//!     ↓
//! workflow::DocumentFlow (处理单个文档)
//!     ↓
//! services (能力层：codec / retry / checkpoint / output / reporter)
//!     ↓
//! clients (外部服务：Drive / 模型)
//! ```

pub mod app;
pub mod batch_processor;

// 重新导出主要类型
pub use app::App;
pub use batch_processor::{BatchProcessor, RunRequest, RunSummary, StopHandle};
