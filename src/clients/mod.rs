//! 外部服务客户端
//!
//! 编排层只依赖这里的两个 trait，生产环境注入 HTTP 实现，测试注入内存实现。

pub mod drive_client;
pub mod llm_client;

use async_trait::async_trait;

use crate::error::TaskError;
use crate::models::DocumentRef;

pub use drive_client::DriveClient;
pub use llm_client::LlmClient;

/// 文档存储（云盘）
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// 列出文件夹中的全部文档
    async fn list_files(&self, folder_id: &str) -> Result<Vec<DocumentRef>, TaskError>;

    /// 下载文档内容
    async fn fetch_content(&self, doc: &DocumentRef) -> Result<Vec<u8>, TaskError>;
}

/// 模型的原始输出
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelOutput {
    pub raw_text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// 文档理解模型
#[async_trait]
pub trait ExtractionModel: Send + Sync {
    async fn extract(
        &self,
        doc: &DocumentRef,
        content: &[u8],
        prompt: &str,
    ) -> Result<ModelOutput, TaskError>;
}
