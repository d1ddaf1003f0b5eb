//! 文档处理上下文
//!
//! 封装"哪个 worker 正在处理第几个文档"这一信息，仅用于日志

use std::fmt::Display;

/// 文档处理上下文
#[derive(Debug, Clone)]
pub struct DocumentCtx {
    /// worker 编号（从 1 开始）
    pub worker_id: usize,

    /// 本次运行中派发的序号（从 1 开始）
    pub sequence: usize,

    /// 待处理文档总数
    pub pending_total: usize,

    pub document_name: String,
}

impl DocumentCtx {
    pub fn new(
        worker_id: usize,
        sequence: usize,
        pending_total: usize,
        document_name: impl Into<String>,
    ) -> Self {
        Self {
            worker_id,
            sequence,
            pending_total,
            document_name: document_name.into(),
        }
    }
}

impl Display for DocumentCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[W{} {}/{} doc {}]",
            self.worker_id, self.sequence, self.pending_total, self.document_name
        )
    }
}
