use std::collections::VecDeque;
use std::time::Instant;

use crate::models::{ExtractionRecord, ReadStatus};

/// 最近完成时间窗口大小
const RECENT_WINDOW: usize = 100;

/// 运行统计，只由编排层的完成循环修改
#[derive(Debug, Clone)]
pub struct RunStats {
    pub total_documents: usize,
    pub processed_count: usize,
    pub success_count: usize,
    pub partial_count: usize,
    pub failed_count: usize,
    pub tokens_in_total: u64,
    pub tokens_out_total: u64,
    /// 启动时已从断点恢复的文档数，计入 processed 但不计入吞吐
    pub resumed_count: usize,
    pub started_at: Instant,
    pub recent_completions: VecDeque<Instant>,
}

impl RunStats {
    pub fn new(total_documents: usize) -> Self {
        Self {
            total_documents,
            processed_count: 0,
            success_count: 0,
            partial_count: 0,
            failed_count: 0,
            tokens_in_total: 0,
            tokens_out_total: 0,
            resumed_count: 0,
            started_at: Instant::now(),
            recent_completions: VecDeque::with_capacity(RECENT_WINDOW),
        }
    }

    /// 记录本次运行中完成的一个文档
    pub fn record(&mut self, record: &ExtractionRecord) {
        self.count(record.read_status, record.tokens_in, record.tokens_out);
        if self.recent_completions.len() == RECENT_WINDOW {
            self.recent_completions.pop_front();
        }
        self.recent_completions.push_back(Instant::now());
    }

    /// 记录一个从断点恢复的已完成文档
    pub fn record_resumed(&mut self, status: ReadStatus, tokens_in: u64, tokens_out: u64) {
        self.count(status, tokens_in, tokens_out);
        self.resumed_count += 1;
    }

    fn count(&mut self, status: ReadStatus, tokens_in: u64, tokens_out: u64) {
        self.processed_count += 1;
        match status {
            ReadStatus::Success => self.success_count += 1,
            ReadStatus::PartialSuccess => self.partial_count += 1,
            ReadStatus::Failed => self.failed_count += 1,
        }
        self.tokens_in_total += tokens_in;
        self.tokens_out_total += tokens_out;
    }

    /// 本次运行实际处理的文档数
    pub fn processed_this_run(&self) -> usize {
        self.processed_count - self.resumed_count
    }

    pub fn remaining(&self) -> usize {
        self.total_documents.saturating_sub(self.processed_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentRef;

    #[test]
    fn test_record_counts_by_status() {
        let doc = DocumentRef::new("1", "a.pdf", "application/pdf");
        let mut stats = RunStats::new(3);
        stats.record(&ExtractionRecord::failed(&doc, "x").with_tokens(10, 2));
        stats.record_resumed(ReadStatus::Success, 100, 20);

        assert_eq!(stats.processed_count, 2);
        assert_eq!(stats.failed_count, 1);
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.tokens_in_total, 110);
        assert_eq!(stats.processed_this_run(), 1);
        assert_eq!(stats.remaining(), 1);
        assert_eq!(stats.recent_completions.len(), 1);
    }

    #[test]
    fn test_recent_window_is_bounded() {
        let doc = DocumentRef::new("1", "a.pdf", "application/pdf");
        let mut stats = RunStats::new(500);
        for _ in 0..250 {
            stats.record(&ExtractionRecord::failed(&doc, "x"));
        }
        assert_eq!(stats.recent_completions.len(), RECENT_WINDOW);
    }
}
