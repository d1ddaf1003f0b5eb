//! 应用入口 - 编排层
//!
//! ## 职责
//!
//! - 校验配置，创建云盘和模型客户端
//! - 把 Ctrl-C 接到处理器的停止信号上
//! - 运行结束后打印统计、按需导出 JSON 数组
//! - 提供 `status` / `export` 这类不需要外部服务的子命令

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::clients::{DriveClient, LlmClient};
use crate::config::Config;
use crate::orchestrator::{BatchProcessor, RunRequest, RunSummary};
use crate::services::output_store::export_json_array;
use crate::services::{CheckpointStore, FileCheckpointStore};
use crate::utils::logging;

/// 应用主结构
pub struct App {
    processor: BatchProcessor,
}

impl App {
    /// 初始化应用：校验配置和凭据，创建客户端
    pub fn initialize(config: Config) -> Result<Self> {
        config.validate().context("配置校验失败")?;
        config.validate_credentials().context("凭据校验失败")?;

        let store = DriveClient::new(&config).context("无法创建云盘客户端")?;
        let model = LlmClient::new(&config);
        let processor = BatchProcessor::new(config, Arc::new(store), Arc::new(model))?;

        Ok(Self { processor })
    }

    /// 运行一次批量提取
    pub async fn run(&self, request: &RunRequest, export_json: Option<&Path>) -> Result<RunSummary> {
        if request.folder_id.trim().is_empty() {
            anyhow::bail!("未指定文件夹 ID（--folder-id 或 DRIVE_FOLDER_ID）");
        }

        let stop = self.processor.stop_handle();
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("⏸️ 收到中断信号，等待进行中的文档完成...");
                stop.stop();
            }
        });

        let result = self.processor.run(request).await;
        ctrl_c.abort();
        let summary = result?;

        logging::print_final_stats(&summary);
        info!("💾 结果已保存至: {}", request.output_path.display());

        if let Some(json_path) = export_json {
            let count = export(&request.output_path, json_path).await?;
            info!("📤 已导出 {} 条记录到 {}", count, json_path.display());
        }

        Ok(summary)
    }
}

/// 打印断点状态：已完成数、失败文档及失败原因
pub async fn status(checkpoint_path: &Path) -> Result<()> {
    let mut store = FileCheckpointStore::open(checkpoint_path, 1);
    let state = store
        .load()
        .await
        .with_context(|| format!("无法读取断点 {}", checkpoint_path.display()))?;

    let failed = state.failed_entries();
    println!("断点文件: {}", checkpoint_path.display());
    println!("已完成: {}", state.done_ids().len());
    println!("永久失败: {}", failed.len());

    for entry in failed {
        println!(
            "  - {} (失败 {} 次, {}): {}",
            entry.document_id,
            entry.failures,
            entry.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            entry.last_error.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

/// 把 JSON Lines 输出导出为 JSON 数组
pub async fn export(input: &Path, output: &Path) -> Result<usize> {
    let count = export_json_array(input, output)
        .await
        .with_context(|| format!("导出 {} 失败", input.display()))?;
    Ok(count)
}

/// 导出文件的默认路径：把扩展名换成 `.json`
pub fn default_export_path(jsonl: &Path) -> PathBuf {
    jsonl.with_extension("json")
}
