use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use rx_harvest::orchestrator::app;
use rx_harvest::utils::logging;
use rx_harvest::{App, Config, RunRequest};

/// 批量处方提取工具
#[derive(Parser, Debug)]
#[command(name = "rx-harvest", version, about = "Bulk prescription extraction from Google Drive")]
struct Cli {
    /// TOML 配置文件
    #[arg(long, global = true, env = "RX_HARVEST_CONFIG")]
    config: Option<PathBuf>,

    /// 显示详细日志
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 处理文件夹中的全部文档
    Run(RunArgs),
    /// 查看断点状态和失败文档
    Status {
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },
    /// 把 JSON Lines 结果导出为 JSON 数组
    Export {
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Google Drive 文件夹 ID
    #[arg(long)]
    folder_id: Option<String>,
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    /// 并发数
    #[arg(long)]
    workers: Option<usize>,
    /// 从断点继续
    #[arg(long)]
    resume: bool,
    /// 单 worker 顺序处理
    #[arg(long)]
    sequential: bool,
    /// 提取模板中期望的字段数
    #[arg(long)]
    expected_fields: Option<usize>,
    /// 运行结束后额外导出 JSON 数组
    #[arg(long)]
    export_json: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 加载配置
    let mut config = Config::load(cli.config.as_deref())?;
    if cli.verbose {
        config.verbose_logging = true;
    }

    // 初始化日志
    logging::init(config.verbose_logging);

    match cli.command {
        Command::Run(args) => {
            if let Some(n) = args.expected_fields {
                config.expected_field_count = Some(n);
            }

            let mut request = RunRequest::from_config(&config);
            if let Some(folder_id) = args.folder_id {
                request.folder_id = folder_id;
            }
            if let Some(output) = args.output {
                request.output_path = output;
            }
            if let Some(checkpoint) = args.checkpoint {
                request.checkpoint_path = checkpoint;
            }
            if let Some(workers) = args.workers {
                request.worker_count = workers;
            }
            request.resume = args.resume;
            request.sequential = args.sequential;

            let app = App::initialize(config)?;
            app.run(&request, args.export_json.as_deref()).await?;
        }
        Command::Status { checkpoint } => {
            let path = checkpoint.unwrap_or_else(|| PathBuf::from(&config.checkpoint_file));
            app::status(&path).await?;
        }
        Command::Export { input, output } => {
            let input = input.unwrap_or_else(|| PathBuf::from(&config.output_file));
            let output = output.unwrap_or_else(|| app::default_export_path(&input));
            let count = app::export(&input, &output).await?;
            println!("已导出 {} 条记录到 {}", count, output.display());
        }
    }

    Ok(())
}
