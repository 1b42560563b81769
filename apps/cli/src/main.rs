//! # Fieldlink CLI
//!
//! 按 TOML 设备群描述运行驱动管理器。
//!
//! ```bash
//! # 只校验配置
//! fieldlink-cli run fleet.toml --check
//!
//! # 运行，Ctrl-C 退出（RUST_LOG=fieldlink_driver=debug 查看调度细节）
//! fieldlink-cli run fleet.toml --metrics-interval 10
//!
//! # 向设备发送一条指令并打印应答
//! fieldlink-cli send fleet.toml meter-1 read --payload 0102
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{RunCommand, SendCommand};

/// Fieldlink CLI - 设备群命令行工具
#[derive(Parser, Debug)]
#[command(name = "fieldlink-cli")]
#[command(about = "Run and probe fieldlink device fleets", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 打开设备群并持续运行
    Run {
        #[command(flatten)]
        args: RunCommand,
    },

    /// 发送单条指令
    Send {
        #[command(flatten)]
        args: SendCommand,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { args } => args.execute(),
        Commands::Send { args } => args.execute(),
    }
}
