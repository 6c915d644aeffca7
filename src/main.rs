// 主入口点 - 命令行应用入口
// Main entry point for the command-line application

use anyhow::Result;
use clap::Parser;

use platform_dispatch::commands::{self, Cli};
use platform_dispatch::{init_tracing, AppConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // .env 中的密钥（如 GOOGLE_ADS_DEVELOPER_TOKEN）优先加载
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    let level = if cli.verbose {
        "debug"
    } else {
        config.log_level.as_str()
    };
    init_tracing(level);
    tracing::info!("[App] platform-dispatch v{}", env!("CARGO_PKG_VERSION"));

    commands::run(cli, config).await
}
