use anyhow::Result;
use clap::Parser;
use tracing::debug;

mod cli;
mod common;

use cli::CliApp;
use taskgate_infrastructure::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliApp::parse();
    let config = common::load_config(&cli)?;

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;
    debug!("执行命令: {:?}", cli.command);

    let output = cli.run(&config).await?;
    println!("{output}");
    Ok(())
}
