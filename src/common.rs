use anyhow::{Context, Result};
use taskgate_core::AppConfig;

use crate::cli::CliApp;

/// 加载配置并应用命令行覆盖
pub fn load_config(cli: &CliApp) -> Result<AppConfig> {
    let mut config = match cli.config.as_deref() {
        Some(path) => {
            AppConfig::load(Some(path)).with_context(|| format!("加载配置文件失败: {path}"))?
        }
        None => AppConfig::load(None).context("加载默认配置失败")?,
    };

    if let Some(level) = &cli.log_level {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.observability.log_format = format.clone();
    }

    Ok(config)
}
