use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use clap::{Parser, Subcommand};

use taskgate_core::{AppConfig, DeadLetterRecord, DeadLetterStore, RouteStatus, SystemClock};
use taskgate_dispatcher::RouteManager;
use taskgate_infrastructure::{JsonFileRouteHealthStore, JsonLinesDeadLetterStore};

/// CLI应用程序主结构
#[derive(Parser, Debug)]
#[command(name = "taskgate")]
#[command(version)]
#[command(about = "弹性任务分发核心 - 运维命令行工具")]
pub struct CliApp {
    #[command(subcommand)]
    pub command: Commands,

    /// 配置文件路径，不指定时按默认路径查找
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// 日志级别，覆盖配置文件
    #[arg(short, long, global = true, value_parser = ["trace", "debug", "info", "warn", "error"])]
    pub log_level: Option<String>,

    /// 日志格式，覆盖配置文件
    #[arg(long, global = true, value_parser = ["json", "pretty"])]
    pub log_format: Option<String>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// 查看死信日志
    DeadLetters {
        /// 只显示最近的N条
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// 以JSON输出
        #[arg(long)]
        json: bool,
    },
    /// 查看线路排序和健康状态
    Routes {
        /// 以JSON输出
        #[arg(long)]
        json: bool,
    },
    /// 打印生效的配置 (TOML)
    Config,
}

impl CliApp {
    pub async fn run(&self, config: &AppConfig) -> Result<String> {
        match &self.command {
            Commands::DeadLetters { limit, json } => {
                let store = JsonLinesDeadLetterStore::new(&config.storage.dead_letter_path);
                let records = store
                    .list()
                    .await
                    .with_context(|| format!("读取死信日志失败: {}", store.path().display()))?;
                let records = most_recent(records, *limit);
                if *json {
                    serde_json::to_string_pretty(&records).context("序列化死信记录失败")
                } else {
                    Ok(render_dead_letters(&records))
                }
            }
            Commands::Routes { json } => {
                let store = Arc::new(JsonFileRouteHealthStore::new(
                    &config.storage.route_health_path,
                ));
                let manager = RouteManager::from_settings(&config.routes, store, Arc::new(SystemClock))
                    .await
                    .context("加载线路健康文档失败")?;
                let statuses = manager.statuses().await;
                if *json {
                    serde_json::to_string_pretty(&statuses).context("序列化线路状态失败")
                } else {
                    Ok(render_routes(&statuses))
                }
            }
            Commands::Config => config.to_toml(),
        }
    }
}

fn most_recent(mut records: Vec<DeadLetterRecord>, limit: Option<usize>) -> Vec<DeadLetterRecord> {
    if let Some(limit) = limit {
        let skip = records.len().saturating_sub(limit);
        records.drain(..skip);
    }
    records
}

fn render_dead_letters(records: &[DeadLetterRecord]) -> String {
    if records.is_empty() {
        return "没有死信记录".to_string();
    }
    records
        .iter()
        .map(|r| {
            format!(
                "{}  {}  resource={}  attempts={}  {}",
                r.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
                r.task.id,
                r.task.resource_key,
                r.task.attempts,
                r.error
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_routes(statuses: &[RouteStatus]) -> String {
    if statuses.is_empty() {
        return "没有配置任何线路".to_string();
    }
    statuses
        .iter()
        .enumerate()
        .map(|(rank, s)| {
            let cooldown = match (s.cooling, s.health.cooldown_until) {
                (true, Some(until)) => {
                    format!("冷却至 {}", until.to_rfc3339_opts(SecondsFormat::Secs, true))
                }
                _ => "可用".to_string(),
            };
            format!(
                "{}. {}  weight={}  failures={}  {}",
                rank + 1,
                s.name,
                s.weight,
                s.health.failures,
                cooldown
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
