use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 单条线路的持久化健康状态
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHealth {
    pub failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl RouteHealth {
    pub fn is_cooling(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}

/// 线路名 -> 健康状态，整体作为一个文档持久化
pub type RouteHealthDocument = BTreeMap<String, RouteHealth>;

/// 线路定义（静态权重来自配置）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDefinition {
    pub name: String,
    pub weight: u32,
}

impl RouteDefinition {
    pub fn new(name: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// 对外暴露的线路状态快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteStatus {
    pub name: String,
    pub weight: u32,
    pub cooling: bool,
    #[serde(flatten)]
    pub health: RouteHealth,
}
