use serde::Serialize;

use taskgate_core::{RouteStatus, WorkerInfo};

use crate::{circuit_breaker::CircuitSnapshot, rate_limiter::BucketSnapshot};

/// 分发器的只读状态快照
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatus {
    pub strategy: String,
    pub circuits: Vec<CircuitSnapshot>,
    pub buckets: Vec<BucketSnapshot>,
    /// 未配置线路管理器时为空
    pub routes: Vec<RouteStatus>,
    pub workers: Vec<WorkerInfo>,
}

impl DispatcherStatus {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
