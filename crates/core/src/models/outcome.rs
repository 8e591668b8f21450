use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 一次提交的最终结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// 策略闸门拒绝，没有产生任何副作用
    Blocked { reason: String },
    Completed {
        worker_id: String,
        result: serde_json::Value,
    },
    /// 准入被拒，`retry_after` 为建议的重新提交间隔
    RateLimited { retry_after: Duration },
    /// 已交给重试调度器，`delay` 后重新提交
    Retrying { delay: Duration, attempts: u32 },
    DeadLettered { error: String },
    Failed(FailureReason),
}

/// FAILED 结果的原因
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    NoWorkerAvailable,
    /// 熔断短路，任务没有被执行
    CircuitOpen {
        operation: String,
        retry_after: Duration,
    },
    Aborted { error: String },
}

impl Outcome {
    /// 用作指标标签
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Blocked { .. } => "blocked",
            Outcome::Completed { .. } => "completed",
            Outcome::RateLimited { .. } => "rate_limited",
            Outcome::Retrying { .. } => "retrying",
            Outcome::DeadLettered { .. } => "dead_lettered",
            Outcome::Failed(_) => "failed",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed { .. })
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NoWorkerAvailable => f.write_str("no agent available"),
            FailureReason::CircuitOpen { operation, .. } => write!(f, "circuit open: {operation}"),
            FailureReason::Aborted { error } => write!(f, "aborted: {error}"),
        }
    }
}
