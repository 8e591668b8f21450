use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::Task;

/// 死信记录
///
/// 写入后不可变，死信存储只追加。`task.attempts` 为最终失败次数。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub task: Task,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(task: Task, error: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            task,
            error: error.into(),
            timestamp,
        }
    }
}
