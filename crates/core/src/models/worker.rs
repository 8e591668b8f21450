use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::capability::CapabilitySet;

/// Worker节点信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub capabilities: CapabilitySet,
    /// 当前正在处理的任务数
    pub workload: u32,
    pub completed: u64,
    pub failed: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

impl WorkerInfo {
    pub fn new(id: impl Into<String>, capabilities: CapabilitySet) -> Self {
        Self {
            id: id.into(),
            capabilities,
            workload: 0,
            completed: 0,
            failed: 0,
            last_success_at: None,
            last_failure_at: None,
            registered_at: Utc::now(),
        }
    }

    /// 检查Worker的能力集合是否覆盖任务所需能力
    pub fn can_accept(&self, required: &CapabilitySet) -> bool {
        required.is_subset(&self.capabilities)
    }
}
