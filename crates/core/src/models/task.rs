use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::capability::CapabilitySet;

/// 任务定义
///
/// 表示一次提交给分发核心的工作单元。核心不解释 `payload`，只负责准入、限流、重试和路由。
///
/// # 字段说明
///
/// - `id`: 任务的唯一标识符，调用方提供或由 [`Task::new`] 生成
/// - `required_capabilities`: 执行该任务所需的能力集合
/// - `resource_key`: 限流桶（以及可选的熔断器）的键
/// - `payload`: 任务数据，对核心不透明
/// - `attempts`: 已失败的执行次数，从0开始，每次失败决策时递增
/// - `submitted_at`: 首次提交时间
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub required_capabilities: CapabilitySet,
    pub resource_key: String,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub submitted_at: DateTime<Utc>,
}

impl Task {
    /// 创建新任务，id 使用 UUID v4
    pub fn new(
        required_capabilities: CapabilitySet,
        resource_key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::with_id(
            uuid::Uuid::new_v4().to_string(),
            required_capabilities,
            resource_key,
            payload,
        )
    }

    pub fn with_id(
        id: impl Into<String>,
        required_capabilities: CapabilitySet,
        resource_key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            required_capabilities,
            resource_key: resource_key.into(),
            payload,
            attempts: 0,
            submitted_at: Utc::now(),
        }
    }
}
