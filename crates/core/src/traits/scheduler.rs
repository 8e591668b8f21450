use std::time::Duration;

use async_trait::async_trait;

use crate::{models::Task, DispatchResult};

/// 策略闸门的判定结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub ok: bool,
    pub reason: Option<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

/// 外部策略闸门
///
/// 在触碰任何资源之前同步调用；拒绝时分发器直接返回 BLOCKED。
pub trait PolicyGate: Send + Sync {
    fn evaluate(&self, task: &Task) -> PolicyDecision;
}

/// 放行所有任务的默认闸门
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllPolicy;

impl PolicyGate for AllowAllPolicy {
    fn evaluate(&self, _task: &Task) -> PolicyDecision {
        PolicyDecision::allow()
    }
}

/// 重试调度器接口
///
/// 分发器从不同步重试，也不自己维护定时器；RETRY 决策连同任务一起交给调度器，
/// 由调度器在 `delay` 之后重新提交。
#[async_trait]
pub trait RetryScheduler: Send + Sync {
    async fn schedule(&self, task: Task, delay: Duration) -> DispatchResult<()>;
}
