//! 任务执行器接口定义
//!
//! Worker由外部协作方提供，核心只通过 [`TaskExecutor`] 调用它。
//!
//! ## 约定
//!
//! - 执行可以挂起（I/O、远程调用），分发器在挂起期间不持有任何锁
//! - 核心不提供抢占式取消，超时由执行器自己实现并以 [`DispatchError::Timeout`](crate::DispatchError::Timeout) 报告
//! - 返回的错误决定后续的重试/死信决策，见 `taskgate_dispatcher::retry_service`
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use taskgate_core::{models::Task, traits::TaskExecutor, DispatchError, DispatchResult};
//!
//! pub struct SettlementWorker;
//!
//! #[async_trait]
//! impl TaskExecutor for SettlementWorker {
//!     async fn execute(&self, task: &Task) -> DispatchResult<serde_json::Value> {
//!         match tokio::time::timeout(std::time::Duration::from_secs(5), settle(task)).await {
//!             Ok(result) => result,
//!             Err(_) => Err(DispatchError::Timeout(format!("settle {}", task.id))),
//!         }
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::{models::Task, DispatchResult};

/// 任务执行器接口
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// 执行任务，失败时返回错误
    async fn execute(&self, task: &Task) -> DispatchResult<serde_json::Value>;
}
