//! # 数据模型
//!
//! 分发核心的数据结构：任务、能力、Worker、死信记录、线路健康状态和分发结果。
//!
//! 所有模型都实现了序列化和反序列化；时间字段统一使用 `DateTime<Utc>`。

pub mod capability;
pub mod dead_letter;
pub mod outcome;
pub mod route;
pub mod task;
pub mod worker;

pub use capability::{Capability, CapabilityCatalog, CapabilitySet};
pub use dead_letter::DeadLetterRecord;
pub use outcome::{FailureReason, Outcome};
pub use route::{RouteDefinition, RouteHealth, RouteHealthDocument, RouteStatus};
pub use task::Task;
pub use worker::WorkerInfo;
