//! 分发核心的外部协作方实现：死信日志、线路健康文档、延迟重试队列，以及日志初始化。

pub mod dead_letter_store;
pub mod in_memory_queue;
pub mod observability;
pub mod route_health_store;

pub use dead_letter_store::{InMemoryDeadLetterStore, JsonLinesDeadLetterStore};
pub use in_memory_queue::InMemoryRetryQueue;
pub use observability::init_logging;
pub use route_health_store::{InMemoryRouteHealthStore, JsonFileRouteHealthStore};
