//! # Taskgate Testing Utils
//!
//! 各 crate 测试共用的构建器、模拟执行器和策略闸门。
//!
//! ```toml
//! [dev-dependencies]
//! taskgate-testing-utils = { path = "../testing-utils" }
//! ```
//!
//! ```rust,ignore
//! use taskgate_testing_utils::{ScriptedExecutor, TaskBuilder};
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;

// 内存存储由基础设施层提供，这里只做转发
pub use taskgate_infrastructure::{
    InMemoryDeadLetterStore, InMemoryRetryQueue, InMemoryRouteHealthStore,
};
