//! 弹性任务分发核心
//!
//! 限流、熔断、失败分类与重试、能力匹配分配、线路故障转移，以及把它们串起来的 [`Dispatcher`]。
//! 所有键控状态都保存在显式传入的注册表对象里，没有进程级全局状态。

pub mod circuit_breaker;
pub mod dispatcher;
pub mod rate_limiter;
pub mod retry_service;
pub mod route_manager;
pub mod status;
pub mod strategies;
pub mod worker_registry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};
pub use dispatcher::{CircuitScope, Dispatcher, DispatcherBuilder};
pub use rate_limiter::{Admission, BucketSnapshot, RateLimiter, RateLimiterConfig};
pub use retry_service::{
    FailureClass, FailureClassifier, RetryConfig, RetryDecision, RetryService, TaskRetryService,
};
pub use route_manager::{AvailableRoutes, RouteManager, RouteManagerConfig, RouteSelection};
pub use status::DispatcherStatus;
pub use strategies::{LoadBasedStrategy, RoundRobinStrategy, TaskDispatchStrategy};
pub use worker_registry::{Assignment, WorkerRegistry, WorkloadGuard};
