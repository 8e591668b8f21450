pub mod app_config;
pub mod dispatcher;
pub mod resilience;

pub use app_config::AppConfig;
pub use dispatcher::{
    DispatcherSettings, ObservabilityConfig, RateLimitEntry, RateLimiterSettings, StorageSettings,
};
pub use resilience::{CircuitBreakerSettings, RetrySettings, RouteEntry, RouteSettings};
