pub mod clock;
pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use errors::*;
pub use models::{
    Capability, CapabilityCatalog, CapabilitySet, DeadLetterRecord, FailureReason, Outcome,
    RouteDefinition, RouteHealth, RouteHealthDocument, RouteStatus, Task, WorkerInfo,
};
pub use traits::{
    AllowAllPolicy, DeadLetterStore, PolicyDecision, PolicyGate, RetryScheduler,
    RouteHealthStore, TaskExecutor,
};
