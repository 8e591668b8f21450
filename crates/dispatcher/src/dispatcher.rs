//! 分发器
//!
//! 单次提交的流程：
//!
//! 1. 策略闸门，拒绝时直接返回 BLOCKED，不产生任何副作用
//! 2. 按能力分配Worker，没有合格Worker时返回 FAILED
//! 3. 按 `resource_key` 准入，拒绝时返回 RATE_LIMITED 和建议等待时间
//! 4. 在熔断器保护下执行；成功返回 COMPLETED，失败交给重试服务决策
//!
//! 分发器从不同步重试：RETRY 决策交给 [`RetryScheduler`]，由它在延迟之后重新提交。
//! Worker负载在任何一个分配之后的返回路径上都会被归还，提交被中途取消时也一样。

use std::sync::Arc;

use tracing::{debug, info, warn};

use taskgate_core::{
    AllowAllPolicy, AppConfig, CapabilityCatalog, Clock, DeadLetterStore, DispatchError,
    DispatchResult, FailureReason, Outcome, PolicyGate, RetryScheduler, RouteHealthStore,
    SystemClock, Task, TaskExecutor,
};

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig},
    rate_limiter::{Admission, RateLimiter, RateLimiterConfig},
    retry_service::{FailureClassifier, RetryConfig, RetryDecision, RetryService, TaskRetryService},
    route_manager::RouteManager,
    status::DispatcherStatus,
    strategies::strategy_from_name,
    worker_registry::{WorkerRegistry, WorkloadGuard},
};

/// 熔断器按什么粒度划分
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitScope {
    /// 每个 `resource_key` 一个熔断器
    Resource,
    Worker,
    /// `worker:resource`
    WorkerResource,
}

impl CircuitScope {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "resource" => Some(Self::Resource),
            "worker" => Some(Self::Worker),
            "worker_resource" => Some(Self::WorkerResource),
            _ => None,
        }
    }

    pub fn operation(&self, worker_id: &str, resource_key: &str) -> String {
        match self {
            Self::Resource => resource_key.to_string(),
            Self::Worker => worker_id.to_string(),
            Self::WorkerResource => format!("{worker_id}:{resource_key}"),
        }
    }
}

pub struct Dispatcher {
    policy: Arc<dyn PolicyGate>,
    registry: Arc<WorkerRegistry>,
    rate_limiter: Arc<RateLimiter>,
    circuit_breaker: Arc<CircuitBreaker>,
    retry_service: Arc<dyn RetryService>,
    retry_scheduler: Arc<dyn RetryScheduler>,
    routes: Option<Arc<RouteManager>>,
    circuit_scope: CircuitScope,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    pub fn builder(config: AppConfig) -> DispatcherBuilder {
        DispatcherBuilder::new(config)
    }

    /// 提交任务并返回本次提交的结果
    ///
    /// 只有基础设施故障（死信写入失败、重试调度失败、未声明的能力标签）才会返回 `Err`，
    /// 任务本身的失败都体现在 [`Outcome`] 里。
    pub async fn submit(&self, mut task: Task) -> DispatchResult<Outcome> {
        let decision = self.policy.evaluate(&task);
        if !decision.ok {
            let reason = decision
                .reason
                .unwrap_or_else(|| "policy denied".to_string());
            return Ok(self.finish(&task, Outcome::Blocked { reason }));
        }

        let Some(assignment) = self.registry.assign(&task).await? else {
            return Ok(self.finish(&task, Outcome::Failed(FailureReason::NoWorkerAvailable)));
        };
        let worker_id = assignment.worker_id;
        let workload = WorkloadGuard::new(Arc::clone(&self.registry), worker_id.clone());

        if let Admission::Denied { retry_after } = self.rate_limiter.admit(&task.resource_key).await
        {
            workload.release().await;
            return Ok(self.finish(&task, Outcome::RateLimited { retry_after }));
        }

        let operation = self.circuit_scope.operation(&worker_id, &task.resource_key);
        debug!(
            "任务 {} 分配给Worker {}，熔断操作: {}",
            task.id, worker_id, operation
        );

        let executor = assignment.executor;
        let task_ref = &task;
        let result = self
            .circuit_breaker
            .call(&operation, || executor.execute(task_ref))
            .await;

        let error = match result {
            Ok(value) => {
                self.rate_limiter.report_success(&task.resource_key).await;
                self.registry
                    .record_success(&worker_id, self.clock.now())
                    .await;
                workload.release().await;
                return Ok(self.finish(
                    &task,
                    Outcome::Completed {
                        worker_id,
                        result: value,
                    },
                ));
            }
            Err(DispatchError::CircuitOpen {
                operation,
                retry_after,
            }) => {
                workload.release().await;
                return Ok(self.finish(
                    &task,
                    Outcome::Failed(FailureReason::CircuitOpen {
                        operation,
                        retry_after,
                    }),
                ));
            }
            Err(error) => error,
        };

        self.rate_limiter
            .report_failure(&task.resource_key, error.is_throttle())
            .await;
        self.registry
            .record_failure(&worker_id, self.clock.now())
            .await;
        workload.release().await;

        // 死信写入是该任务生命周期内的最后一次修改
        let outcome = match self.retry_service.decide(&mut task, &error).await? {
            RetryDecision::Retry { delay } => {
                self.retry_scheduler.schedule(task.clone(), delay).await?;
                Outcome::Retrying {
                    delay,
                    attempts: task.attempts,
                }
            }
            RetryDecision::DeadLetter => Outcome::DeadLettered {
                error: error.to_string(),
            },
            RetryDecision::Abort => Outcome::Failed(FailureReason::Aborted {
                error: error.to_string(),
            }),
        };
        Ok(self.finish(&task, outcome))
    }

    /// 并发提交一批任务，结果顺序与输入一致
    ///
    /// 不同资源键之间互不阻塞；同一资源键的准入和熔断检查仍按键串行。
    pub async fn submit_batch(&self, tasks: Vec<Task>) -> Vec<DispatchResult<Outcome>> {
        futures::future::join_all(tasks.into_iter().map(|task| self.submit(task))).await
    }

    fn finish(&self, task: &Task, outcome: Outcome) -> Outcome {
        metrics::counter!("taskgate_dispatch_outcomes_total", "outcome" => outcome.label())
            .increment(1);
        match &outcome {
            Outcome::Completed { worker_id, .. } => {
                info!("任务 {} 由Worker {} 完成", task.id, worker_id)
            }
            Outcome::Blocked { reason } => info!("任务 {} 被策略拒绝: {}", task.id, reason),
            Outcome::RateLimited { retry_after } => {
                debug!("任务 {} 被限流，建议 {:?} 后重试", task.id, retry_after)
            }
            Outcome::Retrying { delay, attempts } => {
                info!("任务 {} 第 {} 次失败，{:?} 后重试", task.id, attempts, delay)
            }
            Outcome::DeadLettered { error } => warn!("任务 {} 进入死信: {}", task.id, error),
            Outcome::Failed(reason) => warn!("任务 {} 失败: {}", task.id, reason),
        }
        outcome
    }

    pub async fn register_worker<I, S>(
        &self,
        worker_id: impl Into<String>,
        capabilities: I,
        executor: Arc<dyn TaskExecutor>,
    ) -> DispatchResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.registry
            .register(worker_id, capabilities, executor)
            .await
    }

    pub async fn register_limit(
        &self,
        resource_key: &str,
        max_tokens: f64,
        refill_rate_per_second: f64,
    ) -> DispatchResult<()> {
        self.rate_limiter
            .register_limit(resource_key, max_tokens, refill_rate_per_second)
            .await
    }

    pub fn catalog(&self) -> &CapabilityCatalog {
        self.registry.catalog()
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.circuit_breaker
    }

    pub fn routes(&self) -> Option<&Arc<RouteManager>> {
        self.routes.as_ref()
    }

    pub async fn status(&self) -> DispatcherStatus {
        let routes = match &self.routes {
            Some(routes) => routes.statuses().await,
            None => Vec::new(),
        };
        DispatcherStatus {
            strategy: self.registry.strategy_name().to_string(),
            circuits: self.circuit_breaker.snapshot().await,
            buckets: self.rate_limiter.snapshot().await,
            routes,
            workers: self.registry.workers().await,
        }
    }
}

/// 分发器构建器
///
/// 死信存储和重试调度器必须提供；线路健康存储可选，提供时才会创建线路管理器。
pub struct DispatcherBuilder {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    policy: Arc<dyn PolicyGate>,
    classifier: FailureClassifier,
    dead_letters: Option<Arc<dyn DeadLetterStore>>,
    retry_scheduler: Option<Arc<dyn RetryScheduler>>,
    route_health: Option<Arc<dyn RouteHealthStore>>,
}

impl DispatcherBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            policy: Arc::new(AllowAllPolicy),
            classifier: FailureClassifier::default(),
            dead_letters: None,
            retry_scheduler: None,
            route_health: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(mut self, policy: Arc<dyn PolicyGate>) -> Self {
        self.policy = policy;
        self
    }

    pub fn classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn dead_letter_store(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letters = Some(store);
        self
    }

    pub fn retry_scheduler(mut self, scheduler: Arc<dyn RetryScheduler>) -> Self {
        self.retry_scheduler = Some(scheduler);
        self
    }

    pub fn route_health_store(mut self, store: Arc<dyn RouteHealthStore>) -> Self {
        self.route_health = Some(store);
        self
    }

    pub async fn build(self) -> DispatchResult<Dispatcher> {
        let config = &self.config;
        let dead_letters = self
            .dead_letters
            .ok_or_else(|| DispatchError::config_error("缺少死信存储"))?;
        let retry_scheduler = self
            .retry_scheduler
            .ok_or_else(|| DispatchError::config_error("缺少重试调度器"))?;

        let strategy = strategy_from_name(&config.dispatcher.dispatch_strategy).ok_or_else(|| {
            DispatchError::config_error(format!(
                "无效的调度策略: {}",
                config.dispatcher.dispatch_strategy
            ))
        })?;
        let circuit_scope = CircuitScope::from_name(&config.dispatcher.circuit_scope)
            .ok_or_else(|| {
                DispatchError::config_error(format!(
                    "无效的熔断粒度: {}",
                    config.dispatcher.circuit_scope
                ))
            })?;

        let catalog = CapabilityCatalog::new(&config.dispatcher.capabilities);
        let registry = WorkerRegistry::with_strategy(catalog, strategy, self.clock.clone());

        let rate_limiter = RateLimiter::new(
            RateLimiterConfig::from(&config.rate_limiter),
            self.clock.clone(),
        );
        rate_limiter.register_all(&config.rate_limits).await?;

        let circuit_breaker = CircuitBreaker::new(
            CircuitBreakerConfig::from(&config.circuit_breaker),
            self.clock.clone(),
        );

        let retry_service = TaskRetryService::new(
            RetryConfig::from(&config.retry),
            self.classifier,
            dead_letters,
            self.clock.clone(),
        );

        let routes = match self.route_health {
            Some(store) => Some(Arc::new(
                RouteManager::from_settings(&config.routes, store, self.clock.clone()).await?,
            )),
            None => None,
        };

        info!(
            "分发器初始化完成: 策略 {}, 熔断粒度 {:?}, {} 个限流桶, {} 条线路",
            registry.strategy_name(),
            circuit_scope,
            config.rate_limits.len(),
            config.routes.routes.len()
        );

        Ok(Dispatcher {
            policy: self.policy,
            registry: Arc::new(registry),
            rate_limiter: Arc::new(rate_limiter),
            circuit_breaker: Arc::new(circuit_breaker),
            retry_service: Arc::new(retry_service),
            retry_scheduler,
            routes,
            circuit_scope,
            clock: self.clock,
        })
    }
}
