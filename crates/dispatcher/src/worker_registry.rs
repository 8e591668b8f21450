use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use taskgate_core::{
    CapabilityCatalog, CapabilitySet, Clock, DispatchError, DispatchResult, Task, TaskExecutor,
    WorkerInfo,
};

use crate::strategies::{LoadBasedStrategy, TaskDispatchStrategy};

struct RegisteredWorker {
    info: WorkerInfo,
    executor: Arc<dyn TaskExecutor>,
}

/// 一次成功的分配：Worker负载已经加一，调用方负责在终态时 [`WorkerRegistry::release`]
#[derive(Clone)]
pub struct Assignment {
    pub worker_id: String,
    pub executor: Arc<dyn TaskExecutor>,
}

impl std::fmt::Debug for Assignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Assignment")
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

/// 占用一次分配的负载，直到 [`release`](Self::release) 或被丢弃
///
/// 提交在中途被取消时，负载也会被归还。
pub struct WorkloadGuard {
    registry: Arc<WorkerRegistry>,
    worker_id: Option<String>,
}

impl WorkloadGuard {
    pub fn new(registry: Arc<WorkerRegistry>, worker_id: impl Into<String>) -> Self {
        Self {
            registry,
            worker_id: Some(worker_id.into()),
        }
    }

    pub fn worker_id(&self) -> &str {
        self.worker_id.as_deref().unwrap_or_default()
    }

    pub async fn release(mut self) {
        if let Some(worker_id) = self.worker_id.take() {
            self.registry.release(&worker_id).await;
        }
    }
}

impl Drop for WorkloadGuard {
    fn drop(&mut self) {
        let Some(worker_id) = self.worker_id.take() else {
            return;
        };
        if let Ok(mut workers) = self.registry.workers.try_write() {
            WorkerRegistry::decrement(&mut workers, &worker_id);
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let registry = Arc::clone(&self.registry);
                handle.spawn(async move { registry.release(&worker_id).await });
            }
            Err(_) => warn!("没有可用的运行时，Worker {} 的负载未能归还", worker_id),
        }
    }
}

/// Worker注册表与任务分配器
///
/// 按注册顺序保存Worker；筛选、选择和负载递增在同一把写锁内完成。
pub struct WorkerRegistry {
    catalog: CapabilityCatalog,
    strategy: Arc<dyn TaskDispatchStrategy>,
    clock: Arc<dyn Clock>,
    workers: RwLock<Vec<RegisteredWorker>>,
}

impl WorkerRegistry {
    pub fn new(catalog: CapabilityCatalog, clock: Arc<dyn Clock>) -> Self {
        Self::with_strategy(catalog, Arc::new(LoadBasedStrategy::new()), clock)
    }

    pub fn with_strategy(
        catalog: CapabilityCatalog,
        strategy: Arc<dyn TaskDispatchStrategy>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            catalog,
            strategy,
            clock,
            workers: RwLock::new(Vec::new()),
        }
    }

    pub fn catalog(&self) -> &CapabilityCatalog {
        &self.catalog
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// 注册或替换Worker，替换时保留原注册位置并把负载清零
    pub async fn register<I, S>(
        &self,
        worker_id: impl Into<String>,
        capabilities: I,
        executor: Arc<dyn TaskExecutor>,
    ) -> DispatchResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let capabilities = self.catalog.parse_set(capabilities)?;
        self.register_with_set(worker_id, capabilities, executor)
            .await
    }

    pub async fn register_with_set(
        &self,
        worker_id: impl Into<String>,
        capabilities: CapabilitySet,
        executor: Arc<dyn TaskExecutor>,
    ) -> DispatchResult<()> {
        self.catalog.validate(&capabilities)?;
        let worker_id = worker_id.into();
        let mut info = WorkerInfo::new(worker_id.clone(), capabilities);
        info.registered_at = self.clock.now();

        let mut workers = self.workers.write().await;
        match workers.iter_mut().find(|w| w.info.id == worker_id) {
            Some(existing) => {
                info!("替换已注册的Worker: {}", worker_id);
                *existing = RegisteredWorker { info, executor };
            }
            None => {
                info!("注册Worker: {} (能力: {:?})", worker_id, info.capabilities);
                workers.push(RegisteredWorker { info, executor });
            }
        }
        Ok(())
    }

    pub async fn deregister(&self, worker_id: &str) -> DispatchResult<WorkerInfo> {
        let mut workers = self.workers.write().await;
        let index = workers
            .iter()
            .position(|w| w.info.id == worker_id)
            .ok_or_else(|| DispatchError::WorkerNotFound {
                id: worker_id.to_string(),
            })?;
        let removed = workers.remove(index);
        info!(
            "注销Worker: {} (未完成任务: {})",
            worker_id, removed.info.workload
        );
        Ok(removed.info)
    }

    pub async fn update_capabilities<I, S>(
        &self,
        worker_id: &str,
        capabilities: I,
    ) -> DispatchResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let capabilities = self.catalog.parse_set(capabilities)?;
        let mut workers = self.workers.write().await;
        let worker = workers
            .iter_mut()
            .find(|w| w.info.id == worker_id)
            .ok_or_else(|| DispatchError::WorkerNotFound {
                id: worker_id.to_string(),
            })?;
        debug!(
            "更新Worker {} 能力: {:?} -> {:?}",
            worker_id, worker.info.capabilities, capabilities
        );
        worker.info.capabilities = capabilities;
        Ok(())
    }

    /// 为任务分配Worker，没有合格Worker时返回 `Ok(None)`
    pub async fn assign(&self, task: &Task) -> DispatchResult<Option<Assignment>> {
        self.catalog.validate(&task.required_capabilities)?;

        let mut workers = self.workers.write().await;
        let selected = {
            let candidates: Vec<&WorkerInfo> = workers
                .iter()
                .map(|w| &w.info)
                .filter(|info| info.can_accept(&task.required_capabilities))
                .collect();

            if candidates.is_empty() {
                debug!(
                    "没有满足能力 {:?} 的Worker (任务: {})",
                    task.required_capabilities, task.id
                );
                return Ok(None);
            }
            self.strategy.select_worker(task, &candidates)
        };

        let Some(worker_id) = selected else {
            return Ok(None);
        };
        let Some(worker) = workers.iter_mut().find(|w| w.info.id == worker_id) else {
            warn!("策略 {} 返回了未注册的Worker: {}", self.strategy.name(), worker_id);
            return Ok(None);
        };
        worker.info.workload = worker.info.workload.saturating_add(1);

        Ok(Some(Assignment {
            worker_id,
            executor: worker.executor.clone(),
        }))
    }

    /// 归还一次分配占用的负载；Worker已注销时忽略
    pub async fn release(&self, worker_id: &str) {
        let mut workers = self.workers.write().await;
        Self::decrement(&mut workers, worker_id);
    }

    fn decrement(workers: &mut [RegisteredWorker], worker_id: &str) {
        match workers.iter_mut().find(|w| w.info.id == worker_id) {
            Some(worker) => worker.info.workload = worker.info.workload.saturating_sub(1),
            None => debug!("释放负载时Worker {} 已不存在", worker_id),
        }
    }

    pub async fn record_success(&self, worker_id: &str, at: DateTime<Utc>) {
        let mut workers = self.workers.write().await;
        if let Some(worker) = workers.iter_mut().find(|w| w.info.id == worker_id) {
            worker.info.completed += 1;
            worker.info.last_success_at = Some(at);
        }
    }

    pub async fn record_failure(&self, worker_id: &str, at: DateTime<Utc>) {
        let mut workers = self.workers.write().await;
        if let Some(worker) = workers.iter_mut().find(|w| w.info.id == worker_id) {
            worker.info.failed += 1;
            worker.info.last_failure_at = Some(at);
        }
    }

    pub async fn get(&self, worker_id: &str) -> Option<WorkerInfo> {
        self.workers
            .read()
            .await
            .iter()
            .find(|w| w.info.id == worker_id)
            .map(|w| w.info.clone())
    }

    /// 按注册顺序返回所有Worker的快照
    pub async fn workers(&self) -> Vec<WorkerInfo> {
        self.workers
            .read()
            .await
            .iter()
            .map(|w| w.info.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }
}
