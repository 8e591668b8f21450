//! Mock implementations of the dispatcher's collaborators

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use taskgate_core::{
    DeadLetterRecord, DeadLetterStore, DispatchError, DispatchResult, PolicyDecision, PolicyGate,
    RouteHealthDocument, RouteHealthStore, Task, TaskExecutor,
};
use taskgate_infrastructure::{InMemoryDeadLetterStore, InMemoryRouteHealthStore};

/// 按脚本依次返回结果的执行器
///
/// 脚本用完后一直返回 `fallback`。记录调用次数和收到的任务id。
#[derive(Debug, Clone)]
pub struct ScriptedExecutor {
    script: Arc<Mutex<VecDeque<DispatchResult<serde_json::Value>>>>,
    fallback: DispatchResult<serde_json::Value>,
    calls: Arc<Mutex<Vec<String>>>,
    delay: Option<Duration>,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<DispatchResult<serde_json::Value>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script.into())),
            fallback: Err(DispatchError::Internal("script exhausted".to_string())),
            calls: Arc::new(Mutex::new(Vec::new())),
            delay: None,
        }
    }

    pub fn always_ok(value: serde_json::Value) -> Self {
        Self::new(Vec::new()).with_fallback(Ok(value))
    }

    pub fn always_err(error: DispatchError) -> Self {
        Self::new(Vec::new()).with_fallback(Err(error))
    }

    pub fn with_fallback(mut self, fallback: DispatchResult<serde_json::Value>) -> Self {
        self.fallback = fallback;
        self
    }

    /// 每次执行前先 sleep，用于并发测试
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn seen_tasks(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, task: &Task) -> DispatchResult<serde_json::Value> {
        self.calls.lock().unwrap().push(task.id.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// 拒绝所有任务的策略闸门，记录评估次数
#[derive(Debug, Clone)]
pub struct RejectingPolicy {
    reason: String,
    evaluations: Arc<Mutex<usize>>,
}

impl RejectingPolicy {
    pub fn new(reason: &str) -> Self {
        Self {
            reason: reason.to_string(),
            evaluations: Arc::new(Mutex::new(0)),
        }
    }

    pub fn evaluations(&self) -> usize {
        *self.evaluations.lock().unwrap()
    }
}

impl PolicyGate for RejectingPolicy {
    fn evaluate(&self, _task: &Task) -> PolicyDecision {
        *self.evaluations.lock().unwrap() += 1;
        PolicyDecision::deny(self.reason.clone())
    }
}

/// 可随时切换为写入失败的死信存储，写入前可选 sleep
#[derive(Debug, Default)]
pub struct FaultyDeadLetterStore {
    inner: InMemoryDeadLetterStore,
    failing: AtomicBool,
    append_delay: Option<Duration>,
    appends: AtomicUsize,
}

impl FaultyDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_append_delay(mut self, delay: Duration) -> Self {
        self.append_delay = Some(delay);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// 尝试写入的次数，包括失败的
    pub fn appends(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeadLetterStore for FaultyDeadLetterStore {
    async fn append(&self, record: &DeadLetterRecord) -> DispatchResult<()> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.append_delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(DispatchError::storage("dead letter disk full"));
        }
        self.inner.append(record).await
    }

    async fn list(&self) -> DispatchResult<Vec<DeadLetterRecord>> {
        self.inner.list().await
    }
}

/// 可随时切换为保存失败的线路健康存储
#[derive(Debug, Default)]
pub struct FaultyRouteHealthStore {
    inner: InMemoryRouteHealthStore,
    failing: AtomicBool,
}

impl FaultyRouteHealthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl RouteHealthStore for FaultyRouteHealthStore {
    async fn load(&self) -> DispatchResult<RouteHealthDocument> {
        self.inner.load().await
    }

    async fn save(&self, document: &RouteHealthDocument) -> DispatchResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DispatchError::storage("route health volume read-only"));
        }
        self.inner.save(document).await
    }
}
