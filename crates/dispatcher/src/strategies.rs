use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use taskgate_core::{Task, WorkerInfo};

/// 任务分配策略
///
/// `candidates` 已经按注册顺序排列，并且只包含能力集合覆盖任务需求的Worker。
/// 选择在注册表写锁内完成，实现不能阻塞。
pub trait TaskDispatchStrategy: Send + Sync {
    fn select_worker(&self, task: &Task, candidates: &[&WorkerInfo]) -> Option<String>;

    fn name(&self) -> &str;
}

/// 最小负载优先，负载相同按注册顺序
pub struct LoadBasedStrategy;

impl LoadBasedStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LoadBasedStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskDispatchStrategy for LoadBasedStrategy {
    fn select_worker(&self, task: &Task, candidates: &[&WorkerInfo]) -> Option<String> {
        // min_by_key 在相等时返回第一个，即最早注册的Worker
        let selected = candidates.iter().min_by_key(|worker| worker.workload)?;

        debug!(
            "负载均衡策略为任务 {} 选择Worker: {} (当前负载: {})",
            task.id, selected.id, selected.workload
        );

        Some(selected.id.clone())
    }

    fn name(&self) -> &str {
        "LoadBased"
    }
}

pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskDispatchStrategy for RoundRobinStrategy {
    fn select_worker(&self, task: &Task, candidates: &[&WorkerInfo]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        let selected = candidates[index];

        debug!(
            "轮询策略为任务 {} 选择Worker: {} (索引: {}/{})",
            task.id,
            selected.id,
            index,
            candidates.len()
        );

        Some(selected.id.clone())
    }

    fn name(&self) -> &str {
        "RoundRobin"
    }
}

/// 按配置名称创建策略，未知名称返回 None
pub fn strategy_from_name(name: &str) -> Option<std::sync::Arc<dyn TaskDispatchStrategy>> {
    match name {
        "load_based" => Some(std::sync::Arc::new(LoadBasedStrategy::new())),
        "round_robin" => Some(std::sync::Arc::new(RoundRobinStrategy::new())),
        _ => None,
    }
}
