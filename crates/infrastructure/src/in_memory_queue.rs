use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use taskgate_core::{clock::add_duration, Clock, DispatchResult, RetryScheduler, Task};

/// 内存延迟重试队列
///
/// 按到期时间排序，同一时刻按入队顺序。队列本身不启动定时器，
/// 由调用方周期性地 [`take_due`](Self::take_due) 并重新提交。
pub struct InMemoryRetryQueue {
    clock: Arc<dyn Clock>,
    inner: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    next_sequence: u64,
    entries: BTreeMap<(DateTime<Utc>, u64), Task>,
}

impl InMemoryRetryQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(QueueState::default()),
        }
    }

    /// 取出所有 `due_at <= now` 的任务
    pub async fn take_due(&self, now: DateTime<Utc>) -> Vec<Task> {
        let mut state = self.inner.lock().await;
        // 所有已用序号都小于 next_sequence，边界之前即 due_at <= now
        let boundary = (now, state.next_sequence);
        let pending = state.entries.split_off(&boundary);
        let due = std::mem::replace(&mut state.entries, pending);
        due.into_values().collect()
    }

    /// 撤回尚未到期的任务，返回是否找到
    pub async fn cancel(&self, task_id: &str) -> bool {
        let mut state = self.inner.lock().await;
        let key = state
            .entries
            .iter()
            .find(|(_, task)| task.id == task_id)
            .map(|(key, _)| *key);
        match key {
            Some(key) => {
                state.entries.remove(&key);
                debug!("撤回重试任务: {}", task_id);
                true
            }
            None => false,
        }
    }

    /// 最早到期时间
    pub async fn next_due(&self) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .await
            .entries
            .keys()
            .next()
            .map(|(due_at, _)| *due_at)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }
}

#[async_trait]
impl RetryScheduler for InMemoryRetryQueue {
    async fn schedule(&self, task: Task, delay: Duration) -> DispatchResult<()> {
        let due_at = add_duration(self.clock.now(), delay);
        let mut state = self.inner.lock().await;
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        debug!("任务 {} 计划于 {} 重试", task.id, due_at);
        state.entries.insert((due_at, sequence), task);
        Ok(())
    }
}
