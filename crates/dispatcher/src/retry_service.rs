use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use taskgate_core::{
    config::RetrySettings, mentions_status_code, Clock, DeadLetterRecord, DeadLetterStore, DispatchError,
    DispatchResult, Task,
};

/// 错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// 超时、连接重置、显式限流、服务不可用
    Transient,
    /// 其余一切：参数校验、鉴权、格式错误等
    Permanent,
}

/// 保守的错误分类器
///
/// 只有白名单里的信号才算瞬时错误，其余一律视为永久错误。
/// 文字标记按子串匹配；状态码只在 `HTTP 503`、`status 429` 这样的形式下才算数。
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    transient_markers: Vec<String>,
    transient_status_codes: Vec<u16>,
}

const DEFAULT_TRANSIENT_STATUS_CODES: [u16; 4] = [429, 502, 503, 504];

const DEFAULT_TRANSIENT_MARKERS: [&str; 12] = [
    "timeout",
    "timed out",
    "etimedout",
    "econnreset",
    "connection reset",
    "socket hang up",
    "econnrefused",
    "too many requests",
    "rate limit",
    "bad gateway",
    "service unavailable",
    "temporarily unavailable",
];

impl Default for FailureClassifier {
    fn default() -> Self {
        Self {
            transient_markers: DEFAULT_TRANSIENT_MARKERS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            transient_status_codes: DEFAULT_TRANSIENT_STATUS_CODES.to_vec(),
        }
    }
}

impl FailureClassifier {
    /// 追加瞬时错误标记（小写匹配）
    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.transient_markers.push(marker.into().to_lowercase());
        self
    }

    pub fn with_status_code(mut self, code: u16) -> Self {
        self.transient_status_codes.push(code);
        self
    }

    pub fn classify(&self, error: &DispatchError) -> FailureClass {
        match error {
            DispatchError::Throttled(_)
            | DispatchError::Timeout(_)
            | DispatchError::ConnectionReset(_)
            | DispatchError::Unavailable(_) => FailureClass::Transient,
            DispatchError::Execution(message) => {
                let lower = message.to_lowercase();
                if self
                    .transient_markers
                    .iter()
                    .any(|marker| lower.contains(marker.as_str()))
                    || mentions_status_code(message, &self.transient_status_codes)
                {
                    FailureClass::Transient
                } else {
                    FailureClass::Permanent
                }
            }
            _ => FailureClass::Permanent,
        }
    }
}

/// 重试策略配置
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    /// 第n次失败后等待 `2^n × base_delay`
    pub base_delay: Duration,
    /// 间隔上限，None 表示不封顶
    pub max_delay: Option<Duration>,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
    /// 最多记住多少个已进入死信的任务id
    pub dead_letter_memory: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: None,
            jitter_factor: 0.0,
            dead_letter_memory: 10_000,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: settings.max_delay_ms.map(Duration::from_millis),
            jitter_factor: settings.jitter_factor,
            dead_letter_memory: settings.dead_letter_memory,
        }
    }
}

/// 失败决策
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    DeadLetter,
    /// 既不重试也不写死信（同一任务已进入死信后再次失败）
    Abort,
}

/// 重试服务接口
#[async_trait]
pub trait RetryService: Send + Sync {
    /// 递增 `task.attempts` 并决定重试、写死信或放弃
    async fn decide(&self, task: &mut Task, error: &DispatchError) -> DispatchResult<RetryDecision>;

    /// 计算第 `attempts` 次失败后的重试间隔
    fn calculate_delay(&self, attempts: u32) -> Duration;
}

/// 已进入死信（或正在写入）的任务id，按先进先出淘汰
#[derive(Debug)]
struct DeadLetterLedger {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DeadLetterLedger {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, task_id: &str) -> bool {
        self.ids.contains(task_id)
    }

    /// 已存在时返回 false
    fn reserve(&mut self, task_id: &str) -> bool {
        if !self.ids.insert(task_id.to_string()) {
            return false;
        }
        self.order.push_back(task_id.to_string());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }

    fn forget(&mut self, task_id: &str) {
        if self.ids.remove(task_id) {
            self.order.retain(|id| id != task_id);
        }
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

/// 重试服务实现
///
/// 同一任务id只写一次死信：写入前先在内存账本里占位，写入失败再撤销。
/// 账本容量由 `dead_letter_memory` 限定，被淘汰的id再次失败时会重新写死信。
pub struct TaskRetryService {
    config: RetryConfig,
    classifier: FailureClassifier,
    dead_letters: Arc<dyn DeadLetterStore>,
    clock: Arc<dyn Clock>,
    ledger: Mutex<DeadLetterLedger>,
}

impl TaskRetryService {
    pub fn new(
        config: RetryConfig,
        classifier: FailureClassifier,
        dead_letters: Arc<dyn DeadLetterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger: Mutex::new(DeadLetterLedger::new(config.dead_letter_memory)),
            config,
            classifier,
            dead_letters,
            clock,
        }
    }

    pub fn classifier(&self) -> &FailureClassifier {
        &self.classifier
    }

    /// 当前记住的死信任务数
    pub async fn remembered_dead_letters(&self) -> usize {
        self.ledger.lock().await.len()
    }

    /// 写入死信；同一id已有记录或正在写入时返回 `Ok(false)`
    async fn dead_letter(&self, task: &Task, error: &DispatchError) -> DispatchResult<bool> {
        if !self.ledger.lock().await.reserve(&task.id) {
            return Ok(false);
        }

        let record = DeadLetterRecord::new(task.clone(), error.to_string(), self.clock.now());
        if let Err(e) = self.dead_letters.append(&record).await {
            error!("任务 {} 写入死信失败: {}", task.id, e);
            self.ledger.lock().await.forget(&task.id);
            return Err(e);
        }
        metrics::counter!("taskgate_dead_letters_total").increment(1);
        warn!(
            "任务 {} 已写入死信，失败次数: {}，错误: {}",
            task.id, task.attempts, error
        );
        Ok(true)
    }
}

#[async_trait]
impl RetryService for TaskRetryService {
    async fn decide(&self, task: &mut Task, error: &DispatchError) -> DispatchResult<RetryDecision> {
        if self.ledger.lock().await.contains(&task.id) {
            warn!("任务 {} 已在死信中，放弃处理: {}", task.id, error);
            return Ok(RetryDecision::Abort);
        }

        task.attempts = task.attempts.saturating_add(1);
        let class = self.classifier.classify(error);
        debug!(
            "任务 {} 第 {} 次失败，分类: {:?}",
            task.id, task.attempts, class
        );

        match class {
            FailureClass::Transient if task.attempts <= self.config.max_attempts => {
                let delay = self.calculate_delay(task.attempts);
                info!(
                    "任务 {} 将在 {:?} 后重试 ({}/{})",
                    task.id, delay, task.attempts, self.config.max_attempts
                );
                Ok(RetryDecision::Retry { delay })
            }
            FailureClass::Transient | FailureClass::Permanent => {
                if self.dead_letter(task, error).await? {
                    Ok(RetryDecision::DeadLetter)
                } else {
                    warn!("任务 {} 的死信已由并发的失败写入，放弃处理", task.id);
                    Ok(RetryDecision::Abort)
                }
            }
        }
    }

    fn calculate_delay(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        let exponential = self
            .config
            .base_delay
            .checked_mul(factor)
            .unwrap_or(Duration::MAX);

        let capped = match self.config.max_delay {
            Some(max) => exponential.min(max),
            None => exponential,
        };

        if self.config.jitter_factor <= 0.0 {
            return capped;
        }

        // 添加随机抖动以避免雷群效应
        let capped_secs = capped.as_secs_f64();
        let jitter = capped_secs * self.config.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let final_secs = (capped_secs + jitter).max(self.config.base_delay.as_secs_f64());
        Duration::try_from_secs_f64(final_secs).unwrap_or(capped)
    }
}
