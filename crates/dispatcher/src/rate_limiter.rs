//! 按资源键的令牌桶准入控制
//!
//! 每个资源键有两道相互独立的闸门，两者都通过才准入：
//!
//! - 令牌桶：按流逝时间补充令牌（不超过 `max_tokens`），有至少1个令牌时扣除1个
//! - 限流退避：下游返回限流信号后，在 `next_attempt_allowed_at` 之前一律拒绝
//!
//! 没有注册限流桶的资源键默认放行。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use taskgate_core::{
    clock::{add_duration, elapsed_between, exponential_backoff},
    config::{RateLimitEntry, RateLimiterSettings},
    Clock, DispatchError, DispatchResult,
};

/// 限流器配置
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// 退避基数：第n次连续限流后等待 `min(max_backoff, 2^n × backoff_base)`
    pub backoff_base: Duration,
    pub max_backoff: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl From<&RateLimiterSettings> for RateLimiterConfig {
    fn from(settings: &RateLimiterSettings) -> Self {
        Self {
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }
}

/// 准入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// `retry_after` 为下一次可能准入的建议等待时间
    Denied { retry_after: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

#[derive(Debug, Clone)]
struct TokenBucket {
    max_tokens: f64,
    refill_rate_per_second: f64,
    tokens: f64,
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    fn projected(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = elapsed_between(self.last_refill, now).as_secs_f64();
        (self.tokens + elapsed * self.refill_rate_per_second).clamp(0.0, self.max_tokens)
    }

    fn refill(&mut self, now: DateTime<Utc>) {
        self.tokens = self.projected(now);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    fn time_to_next_token(&self) -> Duration {
        let missing = (1.0 - self.tokens).max(0.0);
        // 速率为0时永远补不满，try_from 对 inf/NaN 返回错误
        Duration::try_from_secs_f64(missing / self.refill_rate_per_second).unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone)]
struct BackoffEntry {
    consecutive_failures: u32,
    next_attempt_allowed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ResourceState {
    bucket: Option<TokenBucket>,
    backoff: Option<BackoffEntry>,
}

/// 单个资源键的只读快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketSnapshot {
    pub resource_key: String,
    pub max_tokens: Option<f64>,
    pub refill_rate_per_second: Option<f64>,
    pub tokens: Option<f64>,
    pub consecutive_failures: u32,
    pub backoff_until: Option<DateTime<Utc>>,
}

/// 限流器
pub struct RateLimiter {
    config: RateLimiterConfig,
    clock: Arc<dyn Clock>,
    resources: RwLock<HashMap<String, Arc<Mutex<ResourceState>>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            resources: RwLock::new(HashMap::new()),
        }
    }

    /// 按配置注册全部限流桶，遇到第一条无效配置即停止
    pub async fn register_all(&self, entries: &[RateLimitEntry]) -> DispatchResult<()> {
        for entry in entries {
            self.register_limit(
                &entry.resource_key,
                entry.max_tokens,
                entry.refill_rate_per_second,
            )
            .await?;
        }
        Ok(())
    }

    /// 配置限流桶
    ///
    /// 新键以满桶开始；已存在的键只替换容量和速率，保留已累积的令牌（按新容量截断）。
    /// 容量或速率无效时返回 [`DispatchError::Validation`]，不改动已有状态。
    pub async fn register_limit(
        &self,
        resource_key: &str,
        max_tokens: f64,
        refill_rate_per_second: f64,
    ) -> DispatchResult<()> {
        RateLimitEntry::new(resource_key, max_tokens, refill_rate_per_second)
            .validate()
            .map_err(|e| DispatchError::Validation(e.to_string()))?;

        let now = self.clock.now();
        let state = self.entry(resource_key).await;
        let mut state = state.lock().await;

        match state.bucket.as_mut() {
            Some(bucket) => {
                bucket.refill(now);
                bucket.max_tokens = max_tokens;
                bucket.refill_rate_per_second = refill_rate_per_second;
                bucket.tokens = bucket.tokens.min(max_tokens);
                info!(
                    "更新限流桶 {}: 容量 {}, 速率 {}/s, 保留令牌 {:.2}",
                    resource_key, max_tokens, refill_rate_per_second, bucket.tokens
                );
            }
            None => {
                state.bucket = Some(TokenBucket {
                    max_tokens,
                    refill_rate_per_second,
                    tokens: max_tokens,
                    last_refill: now,
                });
                info!(
                    "注册限流桶 {}: 容量 {}, 速率 {}/s",
                    resource_key, max_tokens, refill_rate_per_second
                );
            }
        }
        Ok(())
    }

    /// 尝试获取一个令牌
    pub async fn try_acquire(&self, resource_key: &str) -> bool {
        self.admit(resource_key).await.is_admitted()
    }

    /// 尝试获取一个令牌，拒绝时附带建议的等待时间
    pub async fn admit(&self, resource_key: &str) -> Admission {
        let Some(state) = self.existing(resource_key).await else {
            return Admission::Admitted;
        };

        let now = self.clock.now();
        let mut state = state.lock().await;

        if let Some(bucket) = state.bucket.as_mut() {
            bucket.refill(now);
        }

        if let Some(backoff) = &state.backoff {
            if now < backoff.next_attempt_allowed_at {
                let retry_after = elapsed_between(now, backoff.next_attempt_allowed_at);
                debug!("资源 {} 处于限流退避中，{:?} 后重试", resource_key, retry_after);
                return Admission::Denied { retry_after };
            }
        }

        match state.bucket.as_mut() {
            Some(bucket) if bucket.tokens >= 1.0 => {
                bucket.tokens -= 1.0;
                Admission::Admitted
            }
            Some(bucket) => {
                let retry_after = bucket.time_to_next_token();
                debug!("资源 {} 令牌不足，{:?} 后补充", resource_key, retry_after);
                Admission::Denied { retry_after }
            }
            None => Admission::Admitted,
        }
    }

    /// 成功后清除退避
    pub async fn report_success(&self, resource_key: &str) {
        if let Some(state) = self.existing(resource_key).await {
            let mut state = state.lock().await;
            if state.backoff.take().is_some() {
                info!("资源 {} 恢复正常，清除限流退避", resource_key);
            }
        }
    }

    /// 上报失败，只有限流类错误会延长退避
    pub async fn report_failure(&self, resource_key: &str, is_throttle_error: bool) {
        if !is_throttle_error {
            return;
        }

        let now = self.clock.now();
        let state = self.entry(resource_key).await;
        let mut state = state.lock().await;

        let failures = state
            .backoff
            .as_ref()
            .map_or(0, |b| b.consecutive_failures)
            .saturating_add(1);
        let delay = exponential_backoff(failures, self.config.backoff_base, self.config.max_backoff);
        let next_attempt_allowed_at = add_duration(now, delay);

        state.backoff = Some(BackoffEntry {
            consecutive_failures: failures,
            next_attempt_allowed_at,
        });

        warn!(
            "资源 {} 被下游限流 (连续 {} 次)，退避 {:?}",
            resource_key, failures, delay
        );
    }

    /// 所有资源键的只读快照，令牌数按当前时间推算，不修改状态
    pub async fn snapshot(&self) -> Vec<BucketSnapshot> {
        let now = self.clock.now();
        let entries: Vec<(String, Arc<Mutex<ResourceState>>)> = self
            .resources
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();

        let mut snapshots = Vec::with_capacity(entries.len());
        for (resource_key, state) in entries {
            let state = state.lock().await;
            snapshots.push(BucketSnapshot {
                resource_key,
                max_tokens: state.bucket.as_ref().map(|b| b.max_tokens),
                refill_rate_per_second: state.bucket.as_ref().map(|b| b.refill_rate_per_second),
                tokens: state.bucket.as_ref().map(|b| b.projected(now)),
                consecutive_failures: state.backoff.as_ref().map_or(0, |b| b.consecutive_failures),
                backoff_until: state.backoff.as_ref().map(|b| b.next_attempt_allowed_at),
            });
        }
        snapshots.sort_by(|a, b| a.resource_key.cmp(&b.resource_key));
        snapshots
    }

    async fn existing(&self, resource_key: &str) -> Option<Arc<Mutex<ResourceState>>> {
        self.resources.read().await.get(resource_key).cloned()
    }

    async fn entry(&self, resource_key: &str) -> Arc<Mutex<ResourceState>> {
        if let Some(state) = self.existing(resource_key).await {
            return state;
        }
        let mut resources = self.resources.write().await;
        Arc::clone(resources.entry(resource_key.to_string()).or_default())
    }
}
