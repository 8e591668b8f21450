use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    /// 半开探测失败后重置超时的增长倍数，1.0 表示原样重新计时
    pub backoff_multiplier: f64,
    pub max_reset_timeout_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            backoff_multiplier: 1.0,
            max_reset_timeout_ms: 300_000,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.failure_threshold == 0 {
            return Err(anyhow::anyhow!("熔断失败阈值必须大于0"));
        }
        if self.reset_timeout_ms == 0 {
            return Err(anyhow::anyhow!("熔断重置超时必须大于0"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!("熔断退避倍数不能小于1.0"));
        }
        if self.max_reset_timeout_ms < self.reset_timeout_ms {
            return Err(anyhow::anyhow!("最大重置超时不能小于重置超时"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// 重试间隔上限，不设置则不封顶
    pub max_delay_ms: Option<u64>,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
    /// 最多记住多少个已进入死信的任务id，超出后最早的被遗忘
    pub dead_letter_memory: usize,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: None,
            jitter_factor: 0.0,
            dead_letter_memory: 10_000,
        }
    }
}

impl RetrySettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_delay_ms == 0 {
            return Err(anyhow::anyhow!("重试基础间隔必须大于0"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(anyhow::anyhow!("抖动因子必须在 0.0-1.0 之间"));
        }
        if self.dead_letter_memory == 0 {
            return Err(anyhow::anyhow!("死信id记忆容量必须大于0"));
        }
        if let Some(max) = self.max_delay_ms {
            if max < self.base_delay_ms {
                return Err(anyhow::anyhow!("重试间隔上限不能小于基础间隔"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    pub name: String,
    pub weight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteSettings {
    pub routes: Vec<RouteEntry>,
    pub cooldown_base_ms: u64,
    pub max_cooldown_ms: u64,
    /// 冷却时间下限
    pub cooldown_floor_ms: u64,
    pub max_tries: usize,
}

impl Default for RouteSettings {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            cooldown_base_ms: 1000,
            max_cooldown_ms: 300_000,
            cooldown_floor_ms: 0,
            max_tries: 3,
        }
    }
}

impl RouteSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for route in &self.routes {
            if route.name.is_empty() {
                return Err(anyhow::anyhow!("线路名不能为空"));
            }
            if !seen.insert(route.name.as_str()) {
                return Err(anyhow::anyhow!("线路名重复: {}", route.name));
            }
        }
        if self.cooldown_base_ms == 0 {
            return Err(anyhow::anyhow!("冷却基数必须大于0"));
        }
        if self.max_cooldown_ms < self.cooldown_floor_ms {
            return Err(anyhow::anyhow!("最大冷却时间不能小于冷却下限"));
        }
        if self.max_tries == 0 {
            return Err(anyhow::anyhow!("最大尝试次数必须大于0"));
        }
        Ok(())
    }
}
