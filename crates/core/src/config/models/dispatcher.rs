use serde::{Deserialize, Serialize};

pub const VALID_STRATEGIES: [&str; 2] = ["load_based", "round_robin"];
pub const VALID_CIRCUIT_SCOPES: [&str; 3] = ["resource", "worker", "worker_resource"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    pub dispatch_strategy: String, // "load_based", "round_robin"
    pub circuit_scope: String,     // "resource", "worker", "worker_resource"
    /// 部署内允许出现的能力标签
    pub capabilities: Vec<String>,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            dispatch_strategy: "load_based".to_string(),
            circuit_scope: "resource".to_string(),
            capabilities: Vec::new(),
        }
    }
}

impl DispatcherSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !VALID_STRATEGIES.contains(&self.dispatch_strategy.as_str()) {
            return Err(anyhow::anyhow!(
                "无效的调度策略: {}，支持的策略: {:?}",
                self.dispatch_strategy,
                VALID_STRATEGIES
            ));
        }

        if !VALID_CIRCUIT_SCOPES.contains(&self.circuit_scope.as_str()) {
            return Err(anyhow::anyhow!(
                "无效的熔断粒度: {}，支持: {:?}",
                self.circuit_scope,
                VALID_CIRCUIT_SCOPES
            ));
        }

        if self.capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(anyhow::anyhow!("能力标签不能为空"));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterSettings {
    pub backoff_base_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self {
            backoff_base_ms: 1000,
            max_backoff_ms: 60_000,
        }
    }
}

impl RateLimiterSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backoff_base_ms == 0 {
            return Err(anyhow::anyhow!("限流退避基数必须大于0"));
        }
        if self.max_backoff_ms < self.backoff_base_ms {
            return Err(anyhow::anyhow!("最大退避时间不能小于退避基数"));
        }
        Ok(())
    }
}

/// 启动时注册的限流桶
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitEntry {
    pub resource_key: String,
    pub max_tokens: f64,
    pub refill_rate_per_second: f64,
}

impl RateLimitEntry {
    pub fn new(resource_key: impl Into<String>, max_tokens: f64, refill_rate_per_second: f64) -> Self {
        Self {
            resource_key: resource_key.into(),
            max_tokens,
            refill_rate_per_second,
        }
    }

    /// 容量和速率都必须是有限值；容量不小于1，速率大于0
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.resource_key.is_empty() {
            return Err(anyhow::anyhow!("限流资源键不能为空"));
        }
        if !self.max_tokens.is_finite() || self.max_tokens < 1.0 {
            return Err(anyhow::anyhow!(
                "{} 的 max_tokens 必须不小于1",
                self.resource_key
            ));
        }
        if !self.refill_rate_per_second.is_finite() || self.refill_rate_per_second <= 0.0 {
            return Err(anyhow::anyhow!(
                "{} 的 refill_rate_per_second 必须大于0",
                self.resource_key
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub dead_letter_path: String,
    pub route_health_path: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            dead_letter_path: "data/dead_letters.jsonl".to_string(),
            route_health_path: "data/route_health.json".to_string(),
        }
    }
}

impl StorageSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dead_letter_path.is_empty() {
            return Err(anyhow::anyhow!("死信文件路径不能为空"));
        }
        if self.route_health_path.is_empty() {
            return Err(anyhow::anyhow!("线路健康文件路径不能为空"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String, // "json", "pretty"
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(anyhow::anyhow!("无效的日志级别: {}", self.log_level));
        }
        if !["json", "pretty"].contains(&self.log_format.as_str()) {
            return Err(anyhow::anyhow!("无效的日志格式: {}", self.log_format));
        }
        Ok(())
    }
}
