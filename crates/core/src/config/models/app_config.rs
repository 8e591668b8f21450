use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    dispatcher::{
        DispatcherSettings, ObservabilityConfig, RateLimitEntry, RateLimiterSettings,
        StorageSettings,
    },
    resilience::{CircuitBreakerSettings, RetrySettings, RouteSettings},
};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub dispatcher: DispatcherSettings,
    pub rate_limiter: RateLimiterSettings,
    pub rate_limits: Vec<RateLimitEntry>,
    pub circuit_breaker: CircuitBreakerSettings,
    pub retry: RetrySettings,
    pub routes: RouteSettings,
    pub storage: StorageSettings,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Built-in defaults (every section is `#[serde(default)]`)
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: TASKGATE_, nested keys separated by `__`)
    ///
    /// # Arguments
    ///
    /// * `config_path` - Config file path, if None try the default paths
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/taskgate.toml",
                "taskgate.toml",
                "/etc/taskgate/config.toml",
            ];

            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("TASKGATE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.dispatcher
            .validate()
            .context("Dispatcher配置验证失败")?;

        self.rate_limiter.validate().context("限流配置验证失败")?;

        for entry in &self.rate_limits {
            entry.validate().context("限流桶配置验证失败")?;
        }

        self.circuit_breaker
            .validate()
            .context("熔断器配置验证失败")?;

        self.retry.validate().context("重试配置验证失败")?;

        self.routes.validate().context("线路配置验证失败")?;

        self.storage.validate().context("存储配置验证失败")?;

        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatcher.dispatch_strategy, "load_based");
        assert!(config.rate_limits.is_empty());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[dispatcher]
capabilities = ["compute", "storage"]

[[rate_limits]]
resource_key = "payments"
max_tokens = 10.0
refill_rate_per_second = 1.0

[retry]
max_attempts = 3

[[routes.routes]]
name = "bank"
weight = 10
"#;
        let config = AppConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.dispatcher.capabilities, vec!["compute", "storage"]);
        assert_eq!(config.rate_limits.len(), 1);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.routes.routes[0].name, "bank");
        assert_eq!(config.routes.max_tries, 3);
    }

    #[test]
    fn test_invalid_strategy_rejected() {
        let toml_str = r#"
[dispatcher]
dispatch_strategy = "random"
"#;
        let err = AppConfig::from_toml(toml_str).unwrap_err();
        assert!(format!("{err:#}").contains("无效的调度策略"));
    }

    #[test]
    fn test_toml_roundtrip_and_file_load() {
        let mut config = AppConfig::default();
        config.rate_limits.push(RateLimitEntry {
            resource_key: "X".into(),
            max_tokens: 5.0,
            refill_rate_per_second: 0.5,
        });
        let text = config.to_toml().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taskgate.toml");
        std::fs::write(&path, text).unwrap();

        let loaded = AppConfig::load(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(loaded.rate_limits[0].resource_key, "X");
        assert_eq!(loaded.rate_limits[0].refill_rate_per_second, 0.5);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(AppConfig::load(Some("/definitely/not/here.toml")).is_err());
    }
}
