use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 一次线路尝试的失败记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteAttempt {
    pub route: String,
    pub error: String,
}

/// 分发核心错误类型定义
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("下游限流: {0}")]
    Throttled(String),

    #[error("执行超时: {0}")]
    Timeout(String),

    #[error("连接被重置: {0}")]
    ConnectionReset(String),

    #[error("服务不可用: {0}")]
    Unavailable(String),

    #[error("数据验证失败: {0}")]
    Validation(String),

    #[error("权限不足: {0}")]
    Unauthorized(String),

    #[error("任务执行错误: {0}")]
    Execution(String),

    #[error("熔断器已打开: {operation} (约 {retry_after:?} 后可探测)")]
    CircuitOpen {
        operation: String,
        retry_after: Duration,
    },

    #[error("没有可用的Worker")]
    NoWorkerAvailable,

    #[error("未声明的能力标签: {0}")]
    UnknownCapability(String),

    #[error("Worker未找到: {id}")]
    WorkerNotFound { id: String },

    #[error("所有线路均失败: {}", format_attempts(.attempts))]
    AllRoutesFailed { attempts: Vec<RouteAttempt> },

    #[error("没有配置任何线路")]
    NoRoutesConfigured,

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

fn format_attempts(attempts: &[RouteAttempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("{}: {}", a.route, a.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// 统一的Result类型
pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

impl DispatchError {
    pub fn execution<S: Into<String>>(msg: S) -> Self {
        Self::Execution(msg.into())
    }

    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// 下游显式给出的限流信号，用于延长准入退避
    pub fn is_throttle(&self) -> bool {
        match self {
            DispatchError::Throttled(_) => true,
            DispatchError::Execution(msg) => {
                let lower = msg.to_lowercase();
                lower.contains("too many requests")
                    || lower.contains("rate limit")
                    || mentions_status_code(msg, &[429])
            }
            _ => false,
        }
    }

    /// 熔断短路：操作根本没有被执行
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, DispatchError::CircuitOpen { .. })
    }
}

const STATUS_KEYWORDS: [&str; 4] = ["http", "https", "status", "code"];

/// 消息里是否以HTTP状态码的形式出现了 `codes` 之一
///
/// 状态码必须是独立的数字，并且紧跟在 `HTTP`、`status` 或 `code` 之后
/// （中间可以有 `HTTP/1.1` 这样的版本号）。`order 15021`、`account 4290017`
/// 里的数字不算。
pub fn mentions_status_code(message: &str, codes: &[u16]) -> bool {
    let lower = message.to_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    tokens.iter().enumerate().any(|(i, token)| {
        let Ok(code) = token.parse::<u16>() else {
            return false;
        };
        if token.len() != 3 || !codes.contains(&code) {
            return false;
        }
        tokens[..i]
            .iter()
            .rev()
            .find(|t| !(t.len() == 1 && t.chars().all(|c| c.is_ascii_digit())))
            .is_some_and(|prev| STATUS_KEYWORDS.contains(prev))
    })
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for DispatchError {
    fn from(err: std::io::Error) -> Self {
        DispatchError::Storage(err.to_string())
    }
}

impl From<anyhow::Error> for DispatchError {
    fn from(err: anyhow::Error) -> Self {
        DispatchError::Internal(err.to_string())
    }
}
