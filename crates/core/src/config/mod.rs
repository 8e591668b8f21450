//! 配置管理
//!
//! 配置模型全部实现 `serde` 并带默认值，`AppConfig::load` 依次合并
//! 默认值、TOML 配置文件和 `TASKGATE_` 前缀的环境变量。
//!
//! 这里只保存原始配置值（毫秒数、策略名等），运行时配置由各组件自行转换。

pub mod models;

pub use models::*;
