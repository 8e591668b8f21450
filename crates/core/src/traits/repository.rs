use async_trait::async_trait;

use crate::{
    models::{DeadLetterRecord, RouteHealthDocument},
    DispatchResult,
};

/// 死信存储接口
///
/// 只追加，每个终态失败一条记录，写入后不再修改。
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// 追加一条记录，返回前必须已持久化
    async fn append(&self, record: &DeadLetterRecord) -> DispatchResult<()>;

    /// 按写入顺序读取全部记录
    async fn list(&self) -> DispatchResult<Vec<DeadLetterRecord>>;
}

/// 线路健康文档存储接口
///
/// 单写者文档：线路管理器初始化时读取一次，每次成功/失败上报后整体写回。
#[async_trait]
pub trait RouteHealthStore: Send + Sync {
    async fn load(&self) -> DispatchResult<RouteHealthDocument>;

    async fn save(&self, document: &RouteHealthDocument) -> DispatchResult<()>;
}
