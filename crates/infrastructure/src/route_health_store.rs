use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use taskgate_core::{DispatchError, DispatchResult, RouteHealthDocument, RouteHealthStore};

/// 线路健康 JSON 文档
///
/// 保存时先写临时文件再 rename 覆盖，读者只会看到完整的旧文档或新文档。
/// 假定单写者：同一路径只由一个线路管理器写入。
#[derive(Debug)]
pub struct JsonFileRouteHealthStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileRouteHealthStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "route_health".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl RouteHealthStore for JsonFileRouteHealthStore {
    async fn load(&self) -> DispatchResult<RouteHealthDocument> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let document: RouteHealthDocument = serde_json::from_slice(&bytes).map_err(|e| {
                    DispatchError::Serialization(format!(
                        "解析线路健康文档 {} 失败: {e}",
                        self.path.display()
                    ))
                })?;
                info!("从 {} 加载了 {} 条线路健康记录", self.path.display(), document.len());
                Ok(document)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("线路健康文档 {} 不存在，使用空文档", self.path.display());
                Ok(RouteHealthDocument::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, document: &RouteHealthDocument) -> DispatchResult<()> {
        let bytes = serde_json::to_vec_pretty(document)?;

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp = self.temp_path();
        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp, &self.path).await.map_err(|e| {
            DispatchError::storage(format!(
                "替换线路健康文档 {} 失败: {e}",
                self.path.display()
            ))
        })?;
        Ok(())
    }
}

/// 内存线路健康存储
///
/// 多个线路管理器共享同一个 `Arc` 即可模拟进程重启后的重新加载。
#[derive(Debug, Default)]
pub struct InMemoryRouteHealthStore {
    document: Mutex<RouteHealthDocument>,
}

impl InMemoryRouteHealthStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(document: RouteHealthDocument) -> Self {
        Self {
            document: Mutex::new(document),
        }
    }
}

#[async_trait]
impl RouteHealthStore for InMemoryRouteHealthStore {
    async fn load(&self) -> DispatchResult<RouteHealthDocument> {
        Ok(self.document.lock().await.clone())
    }

    async fn save(&self, document: &RouteHealthDocument) -> DispatchResult<()> {
        *self.document.lock().await = document.clone();
        Ok(())
    }
}
