use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use taskgate_core::{DeadLetterRecord, DeadLetterStore, DispatchError, DispatchResult};

/// JSON Lines 死信日志
///
/// 每条记录一行，只追加；写入后 `sync_data` 才返回。
/// 读取时跳过无法解析的行（通常是崩溃时写了一半的最后一行）；
/// 追加前如果发现文件末尾没有换行，先补一个换行，新记录不会接在残行后面。
#[derive(Debug)]
pub struct JsonLinesDeadLetterStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesDeadLetterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DeadLetterStore for JsonLinesDeadLetterStore {
    async fn append(&self, record: &DeadLetterRecord) -> DispatchResult<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                DispatchError::storage(format!("打开死信文件 {} 失败: {e}", self.path.display()))
            })?;
        if file.metadata().await?.len() > 0 {
            file.seek(SeekFrom::End(-1)).await?;
            let mut last = [0u8; 1];
            file.read_exact(&mut last).await?;
            if last[0] != b'\n' {
                warn!("死信文件 {} 末尾有未完成的记录，另起一行追加", self.path.display());
                line.insert(0, '\n');
            }
        }
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;

        debug!("死信已写入 {}: 任务 {}", self.path.display(), record.task.id);
        Ok(())
    }

    async fn list(&self) -> DispatchResult<Vec<DeadLetterRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    "跳过无法解析的死信记录 {}:{}: {}",
                    self.path.display(),
                    index + 1,
                    e
                ),
            }
        }
        Ok(records)
    }
}

/// 内存死信存储，用于测试和嵌入式场景
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    records: Mutex<Vec<DeadLetterRecord>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn append(&self, record: &DeadLetterRecord) -> DispatchResult<()> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }

    async fn list(&self) -> DispatchResult<Vec<DeadLetterRecord>> {
        Ok(self.records.lock().await.clone())
    }
}
