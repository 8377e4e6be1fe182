//! 在线状态目录
//!
//! 记录用户当前挂在哪个节点上。写入同时落到本地缓存与集群共享存储；
//! 读取优先命中本地缓存，未命中再读共享存储并回填。
//!
//! 其他节点写入不会主动失效本地缓存，因此本地条目带 TTL，
//! 过期后强制回源，陈旧窗口不超过 `local_ttl_ms`。

pub mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::PresenceConfig;
use crate::error::{Result, RouteError};
use crate::metrics::RouteMetrics;
use store::{SharedStore, bounded};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// 用户在线记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    /// 所在节点 ID
    pub node_id: String,
    /// 所在节点地址
    pub node_address: String,
    /// 客户端远端地址
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    pub status: PresenceStatus,
    /// 更新时间（毫秒）
    pub updated_at: i64,
}

impl PresenceRecord {
    pub fn online(
        user_id: impl Into<String>,
        node_id: impl Into<String>,
        node_address: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            node_id: node_id.into(),
            node_address: node_address.into(),
            remote_addr: None,
            status: PresenceStatus::Online,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_remote_addr(mut self, remote_addr: impl Into<String>) -> Self {
        self.remote_addr = Some(remote_addr.into());
        self
    }

    pub fn is_online(&self) -> bool {
        self.status == PresenceStatus::Online
    }

    /// 本地连接注册表中的 key：有远端地址时用远端地址，否则用用户 ID
    pub fn connection_key(&self) -> &str {
        self.remote_addr.as_deref().unwrap_or(&self.user_id)
    }
}

#[derive(Clone)]
struct CachedPresence {
    record: PresenceRecord,
    cached_at: Instant,
}

/// 带 TTL 的本地缓存
struct PresenceCache {
    entries: RwLock<HashMap<String, CachedPresence>>,
    ttl: Duration,
    max_size: usize,
}

impl PresenceCache {
    fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_size: max_size.max(1),
        }
    }

    async fn get(&self, user_id: &str) -> Option<PresenceRecord> {
        let entries = self.entries.read().await;
        let entry = entries.get(user_id)?;
        if entry.cached_at.elapsed() < self.ttl {
            Some(entry.record.clone())
        } else {
            debug!(user_id = %user_id, "Presence cache entry expired");
            None
        }
    }

    async fn insert(&self, record: PresenceRecord) {
        let mut entries = self.entries.write().await;
        if entries.len() >= self.max_size && !entries.contains_key(&record.user_id) {
            Self::evict_expired(&mut entries, self.ttl);
            if entries.len() >= self.max_size {
                Self::evict_oldest(&mut entries, self.max_size / 2);
            }
        }
        entries.insert(
            record.user_id.clone(),
            CachedPresence {
                record,
                cached_at: Instant::now(),
            },
        );
    }

    async fn remove(&self, user_id: &str) {
        self.entries.write().await.remove(user_id);
    }

    async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        Self::evict_expired(&mut entries, self.ttl)
    }

    async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    fn evict_expired(entries: &mut HashMap<String, CachedPresence>, ttl: Duration) -> usize {
        let before = entries.len();
        entries.retain(|_, entry| entry.cached_at.elapsed() < ttl);
        before - entries.len()
    }

    /// 淘汰最旧条目直到剩余 `target` 个
    fn evict_oldest(entries: &mut HashMap<String, CachedPresence>, target: usize) {
        if entries.len() <= target {
            return;
        }
        let mut by_age: Vec<(String, Instant)> = entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.cached_at))
            .collect();
        by_age.sort_by_key(|(_, cached_at)| *cached_at);

        let remove_count = entries.len() - target;
        for (key, _) in by_age.into_iter().take(remove_count) {
            entries.remove(&key);
        }
        warn!(
            removed_count = remove_count,
            remaining_size = entries.len(),
            "Presence cache full, evicted oldest entries"
        );
    }
}

/// 在线状态目录
pub struct PresenceDirectory {
    store: Arc<dyn SharedStore>,
    cache: PresenceCache,
    key_prefix: String,
    record_ttl: Option<Duration>,
    store_timeout: Duration,
    metrics: Arc<RouteMetrics>,
}

impl PresenceDirectory {
    pub fn new(store: Arc<dyn SharedStore>, config: &PresenceConfig, metrics: Arc<RouteMetrics>) -> Self {
        Self {
            store,
            cache: PresenceCache::new(
                Duration::from_millis(config.local_ttl_ms),
                config.local_max_entries,
            ),
            key_prefix: config.key_prefix.clone(),
            record_ttl: (config.record_ttl_secs > 0)
                .then(|| Duration::from_secs(config.record_ttl_secs)),
            store_timeout: Duration::from_millis(config.store_timeout_ms),
            metrics,
        }
    }

    fn key(&self, user_id: &str) -> String {
        format!("{}{}", self.key_prefix, user_id)
    }

    /// 写入在线记录（共享存储 + 本地缓存）
    ///
    /// 共享存储写入失败时本地缓存不更新。
    pub async fn put(&self, cancel: &CancellationToken, record: PresenceRecord) -> Result<()> {
        let payload = serde_json::to_string(&record)?;
        let key = self.key(&record.user_id);
        bounded(
            cancel,
            self.store_timeout,
            self.store.set(&key, &payload, self.record_ttl),
        )
        .await?;

        debug!(
            user_id = %record.user_id,
            node_id = %record.node_id,
            status = ?record.status,
            "Presence record written"
        );
        self.cache.insert(record).await;
        Ok(())
    }

    /// 查询在线记录
    ///
    /// 返回 `Ok(None)` 表示共享存储中没有该用户。
    pub async fn get(&self, cancel: &CancellationToken, user_id: &str) -> Result<Option<PresenceRecord>> {
        if let Some(record) = self.cache.get(user_id).await {
            self.metrics.presence_cache_hit_total.inc();
            return Ok(Some(record));
        }
        self.metrics.presence_cache_miss_total.inc();

        let key = self.key(user_id);
        let Some(payload) = bounded(cancel, self.store_timeout, self.store.get(&key)).await? else {
            return Ok(None);
        };

        let record: PresenceRecord = serde_json::from_str(&payload).map_err(|e| {
            warn!(user_id = %user_id, error = %e, "Malformed presence record in shared store");
            RouteError::Codec(e)
        })?;
        self.cache.insert(record.clone()).await;
        Ok(Some(record))
    }

    /// 查询在线用户；不存在或离线返回 `PresenceMiss`
    pub async fn resolve_online(&self, cancel: &CancellationToken, user_id: &str) -> Result<PresenceRecord> {
        match self.get(cancel, user_id).await? {
            Some(record) if record.is_online() => Ok(record),
            _ => Err(RouteError::PresenceMiss {
                user_id: user_id.to_string(),
            }),
        }
    }

    /// 清除在线记录
    pub async fn clear(&self, cancel: &CancellationToken, user_id: &str) -> Result<()> {
        let key = self.key(user_id);
        bounded(cancel, self.store_timeout, self.store.del(&key)).await?;
        self.cache.remove(user_id).await;
        debug!(user_id = %user_id, "Presence record cleared");
        Ok(())
    }

    /// 仅失效本地缓存（收到其他节点的变更通知时调用）
    pub async fn invalidate(&self, user_id: &str) {
        self.cache.remove(user_id).await;
    }

    pub async fn cached_entries(&self) -> usize {
        self.cache.len().await
    }

    /// 启动本地缓存过期清理任务
    pub fn spawn_cache_janitor(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let directory = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let purged = directory.cache.purge_expired().await;
                if purged > 0 {
                    debug!(purged, "Purged expired presence cache entries");
                }
            }
        })
    }
}
