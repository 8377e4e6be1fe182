//! 集群共享存储
//!
//! 在线状态与会话序列号共用的键值存储抽象。所有调用都是网络 I/O，
//! 必须遵守调用方的取消信号与超时。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{Result, RouteError};

#[async_trait]
pub trait SharedStore: Send + Sync {
    /// 写入；`ttl` 为 None 表示不过期
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn del(&self, key: &str) -> Result<()>;

    /// 原子自增，返回自增后的值
    async fn incr(&self, key: &str) -> Result<i64>;
}

/// 在取消信号与超时约束下执行一次存储调用
///
/// 取消返回 `Cancelled`，超时返回 `Timeout`，二者可区分。
pub async fn bounded<T, F>(cancel: &CancellationToken, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RouteError::Cancelled),
        res = tokio::time::timeout(timeout, fut) => match res {
            Ok(inner) => inner,
            Err(_) => Err(RouteError::Timeout(timeout)),
        },
    }
}

/// Redis 实现
#[derive(Clone)]
pub struct RedisSharedStore {
    connection: ConnectionManager,
}

impl RedisSharedStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let connection = client.get_connection_manager().await?;
        info!(url = %redis_url, "Connected to redis shared store");
        Ok(Self { connection })
    }

    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl SharedStore for RedisSharedStore {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection.clone();
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection.clone();
        let value: i64 = conn.incr(key, 1).await?;
        Ok(value)
    }
}

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

/// 进程内实现（单节点部署与测试）
///
/// 支持注入故障与延迟，用于模拟存储不可达。
#[derive(Default, Clone)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, MemoryEntry>>>,
    failing: Arc<AtomicBool>,
    latency: Arc<std::sync::Mutex<Option<Duration>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 开启后所有调用返回 `Store` 错误
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// 为每次调用注入固定延迟
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self
            .latency
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = latency;
    }

    async fn simulate(&self) -> Result<()> {
        let latency = *self
            .latency
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(RouteError::Store("memory store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.simulate().await?;
        self.entries.write().await.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.simulate().await?;
        let entries = self.entries.read().await;
        Ok(entries.get(key).and_then(|entry| match entry.expires_at {
            Some(deadline) if deadline <= Instant::now() => None,
            _ => Some(entry.value.clone()),
        }))
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.simulate().await?;
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.simulate().await?;
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.to_string()).or_insert(MemoryEntry {
            value: "0".to_string(),
            expires_at: None,
        });
        let current: i64 = entry
            .value
            .parse()
            .map_err(|_| RouteError::Store(format!("value at {key} is not an integer")))?;
        let next = current + 1;
        entry.value = next.to_string();
        Ok(next)
    }
}
