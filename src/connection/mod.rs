//! 本地连接注册表
//!
//! 记录本节点上的活跃客户端连接（按用户 key 索引），容量有上限。
//! 不同 key 的注册 / 查询 / 释放互不阻塞；同一 key 的修改在 DashMap 分片锁内串行。

mod transport;

pub use transport::{ChannelTransport, TransportReceiver};

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, warn};

use crate::error::{Result, RouteError};
use crate::metrics::RouteMetrics;

/// 客户端连接传输层（WebSocket 等握手层实现）
#[async_trait]
pub trait ConnectionTransport: Send + Sync {
    /// 向客户端写入一帧
    async fn send(&self, payload: Bytes) -> Result<()>;

    /// 关闭连接
    async fn close(&self);

    /// 客户端远端地址
    fn remote_addr(&self) -> &str;
}

/// 已注册的连接
pub struct Connection {
    user_key: String,
    connection_id: u64,
    transport: Arc<dyn ConnectionTransport>,
    last_active_ms: AtomicI64,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("user_key", &self.user_key)
            .field("connection_id", &self.connection_id)
            .field("remote_addr", &self.remote_addr())
            .finish()
    }
}

impl Connection {
    pub fn user_key(&self) -> &str {
        &self.user_key
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn remote_addr(&self) -> &str {
        self.transport.remote_addr()
    }

    /// 最后活跃时间（毫秒）
    pub fn last_active_ms(&self) -> i64 {
        self.last_active_ms.load(Ordering::Relaxed)
    }

    /// 标记活跃（收到客户端帧时调用）
    pub fn touch(&self) {
        self.last_active_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// 写入负载
    pub async fn send(&self, payload: Bytes) -> Result<()> {
        self.transport.send(payload).await?;
        self.touch();
        Ok(())
    }
}

/// 本地连接注册表
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
    count: AtomicUsize,
    max: usize,
    next_id: AtomicU64,
    metrics: Arc<RouteMetrics>,
}

impl ConnectionRegistry {
    pub fn new(max: usize, metrics: Arc<RouteMetrics>) -> Self {
        Self {
            connections: DashMap::new(),
            count: AtomicUsize::new(0),
            max,
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    /// 注册连接
    ///
    /// 同一 key 重复注册时替换旧连接（不占用新容量），旧连接被关闭；
    /// 新 key 在注册表已满时返回 `RegistryFull`，状态不变。
    pub async fn register(
        &self,
        user_key: &str,
        transport: Arc<dyn ConnectionTransport>,
    ) -> Result<Arc<Connection>> {
        let connection = Arc::new(Connection {
            user_key: user_key.to_string(),
            connection_id: self.next_id.fetch_add(1, Ordering::Relaxed),
            transport,
            last_active_ms: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
        });

        let replaced = match self.connections.entry(user_key.to_string()) {
            Entry::Occupied(mut occupied) => Some(occupied.insert(connection.clone())),
            Entry::Vacant(vacant) => {
                let reserved = self
                    .count
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                        (current < self.max).then_some(current + 1)
                    })
                    .is_ok();
                if !reserved {
                    self.metrics.registry_rejected_total.inc();
                    warn!(
                        user_key = %user_key,
                        max = self.max,
                        "Connection registry full, registration rejected"
                    );
                    return Err(RouteError::RegistryFull { max: self.max });
                }
                vacant.insert(connection.clone());
                None
            }
        };

        self.metrics.registry_connections.set(self.count() as i64);

        if let Some(old) = replaced {
            debug!(
                user_key = %user_key,
                old_connection_id = old.connection_id,
                new_connection_id = connection.connection_id,
                "Connection replaced, closing previous transport"
            );
            old.transport.close().await;
        }

        info!(
            user_key = %user_key,
            connection_id = connection.connection_id,
            remote_addr = %connection.remote_addr(),
            count = self.count(),
            "Connection registered"
        );
        Ok(connection)
    }

    /// 释放连接（不存在时为空操作）
    pub fn release(&self, user_key: &str) -> bool {
        let removed = self.connections.remove(user_key).is_some();
        if removed {
            self.count.fetch_sub(1, Ordering::AcqRel);
            self.metrics.registry_connections.set(self.count() as i64);
            debug!(user_key = %user_key, count = self.count(), "Connection released");
        }
        removed
    }

    /// 仅当当前注册的是指定连接时释放
    ///
    /// 断线清理使用该方法，避免旧连接的断开事件误删重连后的新连接。
    pub fn release_connection(&self, user_key: &str, connection_id: u64) -> bool {
        let removed = self
            .connections
            .remove_if(user_key, |_, conn| conn.connection_id == connection_id)
            .is_some();
        if removed {
            self.count.fetch_sub(1, Ordering::AcqRel);
            self.metrics.registry_connections.set(self.count() as i64);
        }
        removed
    }

    /// 查询连接
    pub fn lookup(&self, user_key: &str) -> Option<Arc<Connection>> {
        self.connections
            .get(user_key)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// 当前连接数
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// 关闭并驱逐全部连接
    pub async fn close_all(&self) {
        let keys: Vec<String> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut drained = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, conn)) = self.connections.remove(&key) {
                drained.push(conn);
            }
        }
        // 快照之后注册的连接不在本次驱逐范围内，只扣除实际移除的数量
        self.count.fetch_sub(drained.len(), Ordering::AcqRel);
        self.metrics.registry_connections.set(self.count() as i64);

        for conn in &drained {
            conn.transport.close().await;
        }

        info!(closed = drained.len(), "Connection registry drained");
    }
}
