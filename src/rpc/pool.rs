//! 出站 RPC 连接池
//!
//! 按地址分桶管理通道：`idle -> in-use`（获取）`-> idle`（归还）`-> evicted`
//! （空闲超时后由回收任务关闭）。桶映射由池级读写锁保护，单个通道的使用状态由各自的锁保护。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ChannelConnector;
use crate::config::RpcPoolConfig;
use crate::error::{Result, RouteError};
use crate::metrics::RouteMetrics;

/// 从池中借出的通道
#[derive(Debug, Clone)]
pub struct PooledChannel<C> {
    id: u64,
    address: String,
    channel: C,
}

impl<C> PooledChannel<C> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn into_inner(self) -> C {
        self.channel
    }
}

struct EntryState {
    in_use: bool,
    last_used: Instant,
}

struct PooledEntry<C> {
    id: u64,
    channel: C,
    state: Mutex<EntryState>,
}

impl<C> PooledEntry<C> {
    fn state(&self) -> std::sync::MutexGuard<'_, EntryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 空闲时标记为使用中
    fn try_claim(&self) -> bool {
        let mut state = self.state();
        if state.in_use {
            return false;
        }
        state.in_use = true;
        state.last_used = Instant::now();
        true
    }
}

struct Bucket<C> {
    entries: Vec<Arc<PooledEntry<C>>>,
    /// 正在建立中的连接数，计入容量
    connecting: usize,
}

impl<C> Default for Bucket<C> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            connecting: 0,
        }
    }
}

pub struct RpcConnectionPool<K: ChannelConnector> {
    connector: Arc<K>,
    buckets: RwLock<HashMap<String, Bucket<K::Channel>>>,
    max_per_address: usize,
    idle_timeout: Duration,
    next_id: AtomicU64,
    closed: AtomicBool,
    shutdown: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<RouteMetrics>,
}

impl<K: ChannelConnector> RpcConnectionPool<K> {
    /// 创建连接池并启动空闲回收任务
    pub fn new(connector: K, config: &RpcPoolConfig, metrics: Arc<RouteMetrics>) -> Arc<Self> {
        let pool = Arc::new(Self {
            connector: Arc::new(connector),
            buckets: RwLock::new(HashMap::new()),
            max_per_address: config.max_conn_per_address.max(1),
            idle_timeout: config.idle_timeout(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            reaper: Mutex::new(None),
            metrics,
        });

        let handle = Self::spawn_reaper(Arc::downgrade(&pool), pool.shutdown.clone(), config.reap_interval());
        *pool
            .reaper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);

        info!(
            max_per_address = pool.max_per_address,
            idle_timeout_ms = pool.idle_timeout.as_millis() as u64,
            reap_interval_ms = config.reap_interval_ms,
            "RPC connection pool started"
        );
        pool
    }

    fn spawn_reaper(pool: Weak<Self>, shutdown: CancellationToken, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // 跳过立即触发的第一次 tick
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let Some(pool) = pool.upgrade() else {
                    return;
                };
                pool.reap_idle().await;
            }
        })
    }

    /// 获取指定地址的通道
    ///
    /// 优先复用空闲通道；否则未达上限时新建；否则返回 `PoolExhausted`。
    pub async fn acquire(&self, address: &str) -> Result<PooledChannel<K::Channel>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RouteError::PoolClosed);
        }

        {
            let buckets = self.buckets.read().await;
            if let Some(found) = buckets.get(address).and_then(|b| Self::claim_idle(address, b)) {
                return Ok(found);
            }
        }

        {
            let mut buckets = self.buckets.write().await;
            let bucket = buckets.entry(address.to_string()).or_default();
            if let Some(found) = Self::claim_idle(address, bucket) {
                return Ok(found);
            }
            if bucket.entries.len() + bucket.connecting >= self.max_per_address {
                self.metrics.rpc_pool_exhausted_total.inc();
                warn!(address = %address, max = self.max_per_address, "RPC connection pool exhausted");
                return Err(RouteError::PoolExhausted {
                    address: address.to_string(),
                    max: self.max_per_address,
                });
            }
            bucket.connecting += 1;
        }

        let connected = self.connector.connect(address).await;

        let mut buckets = self.buckets.write().await;
        let bucket = buckets.entry(address.to_string()).or_default();
        bucket.connecting = bucket.connecting.saturating_sub(1);

        let channel = match connected {
            Ok(channel) => channel,
            Err(e) => {
                if bucket.entries.is_empty() && bucket.connecting == 0 {
                    buckets.remove(address);
                }
                warn!(address = %address, error = %e, "Failed to open rpc channel");
                return Err(e);
            }
        };

        if self.closed.load(Ordering::Acquire) {
            drop(buckets);
            self.connector.close(channel).await;
            return Err(RouteError::PoolClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        bucket.entries.push(Arc::new(PooledEntry {
            id,
            channel: channel.clone(),
            state: Mutex::new(EntryState {
                in_use: true,
                last_used: Instant::now(),
            }),
        }));
        let size = bucket.entries.len();
        self.metrics.rpc_pool_channels.inc();
        debug!(address = %address, channel_id = id, size, "Opened new rpc channel");

        Ok(PooledChannel {
            id,
            address: address.to_string(),
            channel,
        })
    }

    fn claim_idle(address: &str, bucket: &Bucket<K::Channel>) -> Option<PooledChannel<K::Channel>> {
        bucket
            .entries
            .iter()
            .find(|entry| entry.try_claim())
            .map(|entry| PooledChannel {
                id: entry.id,
                address: address.to_string(),
                channel: entry.channel.clone(),
            })
    }

    /// 归还通道
    pub async fn release(&self, address: &str, channel: &PooledChannel<K::Channel>) -> Result<()> {
        let buckets = self.buckets.read().await;
        let entry = buckets
            .get(address)
            .and_then(|bucket| bucket.entries.iter().find(|entry| entry.id == channel.id));

        match entry {
            Some(entry) => {
                let mut state = entry.state();
                state.in_use = false;
                state.last_used = Instant::now();
                Ok(())
            }
            None => Err(RouteError::ChannelNotPooled {
                address: address.to_string(),
            }),
        }
    }

    /// 指定地址的通道数量
    pub async fn connection_count(&self, address: &str) -> usize {
        self.buckets
            .read()
            .await
            .get(address)
            .map(|bucket| bucket.entries.len())
            .unwrap_or_default()
    }

    /// 关闭空闲超时的通道并移除空桶，返回关闭数量
    pub async fn reap_idle(&self) -> usize {
        let mut evicted = Vec::new();
        {
            let mut buckets = self.buckets.write().await;
            for (address, bucket) in buckets.iter_mut() {
                bucket.entries.retain(|entry| {
                    let state = entry.state();
                    let expired = !state.in_use && state.last_used.elapsed() > self.idle_timeout;
                    if expired {
                        debug!(address = %address, channel_id = entry.id, "Closing idle rpc channel");
                        evicted.push(entry.clone());
                    }
                    !expired
                });
            }
            buckets.retain(|_, bucket| !bucket.entries.is_empty() || bucket.connecting > 0);
        }

        let count = evicted.len();
        for entry in evicted {
            self.metrics.rpc_pool_channels.dec();
            self.connector.close(entry.channel.clone()).await;
        }
        if count > 0 {
            info!(closed = count, "Reaped idle rpc channels");
        }
        count
    }

    /// 停止回收任务并关闭全部通道
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();
        let reaper = self
            .reaper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = reaper {
            let _ = handle.await;
        }

        let drained: Vec<(String, Bucket<K::Channel>)> = self.buckets.write().await.drain().collect();
        let mut closed = 0;
        for (_, bucket) in drained {
            for entry in bucket.entries {
                self.metrics.rpc_pool_channels.dec();
                self.connector.close(entry.channel.clone()).await;
                closed += 1;
            }
        }
        info!(closed, "RPC connection pool closed");
        Ok(())
    }
}
