//! 进程内消息代理
//!
//! 记录所有发布，支持按主题注入发布失败；消费端从内存队列读取并记录提交位置。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{BrokerConsumer, InboundRecord, MessagePublisher, OutboundRecord};
use crate::error::{Result, RouteError};

#[derive(Default)]
struct BrokerState {
    published: Vec<OutboundRecord>,
    attempts: HashMap<String, usize>,
    failures: HashMap<String, usize>,
}

/// 内存生产者
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 让该主题接下来的 `count` 次发布失败
    pub fn fail_next(&self, topic: &str, count: usize) {
        self.lock().failures.insert(topic.to_string(), count);
    }

    /// 该主题所有发布均失败
    pub fn fail_always(&self, topic: &str) {
        self.fail_next(topic, usize::MAX);
    }

    /// 成功发布到该主题的记录
    pub fn published(&self, topic: &str) -> Vec<OutboundRecord> {
        self.lock()
            .published
            .iter()
            .filter(|record| record.topic == topic)
            .cloned()
            .collect()
    }

    /// 对该主题的发布尝试次数（含失败）
    pub fn attempts(&self, topic: &str) -> usize {
        self.lock().attempts.get(topic).copied().unwrap_or_default()
    }
}

#[async_trait]
impl MessagePublisher for MemoryBroker {
    async fn publish(&self, record: OutboundRecord) -> Result<()> {
        let mut state = self.lock();
        *state.attempts.entry(record.topic.clone()).or_default() += 1;
        if let Some(remaining) = state.failures.get_mut(&record.topic) {
            if *remaining > 0 {
                if *remaining != usize::MAX {
                    *remaining -= 1;
                }
                return Err(RouteError::Broker(format!(
                    "simulated publish failure on {}",
                    record.topic
                )));
            }
        }
        state.published.push(record);
        Ok(())
    }
}

/// 内存消费者
#[derive(Clone, Default)]
pub struct MemoryConsumer {
    queue: Arc<Mutex<VecDeque<InboundRecord>>>,
    committed: Arc<Mutex<Vec<(i32, i64)>>>,
    notify: Arc<Notify>,
}

impl MemoryConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 投入一条待消费记录
    pub fn push(&self, record: InboundRecord) {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(record);
        self.notify.notify_one();
    }

    /// 已提交的 (分区, 位置)
    pub fn committed(&self) -> Vec<(i32, i64)> {
        self.committed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn pending(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn pop(&self) -> Option<InboundRecord> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn recv(&self, timeout: Duration) -> Result<Option<InboundRecord>> {
        if let Some(record) = self.pop() {
            return Ok(Some(record));
        }
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
        Ok(self.pop())
    }

    async fn commit(&self, record: &InboundRecord) -> Result<()> {
        self.committed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((record.partition, record.offset));
        Ok(())
    }
}
