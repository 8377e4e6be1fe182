//! 消息代理边界
//!
//! 投递管道通过 [`MessagePublisher`] 发布，入站分发器通过 [`BrokerConsumer`] 消费。
//! 生产环境使用 Kafka 实现，单元测试与单节点部署使用内存实现。

mod kafka;
mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use kafka::{KafkaPartitionConsumer, KafkaPublisher};
pub use memory::{MemoryBroker, MemoryConsumer};

/// 待发布记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRecord {
    pub topic: String,
    /// 分区 key（目标节点 ID），同一 key 的记录保持发布顺序
    pub key: String,
    /// 显式分区；None 时由代理按 key 分区
    pub partition: Option<i32>,
    pub payload: Vec<u8>,
}

impl OutboundRecord {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            partition: None,
            payload,
        }
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }
}

/// 已消费记录（携带提交所需的位置）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRecord {
    pub topic: String,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub partition: i32,
    pub offset: i64,
}

#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, record: OutboundRecord) -> Result<()>;
}

#[async_trait]
pub trait BrokerConsumer: Send + Sync {
    /// 读取一条记录；等待超过 `timeout` 返回 `Ok(None)`
    async fn recv(&self, timeout: Duration) -> Result<Option<InboundRecord>>;

    /// 提交消费位置
    async fn commit(&self, record: &InboundRecord) -> Result<()>;
}
