//! 网关入口
//!
//! 客户端上行的原始帧在这里解码、校验、分配消息 ID 与会话序列号，然后交给投递管道。
//! 每种入口处理器实现 [`MessageHandler`]，没有默认实现可以回退。

use std::sync::Arc;

use async_trait::async_trait;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::delivery::{DeliveryOutcome, DeliveryPipeline};
use crate::error::Result;
use crate::idgen::{ConversationSequencer, SnowflakeGenerator};
use crate::message::MessageEnvelope;

/// 入口消息处理契约
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// 处理一帧原始上行数据
    ///
    /// 解码或校验失败以错误返回，消息不会进入投递管道。
    async fn handle(&self, cancel: &CancellationToken, raw: &[u8]) -> Result<DeliveryOutcome>;
}

pub struct GatewayIngress {
    node_id: String,
    pipeline: Arc<DeliveryPipeline>,
    snowflake: Arc<SnowflakeGenerator>,
    sequencer: Arc<ConversationSequencer>,
}

impl GatewayIngress {
    pub fn new(
        node_id: impl Into<String>,
        pipeline: Arc<DeliveryPipeline>,
        snowflake: Arc<SnowflakeGenerator>,
        sequencer: Arc<ConversationSequencer>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            pipeline,
            snowflake,
            sequencer,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// 时钟回拨时雪花生成器会阻塞等待，多线程运行时下先让出工作线程
    fn next_message_id(&self) -> i64 {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.snowflake.next_id())
            }
            _ => self.snowflake.next_id(),
        }
    }

    /// 补全消息 ID 与会话序列号（客户端已携带的值保持不变）
    async fn stamp(&self, cancel: &CancellationToken, message: &mut MessageEnvelope) -> Result<()> {
        if message.message_id.is_none() {
            message.message_id = Some(self.next_message_id());
        }
        if message.seq.is_none() {
            let seq = self
                .sequencer
                .next_seq(cancel, &message.sender_id, &message.receiver_id)
                .await?;
            message.seq = Some(seq);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for GatewayIngress {
    async fn handle(&self, cancel: &CancellationToken, raw: &[u8]) -> Result<DeliveryOutcome> {
        let mut message = MessageEnvelope::decode(raw).inspect_err(|e| {
            warn!(node_id = %self.node_id, error = %e, "Rejected inbound envelope");
        })?;

        self.stamp(cancel, &mut message).await?;
        debug!(
            sender_id = %message.sender_id,
            receiver_id = %message.receiver_id,
            message_id = ?message.message_id,
            seq = ?message.seq,
            "Inbound message accepted"
        );

        self.pipeline.deliver(cancel, &message, &self.node_id).await
    }
}
