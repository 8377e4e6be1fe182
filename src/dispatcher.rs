//! 入站分发器
//!
//! 消费本节点所属分区，把消息写入本地连接。每条记录在投递尝试之后都会提交位置，
//! 无论结果如何：语义为至少一次、尽力而为。本地写入与死信发布都失败的消息
//! 只记录日志和指标，然后丢弃。

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{BrokerConsumer, InboundRecord};
use crate::connection::ConnectionRegistry;
use crate::delivery::{DEFAULT_LOCAL_WRITE_TIMEOUT, DeadLetterReason, DeadLetterSink, write_local};
use crate::error::Result;
use crate::message::MessageEnvelope;
use crate::metrics::RouteMetrics;
use crate::presence::PresenceDirectory;

/// 读取失败（非超时）后的退避
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// 单条记录的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    /// 同分区上属于其他节点的记录
    Skipped,
    DeadLettered(DeadLetterReason),
    /// 死信发布也失败，消息丢失
    Lost(DeadLetterReason),
}

pub struct InboundDispatcher {
    consumer: Arc<dyn BrokerConsumer>,
    presence: Arc<PresenceDirectory>,
    registry: Arc<ConnectionRegistry>,
    dead_letter: Arc<DeadLetterSink>,
    read_timeout: Duration,
    write_timeout: Duration,
    metrics: Arc<RouteMetrics>,
}

impl InboundDispatcher {
    pub fn new(
        consumer: Arc<dyn BrokerConsumer>,
        presence: Arc<PresenceDirectory>,
        registry: Arc<ConnectionRegistry>,
        dead_letter: Arc<DeadLetterSink>,
        read_timeout: Duration,
        metrics: Arc<RouteMetrics>,
    ) -> Self {
        Self {
            consumer,
            presence,
            registry,
            dead_letter,
            read_timeout,
            write_timeout: DEFAULT_LOCAL_WRITE_TIMEOUT,
            metrics,
        }
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// 分发循环，取消信号触发后处理完当前记录再退出
    pub async fn run(&self, cancel: CancellationToken, self_node_id: &str) -> Result<()> {
        info!(node_id = %self_node_id, "Inbound dispatcher started");

        loop {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = self.consumer.recv(self.read_timeout) => res,
            };

            let record = match received {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "Inbound read failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                    }
                    continue;
                }
            };

            // 已读出的记录不受取消影响，完整处理并提交
            self.dispatch(&record, self_node_id).await;
        }

        info!(node_id = %self_node_id, "Inbound dispatcher stopped");
        Ok(())
    }

    /// 处理一条记录并提交位置
    pub async fn dispatch(&self, record: &InboundRecord, self_node_id: &str) -> DispatchOutcome {
        self.metrics.dispatcher_consumed_total.inc();
        let outcome = self.handle(record, self_node_id).await;

        if let Err(e) = self.consumer.commit(record).await {
            warn!(
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "Failed to commit inbound offset"
            );
        }
        outcome
    }

    async fn handle(&self, record: &InboundRecord, self_node_id: &str) -> DispatchOutcome {
        if let Some(key) = record.key.as_deref() {
            if key != self_node_id {
                self.metrics.dispatcher_skipped_total.inc();
                debug!(
                    key = %key,
                    node_id = %self_node_id,
                    offset = record.offset,
                    "Record addressed to another node on shared partition, skipping"
                );
                return DispatchOutcome::Skipped;
            }
        }

        let message = match MessageEnvelope::decode(&record.payload) {
            Ok(message) => message,
            Err(e) => {
                self.metrics.dispatcher_decode_failure_total.inc();
                warn!(
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Failed to decode inbound record"
                );
                let key = record.key.as_deref().unwrap_or_default();
                return self
                    .divert(key, record.payload.clone(), DeadLetterReason::DecodeFailed)
                    .await;
            }
        };

        // 分发器自身的读取不跟随关停取消，由存储超时约束
        let lookup_cancel = CancellationToken::new();
        let presence = match self.presence.get(&lookup_cancel, &message.receiver_id).await {
            Ok(Some(presence)) if presence.is_online() => presence,
            Ok(_) => {
                return self
                    .divert(&message.receiver_id, record.payload.clone(), DeadLetterReason::PresenceMiss)
                    .await;
            }
            Err(e) => {
                warn!(receiver_id = %message.receiver_id, error = %e, "Presence lookup failed");
                return self
                    .divert(
                        &message.receiver_id,
                        record.payload.clone(),
                        DeadLetterReason::PresenceUnavailable,
                    )
                    .await;
            }
        };

        if presence.node_id != self_node_id {
            debug!(
                receiver_id = %message.receiver_id,
                owner = %presence.node_id,
                node_id = %self_node_id,
                "Recipient no longer attached to this node"
            );
            return self
                .divert(&message.receiver_id, record.payload.clone(), DeadLetterReason::NotLocal)
                .await;
        }

        let written = write_local(
            &lookup_cancel,
            &self.registry,
            &presence,
            Bytes::from(record.payload.clone()),
            self.write_timeout,
        )
        .await
        .unwrap_or(Err(DeadLetterReason::LocalWriteFailed));
        match written {
            Ok(()) => {
                self.metrics.delivered_local_total.inc();
                DispatchOutcome::Delivered
            }
            Err(reason) => {
                self.divert(&message.receiver_id, record.payload.clone(), reason)
                    .await
            }
        }
    }

    async fn divert(&self, key: &str, payload: Vec<u8>, reason: DeadLetterReason) -> DispatchOutcome {
        // 死信发布失败已由死信出口记录为数据丢失
        match self.dead_letter.divert(key, payload, reason).await {
            Ok(()) => DispatchOutcome::DeadLettered(reason),
            Err(_) => DispatchOutcome::Lost(reason),
        }
    }
}
