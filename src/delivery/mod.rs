//! 可靠投递管道
//!
//! 1. 查询接收方在线状态，不存在或离线转死信
//! 2. 接收方在本节点：直接写本地连接，连接缺失或写失败转死信（不在本地重试）
//! 3. 接收方在其他节点：以目标节点 ID 为 key 发布到消息代理，失败按退避重试，
//!    重试耗尽转死信
//!
//! 一条消息要么写入一次本地连接，要么发布一次到主主题或死信主题，不会两者兼有。

mod dead_letter;
mod retry;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use dead_letter::{DeadLetterReason, DeadLetterSink};
pub use retry::RetryPolicy;

use crate::balancer::PartitionSelector;
use crate::broker::{MessagePublisher, OutboundRecord};
use crate::connection::ConnectionRegistry;
use crate::error::{Result, RouteError};
use crate::message::MessageEnvelope;
use crate::metrics::RouteMetrics;
use crate::presence::{PresenceDirectory, PresenceRecord};

/// 投递结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// 已写入本地连接
    LocalWrite,
    /// 已发布到目标节点的分区
    RemotePublished {
        node_id: String,
        partition: i32,
        attempts: u32,
    },
    /// 已转入死信
    DeadLettered { reason: DeadLetterReason },
}

/// 本地写入未送达时应转入死信的原因
pub(crate) type LocalWriteResult = std::result::Result<(), DeadLetterReason>;

/// 写本地连接
///
/// 写入受 `timeout` 约束，客户端长时间不读取时按写失败处理；
/// 调用方取消时返回 `Cancelled`，其余失败以外层 `Ok(Err(reason))` 返回。
pub(crate) async fn write_local(
    cancel: &CancellationToken,
    registry: &ConnectionRegistry,
    record: &PresenceRecord,
    payload: Bytes,
    timeout: Duration,
) -> Result<LocalWriteResult> {
    let Some(connection) = registry.lookup(record.connection_key()) else {
        debug!(
            user_id = %record.user_id,
            connection_key = %record.connection_key(),
            "Presence points to this node but no local connection found"
        );
        return Ok(Err(DeadLetterReason::ConnectionMissing));
    };

    let written = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(RouteError::Cancelled),
        res = tokio::time::timeout(timeout, connection.send(payload)) => {
            res.unwrap_or(Err(RouteError::Timeout(timeout)))
        }
    };

    Ok(written.map_err(|e| {
        warn!(
            user_id = %record.user_id,
            remote_addr = %connection.remote_addr(),
            error = %e,
            "Local connection write failed"
        );
        DeadLetterReason::LocalWriteFailed
    }))
}

/// 本地写入默认等待上限
pub const DEFAULT_LOCAL_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DeliveryPipeline {
    presence: Arc<PresenceDirectory>,
    registry: Arc<ConnectionRegistry>,
    publisher: Arc<dyn MessagePublisher>,
    partitions: Arc<PartitionSelector>,
    dead_letter: Arc<DeadLetterSink>,
    retry: RetryPolicy,
    topic: String,
    publish_timeout: Duration,
    write_timeout: Duration,
    metrics: Arc<RouteMetrics>,
}

impl DeliveryPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        presence: Arc<PresenceDirectory>,
        registry: Arc<ConnectionRegistry>,
        publisher: Arc<dyn MessagePublisher>,
        partitions: Arc<PartitionSelector>,
        dead_letter: Arc<DeadLetterSink>,
        retry: RetryPolicy,
        topic: impl Into<String>,
        publish_timeout: Duration,
        metrics: Arc<RouteMetrics>,
    ) -> Self {
        Self {
            presence,
            registry,
            publisher,
            partitions,
            dead_letter,
            retry,
            topic: topic.into(),
            publish_timeout,
            write_timeout: DEFAULT_LOCAL_WRITE_TIMEOUT,
            metrics,
        }
    }

    /// 设置本地写入等待上限
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// 投递一条消息
    ///
    /// 转入死信属于正常结果（`Ok(DeadLettered)`）；只有取消、编码失败和
    /// 死信发布失败以错误返回。
    pub async fn deliver(
        &self,
        cancel: &CancellationToken,
        message: &MessageEnvelope,
        self_node_id: &str,
    ) -> Result<DeliveryOutcome> {
        let started = Instant::now();
        let outcome = self.route(cancel, message, self_node_id).await;
        self.metrics
            .deliver_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        outcome
    }

    async fn route(
        &self,
        cancel: &CancellationToken,
        message: &MessageEnvelope,
        self_node_id: &str,
    ) -> Result<DeliveryOutcome> {
        let payload = message.encode()?;

        let presence = match self.presence.get(cancel, &message.receiver_id).await {
            Ok(Some(record)) if record.is_online() => record,
            Ok(_) => {
                return self
                    .divert(message, payload, DeadLetterReason::PresenceMiss)
                    .await;
            }
            Err(RouteError::Cancelled) => return Err(RouteError::Cancelled),
            Err(e) => {
                warn!(
                    receiver_id = %message.receiver_id,
                    error = %e,
                    "Presence lookup failed"
                );
                return self
                    .divert(message, payload, DeadLetterReason::PresenceUnavailable)
                    .await;
            }
        };

        if presence.node_id == self_node_id {
            let written = write_local(
                cancel,
                &self.registry,
                &presence,
                Bytes::from(payload.clone()),
                self.write_timeout,
            )
            .await?;
            return match written {
                Ok(()) => {
                    self.metrics.delivered_local_total.inc();
                    debug!(
                        receiver_id = %message.receiver_id,
                        node_id = %self_node_id,
                        "Message written to local connection"
                    );
                    Ok(DeliveryOutcome::LocalWrite)
                }
                Err(reason) => self.divert(message, payload, reason).await,
            };
        }

        self.publish_remote(cancel, message, payload, &presence.node_id)
            .await
    }

    async fn publish_remote(
        &self,
        cancel: &CancellationToken,
        message: &MessageEnvelope,
        payload: Vec<u8>,
        node_id: &str,
    ) -> Result<DeliveryOutcome> {
        let partition = self.partitions.partition_for(node_id)?;
        let record = OutboundRecord::new(self.topic.clone(), node_id, payload.clone())
            .with_partition(partition);

        let mut last_error = String::new();
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                self.metrics.publish_retry_total.inc();
                self.retry.backoff(cancel, attempt - 1).await?;
            }

            let published = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RouteError::Cancelled),
                res = tokio::time::timeout(self.publish_timeout, self.publisher.publish(record.clone())) => {
                    res.unwrap_or(Err(RouteError::Timeout(self.publish_timeout)))
                }
            };

            match published {
                Ok(()) => {
                    self.metrics.published_remote_total.inc();
                    debug!(
                        receiver_id = %message.receiver_id,
                        node_id = %node_id,
                        partition,
                        attempts = attempt + 1,
                        "Message published to remote node"
                    );
                    return Ok(DeliveryOutcome::RemotePublished {
                        node_id: node_id.to_string(),
                        partition,
                        attempts: attempt + 1,
                    });
                }
                Err(e) => {
                    debug!(
                        node_id = %node_id,
                        attempt = attempt + 1,
                        error = %e,
                        "Publish attempt failed"
                    );
                    let retryable = e.is_retryable();
                    last_error = e.to_string();
                    if !retryable {
                        break;
                    }
                }
            }
        }

        let exhausted = RouteError::DeliveryRetryExhausted {
            attempts: self.retry.max_attempts,
            last_error,
        };
        warn!(
            receiver_id = %message.receiver_id,
            node_id = %node_id,
            error = %exhausted,
            "Publish retries exhausted"
        );
        self.divert(message, payload, DeadLetterReason::RetryExhausted)
            .await
    }

    async fn divert(
        &self,
        message: &MessageEnvelope,
        payload: Vec<u8>,
        reason: DeadLetterReason,
    ) -> Result<DeliveryOutcome> {
        self.dead_letter
            .divert(&message.receiver_id, payload, reason)
            .await?;
        Ok(DeliveryOutcome::DeadLettered { reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::PresenceConfig;
    use crate::connection::{ChannelTransport, TransportReceiver};
    use crate::message::{MessageScope, MessageStatus, MessageType};
    use crate::presence::PresenceStatus;
    use crate::presence::store::MemoryStore;

    const TOPIC: &str = "im-route";
    const DLQ: &str = "im-route-dlq";

    struct Fixture {
        pipeline: DeliveryPipeline,
        broker: MemoryBroker,
        presence: Arc<PresenceDirectory>,
        registry: Arc<ConnectionRegistry>,
        metrics: Arc<RouteMetrics>,
    }

    fn fixture(max_attempts: u32) -> Fixture {
        let metrics = Arc::new(RouteMetrics::new());
        let broker = MemoryBroker::new();
        let publisher: Arc<dyn MessagePublisher> = Arc::new(broker.clone());
        let presence = Arc::new(PresenceDirectory::new(
            Arc::new(MemoryStore::new()),
            &PresenceConfig::default(),
            metrics.clone(),
        ));
        let registry = Arc::new(ConnectionRegistry::new(16, metrics.clone()));
        let dead_letter = Arc::new(DeadLetterSink::new(
            publisher.clone(),
            DLQ,
            Duration::from_secs(1),
            metrics.clone(),
        ));
        let retry = RetryPolicy {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
        };
        let pipeline = DeliveryPipeline::new(
            presence.clone(),
            registry.clone(),
            publisher,
            Arc::new(PartitionSelector::new(8).unwrap()),
            dead_letter,
            retry,
            TOPIC,
            Duration::from_secs(1),
            metrics.clone(),
        );
        Fixture {
            pipeline,
            broker,
            presence,
            registry,
            metrics,
        }
    }

    fn message(receiver: &str) -> MessageEnvelope {
        MessageEnvelope {
            sender_id: "alice".to_string(),
            receiver_id: receiver.to_string(),
            message_type: MessageType::Text,
            content: "hi".to_string(),
            time: 1_700_000_000,
            status: MessageStatus::Send,
            scope: MessageScope::Direct,
            message_id: None,
            seq: None,
        }
    }

    async fn online(f: &Fixture, user: &str, node: &str) {
        f.presence
            .put(
                &CancellationToken::new(),
                PresenceRecord::online(user, node, format!("{node}:9000")),
            )
            .await
            .unwrap();
    }

    async fn attach(f: &Fixture, user: &str) -> TransportReceiver {
        let (transport, receiver) = ChannelTransport::new("10.0.0.9:5000", 4);
        f.registry.register(user, Arc::new(transport)).await.unwrap();
        receiver
    }

    #[tokio::test]
    async fn test_local_recipient_written_directly() {
        let f = fixture(3);
        online(&f, "bob", "gw-1").await;
        let mut rx = attach(&f, "bob").await;

        let msg = message("bob");
        let outcome = f
            .pipeline
            .deliver(&CancellationToken::new(), &msg, "gw-1")
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::LocalWrite);
        assert_eq!(rx.recv().await.unwrap(), Bytes::from(msg.encode().unwrap()));
        assert_eq!(f.broker.attempts(TOPIC), 0);
        assert_eq!(f.broker.attempts(DLQ), 0);
    }

    #[tokio::test]
    async fn test_remote_recipient_published_once() {
        let f = fixture(3);
        online(&f, "bob", "gw-2").await;

        let outcome = f
            .pipeline
            .deliver(&CancellationToken::new(), &message("bob"), "gw-1")
            .await
            .unwrap();

        let published = f.broker.published(TOPIC);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key, "gw-2");
        assert!(matches!(
            outcome,
            DeliveryOutcome::RemotePublished { ref node_id, attempts: 1, .. } if node_id == "gw-2"
        ));
        assert_eq!(f.metrics.published_remote_total.get(), 1);
    }

    #[tokio::test]
    async fn test_offline_recipient_dead_lettered() {
        let f = fixture(3);
        let cancel = CancellationToken::new();
        let mut record = PresenceRecord::online("carol", "gw-2", "gw-2:9000");
        record.status = PresenceStatus::Offline;
        f.presence.put(&cancel, record).await.unwrap();

        for receiver in ["carol", "nobody"] {
            let outcome = f
                .pipeline
                .deliver(&cancel, &message(receiver), "gw-1")
                .await
                .unwrap();
            assert_eq!(
                outcome,
                DeliveryOutcome::DeadLettered {
                    reason: DeadLetterReason::PresenceMiss
                }
            );
        }
        assert_eq!(f.broker.attempts(TOPIC), 0);
        assert_eq!(f.broker.published(DLQ).len(), 2);
    }

    #[tokio::test]
    async fn test_missing_local_connection_dead_lettered() {
        let f = fixture(3);
        online(&f, "bob", "gw-1").await;
        let outcome = f
            .pipeline
            .deliver(&CancellationToken::new(), &message("bob"), "gw-1")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DeliveryOutcome::DeadLettered {
                reason: DeadLetterReason::ConnectionMissing
            }
        );
        assert_eq!(f.broker.attempts(TOPIC), 0);
    }

    #[tokio::test]
    async fn test_closed_local_connection_dead_lettered() {
        let f = fixture(3);
        online(&f, "bob", "gw-1").await;
        let rx = attach(&f, "bob").await;
        drop(rx);

        let outcome = f
            .pipeline
            .deliver(&CancellationToken::new(), &message("bob"), "gw-1")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DeliveryOutcome::DeadLettered {
                reason: DeadLetterReason::LocalWriteFailed
            }
        );
    }

    /// 客户端不读取、单槽已写满的连接
    async fn attach_stalled(f: &Fixture, user: &str) -> TransportReceiver {
        let (transport, receiver) = ChannelTransport::new("10.0.0.9:5000", 1);
        f.registry.register(user, Arc::new(transport)).await.unwrap();
        let outcome = f
            .pipeline
            .deliver(&CancellationToken::new(), &message(user), "gw-1")
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::LocalWrite);
        receiver
    }

    #[tokio::test]
    async fn test_stalled_local_write_honours_cancel() {
        let f = fixture(3);
        online(&f, "bob", "gw-1").await;
        let _rx = attach_stalled(&f, "bob").await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = tokio::time::timeout(
            Duration::from_secs(1),
            f.pipeline.deliver(&cancel, &message("bob"), "gw-1"),
        )
        .await
        .expect("deliver must return once cancelled");
        assert!(matches!(res, Err(RouteError::Cancelled)));
        assert_eq!(f.broker.attempts(DLQ), 0);
    }

    #[tokio::test]
    async fn test_stalled_local_write_times_out_to_dead_letter() {
        let mut f = fixture(3);
        f.pipeline.write_timeout = Duration::from_millis(30);
        online(&f, "bob", "gw-1").await;
        let _rx = attach_stalled(&f, "bob").await;

        let outcome = tokio::time::timeout(
            Duration::from_secs(1),
            f.pipeline
                .deliver(&CancellationToken::new(), &message("bob"), "gw-1"),
        )
        .await
        .expect("stalled write must be bounded by the write timeout")
        .unwrap();
        assert_eq!(
            outcome,
            DeliveryOutcome::DeadLettered {
                reason: DeadLetterReason::LocalWriteFailed
            }
        );
        assert_eq!(f.broker.published(DLQ).len(), 1);
        assert_eq!(f.broker.attempts(TOPIC), 0);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_then_dead_letter() {
        let f = fixture(3);
        online(&f, "bob", "gw-2").await;
        f.broker.fail_next(TOPIC, 3);

        let outcome = f
            .pipeline
            .deliver(&CancellationToken::new(), &message("bob"), "gw-1")
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DeliveryOutcome::DeadLettered {
                reason: DeadLetterReason::RetryExhausted
            }
        );
        assert_eq!(f.broker.attempts(TOPIC), 3);
        assert!(f.broker.published(TOPIC).is_empty());
        assert_eq!(f.broker.published(DLQ).len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_within_budget() {
        let f = fixture(3);
        online(&f, "bob", "gw-2").await;
        f.broker.fail_next(TOPIC, 2);

        let outcome = f
            .pipeline
            .deliver(&CancellationToken::new(), &message("bob"), "gw-1")
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            DeliveryOutcome::RemotePublished { attempts: 3, .. }
        ));
        assert_eq!(f.metrics.publish_retry_total.get(), 2);
        assert!(f.broker.published(DLQ).is_empty());
    }

    #[tokio::test]
    async fn test_dead_letter_failure_surfaces() {
        let f = fixture(1);
        f.broker.fail_always(DLQ);
        let res = f
            .pipeline
            .deliver(&CancellationToken::new(), &message("ghost"), "gw-1")
            .await;
        assert!(matches!(res, Err(RouteError::DeadLetterFailure(_))));
        assert_eq!(f.metrics.dead_letter_failure_total.get(), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_returns_cancelled() {
        let mut f = fixture(5);
        f.pipeline.retry = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 60_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 1.0,
        };
        online(&f, "bob", "gw-2").await;
        f.broker.fail_always(TOPIC);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let res = f.pipeline.deliver(&cancel, &message("bob"), "gw-1").await;
        assert!(matches!(res, Err(RouteError::Cancelled)));
        assert_eq!(f.broker.attempts(TOPIC), 1);
        assert!(f.broker.published(DLQ).is_empty());
    }
}
