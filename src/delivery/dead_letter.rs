//! 死信转移
//!
//! 死信主题 = 主主题 + 后缀。死信发布失败是唯一接受的数据丢失点，
//! 以 error 级别日志（`data_loss = true`）和指标记录。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use crate::broker::{MessagePublisher, OutboundRecord};
use crate::error::{Result, RouteError};
use crate::metrics::RouteMetrics;

/// 转入死信的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// 接收方无在线记录或已离线
    PresenceMiss,
    /// 在线状态查询失败
    PresenceUnavailable,
    /// 在线记录指向本节点但本地无连接
    ConnectionMissing,
    /// 写本地连接失败
    LocalWriteFailed,
    /// 发布重试耗尽
    RetryExhausted,
    /// 入站记录解码失败
    DecodeFailed,
    /// 入站记录的接收方不在本节点
    NotLocal,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::PresenceMiss => "presence_miss",
            DeadLetterReason::PresenceUnavailable => "presence_unavailable",
            DeadLetterReason::ConnectionMissing => "connection_missing",
            DeadLetterReason::LocalWriteFailed => "local_write_failed",
            DeadLetterReason::RetryExhausted => "retry_exhausted",
            DeadLetterReason::DecodeFailed => "decode_failed",
            DeadLetterReason::NotLocal => "not_local",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 死信发布器
pub struct DeadLetterSink {
    publisher: Arc<dyn MessagePublisher>,
    topic: String,
    timeout: Duration,
    metrics: Arc<RouteMetrics>,
}

impl DeadLetterSink {
    pub fn new(
        publisher: Arc<dyn MessagePublisher>,
        topic: impl Into<String>,
        timeout: Duration,
        metrics: Arc<RouteMetrics>,
    ) -> Self {
        Self {
            publisher,
            topic: topic.into(),
            timeout,
            metrics,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 发布到死信主题
    ///
    /// 只受发布超时约束，不响应取消：关停过程中仍需尽量保住消息。
    pub async fn divert(&self, key: &str, payload: Vec<u8>, reason: DeadLetterReason) -> Result<()> {
        let record = OutboundRecord::new(self.topic.clone(), key, payload);
        let result = match tokio::time::timeout(self.timeout, self.publisher.publish(record)).await {
            Ok(inner) => inner,
            Err(_) => Err(RouteError::Timeout(self.timeout)),
        };

        match result {
            Ok(()) => {
                self.metrics.record_dead_letter(reason.as_str());
                warn!(
                    key = %key,
                    reason = %reason,
                    topic = %self.topic,
                    "Message diverted to dead-letter topic"
                );
                Ok(())
            }
            Err(e) => {
                self.metrics.dead_letter_failure_total.inc();
                error!(
                    data_loss = true,
                    key = %key,
                    reason = %reason,
                    topic = %self.topic,
                    error = %e,
                    "Dead-letter publish failed, message lost"
                );
                Err(RouteError::DeadLetterFailure(e.to_string()))
            }
        }
    }
}
