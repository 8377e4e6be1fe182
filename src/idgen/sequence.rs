//! 会话序列号
//!
//! 正确性完全依赖共享存储的原子自增；存储不可达时直接返回错误，不做本地兜底。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::Result;
use crate::presence::store::{SharedStore, bounded};

pub struct ConversationSequencer {
    store: Arc<dyn SharedStore>,
    key_prefix: String,
    timeout: Duration,
}

impl ConversationSequencer {
    pub fn new(store: Arc<dyn SharedStore>, key_prefix: impl Into<String>, timeout: Duration) -> Self {
        Self {
            store,
            key_prefix: key_prefix.into(),
            timeout,
        }
    }

    /// 会话 key 与双方顺序无关
    ///
    /// 较小一方的 id 带长度前缀，id 中含 `:` 时也不会与其他会话重合。
    pub fn conversation_key(&self, party_a: &str, party_b: &str) -> String {
        let (low, high) = if party_a <= party_b {
            (party_a, party_b)
        } else {
            (party_b, party_a)
        };
        format!("{}{}:{}:{}", self.key_prefix, low.len(), low, high)
    }

    /// 获取下一个会话序列号
    pub async fn next_seq(
        &self,
        cancel: &CancellationToken,
        party_a: &str,
        party_b: &str,
    ) -> Result<i64> {
        let key = self.conversation_key(party_a, party_b);
        bounded(cancel, self.timeout, self.store.incr(&key))
            .await
            .inspect_err(|e| {
                warn!(key = %key, error = %e, "Failed to allocate conversation sequence");
            })
    }
}
