//! 消息信封
//!
//! 客户端与网关之间、以及经由消息代理在节点之间传递的 JSON 信封。
//! 字段名大小写敏感，未通过必填字段或枚举校验的信封在进入投递管道前即被拒绝。

use serde::{Deserialize, Serialize};

use crate::error::{Result, RouteError};

/// 消息内容类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    Image,
    File,
    Video,
    Audio,
}

/// 消息状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// 发送
    Send,
    /// 撤回
    Withdraw,
}

/// 消息作用域（单聊 / 群聊 / 频道）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageScope {
    #[default]
    Direct,
    Group,
    Channel,
}

/// 消息信封
///
/// `message_id` 与 `seq` 由入口处的 ID 生成器填充，客户端上行时可以缺省。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub sender_id: String,
    pub receiver_id: String,
    pub message_type: MessageType,
    pub content: String,
    pub time: i64,
    pub status: MessageStatus,
    #[serde(default)]
    pub scope: MessageScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
}

impl MessageEnvelope {
    /// 从原始 JSON 解码并校验
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let envelope: MessageEnvelope = serde_json::from_slice(raw)?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// 编码为 JSON 字节
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// 必填字段校验（枚举校验由反序列化完成）
    pub fn validate(&self) -> Result<()> {
        if self.sender_id.trim().is_empty() {
            return Err(RouteError::Validation("sender_id is required".to_string()));
        }
        if self.receiver_id.trim().is_empty() {
            return Err(RouteError::Validation(
                "receiver_id is required".to_string(),
            ));
        }
        if self.time < 0 {
            return Err(RouteError::Validation(format!(
                "time must be non-negative, got {}",
                self.time
            )));
        }
        Ok(())
    }
}
