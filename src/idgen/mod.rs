//! 分布式 ID 生成
//!
//! - [`SnowflakeGenerator`]：全局唯一消息 ID，单进程单实例
//! - [`ConversationSequencer`]：基于共享存储原子自增的会话序列号

mod sequence;
mod snowflake;

pub use sequence::ConversationSequencer;
pub use snowflake::{Clock, EPOCH_MS, SnowflakeGenerator, SnowflakeParts, SystemClock, WorkerId};
