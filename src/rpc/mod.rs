//! 出站 RPC 通道
//!
//! - [`ChannelConnector`]：打开 / 关闭到某地址的通道
//! - [`TonicConnector`]：基于 tonic 的实现（可选双向 TLS 与 keepalive）
//! - [`RpcConnectionPool`]：按地址分桶、有上限、空闲回收的连接池

mod connector;
mod pool;

use async_trait::async_trait;

use crate::error::Result;

pub use connector::TonicConnector;
pub use pool::{PooledChannel, RpcConnectionPool};

#[async_trait]
pub trait ChannelConnector: Send + Sync + 'static {
    type Channel: Clone + Send + Sync + 'static;

    /// 建立到 `address` 的通道，须遵守连接超时
    async fn connect(&self, address: &str) -> Result<Self::Channel>;

    /// 关闭通道
    async fn close(&self, channel: Self::Channel);
}
