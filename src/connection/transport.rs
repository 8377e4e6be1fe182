//! 基于 mpsc 通道的连接传输层
//!
//! 握手层持有 `TransportReceiver`，负责把帧写到真实套接字；注册表只看到 `ChannelTransport`。

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::ConnectionTransport;
use crate::error::{Result, RouteError};

pub struct ChannelTransport {
    remote_addr: String,
    sender: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

/// 写端（握手层）
pub struct TransportReceiver {
    receiver: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
}

impl ChannelTransport {
    pub fn new(remote_addr: impl Into<String>, capacity: usize) -> (Self, TransportReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let closed = CancellationToken::new();
        (
            Self {
                remote_addr: remote_addr.into(),
                sender,
                closed: closed.clone(),
            },
            TransportReceiver { receiver, closed },
        )
    }
}

#[async_trait]
impl ConnectionTransport for ChannelTransport {
    async fn send(&self, payload: Bytes) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(RouteError::Transport(format!(
                "connection {} closed",
                self.remote_addr
            )));
        }
        // 客户端停止读取时通道会写满，关闭信号必须能唤醒等待中的写入
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(RouteError::Transport(format!(
                "connection {} closed",
                self.remote_addr
            ))),
            res = self.sender.send(payload) => res.map_err(|_| {
                RouteError::Transport(format!("connection {} writer gone", self.remote_addr))
            }),
        }
    }

    async fn close(&self) {
        self.closed.cancel();
    }

    fn remote_addr(&self) -> &str {
        &self.remote_addr
    }
}

impl TransportReceiver {
    /// 接收下一帧；连接关闭后返回 None
    pub async fn recv(&mut self) -> Option<Bytes> {
        tokio::select! {
            biased;
            frame = self.receiver.recv() => frame,
            _ = self.closed.cancelled() => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// 等待关闭信号
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}
