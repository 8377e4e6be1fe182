//! Flare IM Route 错误模块
//!
//! - 统一定义路由核心对外暴露的错误类型
//! - 本地可恢复的错误（容量已满、连接池耗尽、负载均衡配置错误）以类型化错误返回给调用方
//! - 威胁消息持久性的错误由投递管道转入死信队列，而不是直接抛出

use std::time::Duration;

/// 路由核心统一结果类型
pub type Result<T> = std::result::Result<T, RouteError>;

/// 路由核心错误类型
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// 启动期的致命配置错误（非法 worker id、缺失必填地址等）
    #[error("fatal configuration error: {0}")]
    ConfigurationFatal(String),

    /// 配置文件加载或解析失败
    #[error("configuration load failed: {0}")]
    Config(#[from] anyhow::Error),

    /// 依赖组件未初始化（替代原先的全局单例 panic）
    #[error("component not initialized: {0}")]
    NotInitialized(&'static str),

    /// 连接注册表已满
    #[error("connection registry full (max={max})")]
    RegistryFull { max: usize },

    /// 负载均衡器节点列表为空
    #[error("nodes cannot be empty")]
    BalancerEmptyNodes,

    /// 负载均衡器没有可用节点
    #[error("no node available")]
    BalancerNodeNotFound,

    /// 节点信息与负载均衡策略不匹配
    #[error("invalid balancer type: {0}")]
    BalancerTypeMismatch(String),

    /// 接收方不在线或在线状态缺失
    #[error("presence miss for user {user_id}")]
    PresenceMiss { user_id: String },

    /// 消息发布重试次数耗尽
    #[error("delivery retry exhausted after {attempts} attempts: {last_error}")]
    DeliveryRetryExhausted { attempts: u32, last_error: String },

    /// 死信队列发布失败（唯一接受的数据丢失点）
    #[error("dead-letter publish failed: {0}")]
    DeadLetterFailure(String),

    /// RPC 连接池耗尽
    #[error("all connections to {address} are in use and max connection limit {max} reached")]
    PoolExhausted { address: String, max: usize },

    /// 归还的通道不属于连接池
    #[error("connection not found in pool for {address}")]
    ChannelNotPooled { address: String },

    /// RPC 连接池已关闭
    #[error("rpc connection pool closed")]
    PoolClosed,

    /// 调用方取消
    #[error("operation cancelled")]
    Cancelled,

    /// 阻塞调用超时
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// 共享缓存/存储调用失败
    #[error("shared store error: {0}")]
    Store(String),

    /// 消息代理调用失败
    #[error("broker error: {0}")]
    Broker(String),

    /// 连接传输层失败（写 socket、建立 RPC 通道）
    #[error("transport error: {0}")]
    Transport(String),

    /// 编解码失败
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// 消息信封校验失败
    #[error("invalid message envelope: {0}")]
    Validation(String),
}

impl RouteError {
    /// 判断错误是否可以重试
    ///
    /// 网络类错误（代理、存储、传输、超时）可以重试；取消、配置、校验类错误不可重试。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RouteError::Broker(_)
                | RouteError::Store(_)
                | RouteError::Transport(_)
                | RouteError::Timeout(_)
        )
    }

    /// 是否为调用方取消
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RouteError::Cancelled)
    }
}

impl From<redis::RedisError> for RouteError {
    fn from(err: redis::RedisError) -> Self {
        RouteError::Store(err.to_string())
    }
}

impl From<rdkafka::error::KafkaError> for RouteError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        RouteError::Broker(err.to_string())
    }
}

impl From<tonic::transport::Error> for RouteError {
    fn from(err: tonic::transport::Error) -> Self {
        RouteError::Transport(err.to_string())
    }
}
