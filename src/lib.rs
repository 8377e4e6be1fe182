//! Flare IM 路由核心
//!
//! 维护本节点的客户端连接与全局在线状态，通过一致性哈希把用户映射到节点，
//! 消息先写本地连接，否则经消息代理投递到目标节点，失败则转入死信队列。

pub mod balancer;
pub mod broker;
pub mod config;
pub mod connection;
pub mod context;
pub mod delivery;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod idgen;
pub mod ingress;
pub mod message;
pub mod metrics;
pub mod presence;
pub mod rpc;
pub mod tracing;

pub use balancer::{NodeSelector, NodeSet, new_balancer};
pub use config::{ConfigManager, RouteAppConfig, load_config};
pub use connection::{ConnectionRegistry, ConnectionTransport};
pub use context::{RouteContext, RouteContextBuilder};
pub use delivery::{DeliveryOutcome, DeliveryPipeline};
pub use dispatcher::{DispatchOutcome, InboundDispatcher};
pub use error::{Result, RouteError};
pub use ingress::{GatewayIngress, MessageHandler};
pub use message::MessageEnvelope;
pub use presence::{PresenceDirectory, PresenceRecord};
