//! 路由上下文 - 依赖注入
//!
//! 启动时按依赖顺序构建一次，之后显式传给各组件，取代进程级全局单例。
//! 未装配的组件在首次访问时返回 `NotInitialized`，而不是 panic。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::balancer::{NodeSelector, NodeSet, PartitionSelector, new_balancer};
use crate::broker::{KafkaPartitionConsumer, KafkaPublisher, MessagePublisher};
use crate::config::{BalancerStrategy, RouteAppConfig};
use crate::connection::ConnectionRegistry;
use crate::delivery::{DeadLetterSink, DeliveryPipeline, RetryPolicy};
use crate::discovery::{NodeSetRefresher, ServiceInstance, ServiceRegistry};
use crate::dispatcher::InboundDispatcher;
use crate::error::{Result, RouteError};
use crate::idgen::{ConversationSequencer, SnowflakeGenerator};
use crate::ingress::GatewayIngress;
use crate::metrics::RouteMetrics;
use crate::presence::PresenceDirectory;
use crate::presence::store::{RedisSharedStore, SharedStore};
use crate::rpc::{RpcConnectionPool, TonicConnector};

pub struct RouteContext {
    config: Arc<RouteAppConfig>,
    metrics: Arc<RouteMetrics>,
    registry: Option<Arc<ConnectionRegistry>>,
    presence: Option<Arc<PresenceDirectory>>,
    selector: Option<Arc<dyn NodeSelector>>,
    pipeline: Option<Arc<DeliveryPipeline>>,
    dispatcher: Option<Arc<InboundDispatcher>>,
    snowflake: Option<Arc<SnowflakeGenerator>>,
    sequencer: Option<Arc<ConversationSequencer>>,
    rpc_pool: Option<Arc<RpcConnectionPool<TonicConnector>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// 上下文构建器
pub struct RouteContextBuilder {
    config: Arc<RouteAppConfig>,
    metrics: Arc<RouteMetrics>,
    registry: Option<Arc<ConnectionRegistry>>,
    presence: Option<Arc<PresenceDirectory>>,
    selector: Option<Arc<dyn NodeSelector>>,
    pipeline: Option<Arc<DeliveryPipeline>>,
    dispatcher: Option<Arc<InboundDispatcher>>,
    snowflake: Option<Arc<SnowflakeGenerator>>,
    sequencer: Option<Arc<ConversationSequencer>>,
    rpc_pool: Option<Arc<RpcConnectionPool<TonicConnector>>>,
}

impl RouteContextBuilder {
    pub fn new(config: RouteAppConfig, metrics: Arc<RouteMetrics>) -> Self {
        Self {
            config: Arc::new(config),
            metrics,
            registry: None,
            presence: None,
            selector: None,
            pipeline: None,
            dispatcher: None,
            snowflake: None,
            sequencer: None,
            rpc_pool: None,
        }
    }

    pub fn registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn presence(mut self, presence: Arc<PresenceDirectory>) -> Self {
        self.presence = Some(presence);
        self
    }

    pub fn selector(mut self, selector: Arc<dyn NodeSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn pipeline(mut self, pipeline: Arc<DeliveryPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<InboundDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn snowflake(mut self, snowflake: Arc<SnowflakeGenerator>) -> Self {
        self.snowflake = Some(snowflake);
        self
    }

    pub fn sequencer(mut self, sequencer: Arc<ConversationSequencer>) -> Self {
        self.sequencer = Some(sequencer);
        self
    }

    pub fn rpc_pool(mut self, pool: Arc<RpcConnectionPool<TonicConnector>>) -> Self {
        self.rpc_pool = Some(pool);
        self
    }

    pub fn build(self) -> RouteContext {
        RouteContext {
            config: self.config,
            metrics: self.metrics,
            registry: self.registry,
            presence: self.presence,
            selector: self.selector,
            pipeline: self.pipeline,
            dispatcher: self.dispatcher,
            snowflake: self.snowflake,
            sequencer: self.sequencer,
            rpc_pool: self.rpc_pool,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }
}

fn required<'a, T: ?Sized>(slot: &'a Option<Arc<T>>, name: &'static str) -> Result<&'a Arc<T>> {
    slot.as_ref().ok_or(RouteError::NotInitialized(name))
}

impl RouteContext {
    pub fn builder(config: RouteAppConfig, metrics: Arc<RouteMetrics>) -> RouteContextBuilder {
        RouteContextBuilder::new(config, metrics)
    }

    /// 按配置装配全部组件（Redis / Kafka / tonic）
    pub async fn from_config(config: RouteAppConfig) -> Result<Self> {
        // 1. 校验配置
        config.validate()?;
        if config.redis.url.trim().is_empty() {
            return Err(RouteError::ConfigurationFatal(
                "redis.url is required".to_string(),
            ));
        }
        let node_id = config.node.node_id.clone();
        let metrics = Arc::new(RouteMetrics::new());

        // 2. 共享存储
        let store: Arc<dyn SharedStore> = Arc::new(RedisSharedStore::connect(&config.redis.url).await?);

        // 3. 连接注册表与在线状态目录
        let registry = Arc::new(ConnectionRegistry::new(
            config.connection.max_connections,
            metrics.clone(),
        ));
        let presence = Arc::new(PresenceDirectory::new(
            store.clone(),
            &config.presence,
            metrics.clone(),
        ));

        // 4. 负载均衡与分区选择
        let selector = new_balancer(config.balancer.strategy, seed_node_set(&config))?;
        let partitions = Arc::new(PartitionSelector::new(config.balancer.partitions)?);

        // 5. 投递管道与死信
        let publish_timeout = Duration::from_millis(config.delivery.publish_timeout_ms);
        let publisher: Arc<dyn MessagePublisher> =
            Arc::new(KafkaPublisher::new(&config.kafka, publish_timeout)?);
        let dead_letter = Arc::new(DeadLetterSink::new(
            publisher.clone(),
            config.kafka.dead_letter_topic(),
            publish_timeout,
            metrics.clone(),
        ));
        let pipeline = Arc::new(DeliveryPipeline::new(
            presence.clone(),
            registry.clone(),
            publisher,
            partitions.clone(),
            dead_letter.clone(),
            RetryPolicy::from_config(&config.delivery),
            config.kafka.topic.clone(),
            publish_timeout,
            metrics.clone(),
        )
        .with_write_timeout(config.connection.write_timeout()));

        // 6. 入站分发器（只消费本节点所属分区）
        let partition = partitions.partition_for(&node_id)?;
        let consumer = Arc::new(KafkaPartitionConsumer::new(&config.kafka, &node_id, partition)?);
        let dispatcher = Arc::new(InboundDispatcher::new(
            consumer,
            presence.clone(),
            registry.clone(),
            dead_letter,
            Duration::from_millis(config.kafka.read_timeout_ms),
            metrics.clone(),
        )
        .with_write_timeout(config.connection.write_timeout()));

        // 7. ID 生成
        let snowflake = Arc::new(SnowflakeGenerator::new(config.idgen.worker_id()?));
        let sequencer = Arc::new(ConversationSequencer::new(
            store,
            config.idgen.seq_key_prefix.clone(),
            Duration::from_millis(config.idgen.store_timeout_ms),
        ));

        // 8. RPC 连接池
        let rpc_pool = RpcConnectionPool::new(
            TonicConnector::from_config(&config.rpc_pool)?,
            &config.rpc_pool,
            metrics.clone(),
        );

        info!(
            node_id = %node_id,
            partition,
            balancer = selector.name(),
            "Route context initialized"
        );

        Ok(Self::builder(config, metrics)
            .registry(registry)
            .presence(presence)
            .selector(selector)
            .pipeline(pipeline)
            .dispatcher(dispatcher)
            .snowflake(snowflake)
            .sequencer(sequencer)
            .rpc_pool(rpc_pool)
            .build())
    }

    pub fn config(&self) -> &Arc<RouteAppConfig> {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.config.node.node_id
    }

    pub fn metrics(&self) -> &Arc<RouteMetrics> {
        &self.metrics
    }

    pub fn registry(&self) -> Result<&Arc<ConnectionRegistry>> {
        required(&self.registry, "connection registry")
    }

    pub fn presence(&self) -> Result<&Arc<PresenceDirectory>> {
        required(&self.presence, "presence directory")
    }

    pub fn selector(&self) -> Result<&Arc<dyn NodeSelector>> {
        required(&self.selector, "node selector")
    }

    pub fn pipeline(&self) -> Result<&Arc<DeliveryPipeline>> {
        required(&self.pipeline, "delivery pipeline")
    }

    pub fn dispatcher(&self) -> Result<&Arc<InboundDispatcher>> {
        required(&self.dispatcher, "inbound dispatcher")
    }

    pub fn snowflake(&self) -> Result<&Arc<SnowflakeGenerator>> {
        required(&self.snowflake, "snowflake generator")
    }

    pub fn sequencer(&self) -> Result<&Arc<ConversationSequencer>> {
        required(&self.sequencer, "conversation sequencer")
    }

    pub fn rpc_pool(&self) -> Result<&Arc<RpcConnectionPool<TonicConnector>>> {
        required(&self.rpc_pool, "rpc connection pool")
    }

    /// 关闭信号，后台任务共用
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// 构建网关入口
    pub fn ingress(&self) -> Result<GatewayIngress> {
        Ok(GatewayIngress::new(
            self.node_id(),
            self.pipeline()?.clone(),
            self.snowflake()?.clone(),
            self.sequencer()?.clone(),
        ))
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
    }

    /// 启动后台任务：入站分发、在线缓存清理，以及可选的注册中心刷新
    pub async fn start(&self, discovery: Option<Arc<dyn ServiceRegistry>>) -> Result<()> {
        let dispatcher = self.dispatcher()?.clone();
        let node_id = self.node_id().to_string();
        let cancel = self.shutdown.clone();
        self.track(tokio::spawn(async move {
            if let Err(e) = dispatcher.run(cancel, &node_id).await {
                warn!(node_id = %node_id, error = %e, "Inbound dispatcher exited with error");
            }
        }));

        let janitor_interval = Duration::from_millis(self.config.presence.local_ttl_ms.max(1000));
        self.track(
            self.presence()?
                .spawn_cache_janitor(janitor_interval, self.shutdown.clone()),
        );

        if let Some(discovery) = discovery {
            let balancer = &self.config.balancer;
            discovery
                .register_self(ServiceInstance::new(
                    balancer.service_name.clone(),
                    self.node_id(),
                    self.config.node.address.clone(),
                ))
                .await?;
            let refresher = Arc::new(NodeSetRefresher::new(
                discovery,
                self.selector()?.clone(),
                balancer.strategy,
                balancer.service_name.clone(),
            ));
            self.track(refresher.spawn(balancer.refresh_interval(), self.shutdown.clone()));
        }

        info!(node_id = %self.node_id(), "Route background tasks started");
        Ok(())
    }

    /// 优雅停机
    ///
    /// 先发出取消信号并关闭全部连接与 RPC 通道，阻塞在本地写入上的分发器随之
    /// 释放，转死信后提交当前记录再退出。`deadline` 只约束后台任务的汇合，
    /// 超时后剩余任务被强制终止并返回 `Timeout`。
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        info!(node_id = %self.node_id(), "Route context shutting down");
        self.shutdown.cancel();

        if let Some(registry) = &self.registry {
            registry.close_all().await;
        }
        let pool_closed = match &self.rpc_pool {
            Some(pool) => pool.close().await,
            None => Ok(()),
        };

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        let aborts: Vec<_> = tasks.iter().map(|task| task.abort_handle()).collect();

        let join = async {
            for task in tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "Background task panicked during shutdown");
                }
            }
        };

        if tokio::time::timeout(deadline, join).await.is_err() {
            warn!(
                deadline_ms = deadline.as_millis() as u64,
                "Shutdown deadline exceeded, aborting background tasks"
            );
            for abort in aborts {
                abort.abort();
            }
            return Err(RouteError::Timeout(deadline));
        }

        info!(node_id = %self.node_id(), "Route context stopped");
        pool_closed
    }
}

/// 配置中没有节点时以本节点作为初始集合，等待注册中心刷新
fn seed_node_set(config: &RouteAppConfig) -> NodeSet {
    let configured = config.balancer.node_set();
    if !configured.is_empty() {
        return configured;
    }
    let own = if config.node.address.is_empty() {
        config.node.node_id.clone()
    } else {
        config.node.address.clone()
    };
    match config.balancer.strategy {
        BalancerStrategy::Hash => NodeSet::Weighted([(own, 1)].into_iter().collect()),
        BalancerStrategy::RoundRobin => NodeSet::Ordered(vec![own]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InboundRecord, MemoryBroker, MemoryConsumer};
    use crate::config::PresenceConfig;
    use crate::connection::ChannelTransport;
    use crate::discovery::StaticRegistry;
    use crate::message::{MessageEnvelope, MessageScope, MessageStatus, MessageType};
    use crate::presence::PresenceRecord;
    use crate::presence::store::MemoryStore;

    fn config() -> RouteAppConfig {
        let mut config = RouteAppConfig::default();
        config.node.node_id = "gw-1".to_string();
        config.node.address = "10.0.0.1:9000".to_string();
        config.kafka.bootstrap_servers = "localhost:9092".to_string();
        config
    }

    #[tokio::test]
    async fn test_missing_component_is_typed_error() {
        let ctx = RouteContext::builder(config(), Arc::new(RouteMetrics::new())).build();
        assert!(matches!(
            ctx.registry(),
            Err(RouteError::NotInitialized("connection registry"))
        ));
        assert!(matches!(ctx.ingress(), Err(RouteError::NotInitialized(_))));
        assert!(matches!(ctx.start(None).await, Err(RouteError::NotInitialized(_))));
    }

    #[tokio::test]
    async fn test_from_config_rejects_missing_node_id() {
        let mut cfg = config();
        cfg.node.node_id.clear();
        assert!(matches!(
            RouteContext::from_config(cfg).await,
            Err(RouteError::ConfigurationFatal(_))
        ));
    }

    #[tokio::test]
    async fn test_from_config_rejects_missing_redis_url() {
        assert!(matches!(
            RouteContext::from_config(config()).await,
            Err(RouteError::ConfigurationFatal(_))
        ));
    }

    #[test]
    fn test_seed_node_set_falls_back_to_own_address() {
        let mut cfg = config();
        cfg.balancer.strategy = BalancerStrategy::RoundRobin;
        assert_eq!(
            seed_node_set(&cfg),
            NodeSet::Ordered(vec!["10.0.0.1:9000".to_string()])
        );
    }

    #[tokio::test]
    async fn test_start_and_shutdown_drains_everything() {
        let cfg = config();
        let metrics = Arc::new(RouteMetrics::new());
        let registry = Arc::new(ConnectionRegistry::new(4, metrics.clone()));
        let presence = Arc::new(PresenceDirectory::new(
            Arc::new(MemoryStore::new()),
            &PresenceConfig::default(),
            metrics.clone(),
        ));
        let consumer = MemoryConsumer::new();
        let dead_letter = Arc::new(DeadLetterSink::new(
            Arc::new(MemoryBroker::new()),
            "im-route-dlq",
            Duration::from_secs(1),
            metrics.clone(),
        ));
        let dispatcher = Arc::new(InboundDispatcher::new(
            Arc::new(consumer.clone()),
            presence.clone(),
            registry.clone(),
            dead_letter,
            Duration::from_millis(20),
            metrics.clone(),
        ));
        let selector = new_balancer(BalancerStrategy::Hash, seed_node_set(&cfg)).unwrap();
        let pool = RpcConnectionPool::new(
            TonicConnector::from_config(&cfg.rpc_pool).unwrap(),
            &cfg.rpc_pool,
            metrics.clone(),
        );

        let ctx = RouteContext::builder(cfg, metrics)
            .registry(registry.clone())
            .presence(presence)
            .selector(selector)
            .dispatcher(dispatcher)
            .rpc_pool(pool.clone())
            .build();

        let (transport, rx) = ChannelTransport::new("10.0.0.2:5000", 1);
        registry.register("bob", Arc::new(transport)).await.unwrap();

        let discovery = Arc::new(StaticRegistry::new());
        ctx.start(Some(discovery.clone())).await.unwrap();
        assert_eq!(discovery.healthy_instances("flare-im-route").await.unwrap().len(), 1);

        consumer.push(InboundRecord {
            topic: "im-route".to_string(),
            key: Some("gw-9".to_string()),
            payload: b"{}".to_vec(),
            partition: 0,
            offset: 7,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        ctx.shutdown(Duration::from_secs(2)).await.unwrap();
        assert_eq!(registry.count(), 0);
        assert!(rx.is_closed());
        assert_eq!(consumer.committed(), vec![(0, 7)]);
        assert!(matches!(pool.acquire("127.0.0.1:1").await, Err(RouteError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_shutdown_releases_dispatcher_stuck_on_local_write() {
        let cfg = config();
        let metrics = Arc::new(RouteMetrics::new());
        let registry = Arc::new(ConnectionRegistry::new(4, metrics.clone()));
        let presence = Arc::new(PresenceDirectory::new(
            Arc::new(MemoryStore::new()),
            &PresenceConfig::default(),
            metrics.clone(),
        ));
        let consumer = MemoryConsumer::new();
        let broker = MemoryBroker::new();
        let dead_letter = Arc::new(DeadLetterSink::new(
            Arc::new(broker.clone()),
            "im-route-dlq",
            Duration::from_secs(1),
            metrics.clone(),
        ));
        // 写入超时远大于停机期限，只有关闭连接才能让分发器脱身
        let dispatcher = Arc::new(
            InboundDispatcher::new(
                Arc::new(consumer.clone()),
                presence.clone(),
                registry.clone(),
                dead_letter,
                Duration::from_millis(20),
                metrics.clone(),
            )
            .with_write_timeout(Duration::from_secs(60)),
        );
        let ctx = RouteContext::builder(cfg, metrics)
            .registry(registry.clone())
            .presence(presence.clone())
            .dispatcher(dispatcher)
            .build();

        presence
            .put(
                &CancellationToken::new(),
                PresenceRecord::online("bob", "gw-1", "gw-1:9000"),
            )
            .await
            .unwrap();
        let (transport, _rx) = ChannelTransport::new("10.0.0.2:5000", 1);
        registry.register("bob", Arc::new(transport)).await.unwrap();

        let payload = MessageEnvelope {
            sender_id: "alice".to_string(),
            receiver_id: "bob".to_string(),
            message_type: MessageType::Text,
            content: "hello".to_string(),
            time: 1,
            status: MessageStatus::Send,
            scope: MessageScope::Direct,
            message_id: Some(1),
            seq: Some(1),
        }
        .encode()
        .unwrap();
        for offset in 0..2 {
            consumer.push(InboundRecord {
                topic: "im-route".to_string(),
                key: Some("gw-1".to_string()),
                payload: payload.clone(),
                partition: 0,
                offset,
            });
        }

        ctx.start(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        ctx.shutdown(Duration::from_millis(500)).await.unwrap();
        assert_eq!(registry.count(), 0);
        assert_eq!(consumer.committed(), vec![(0, 0), (0, 1)]);
        let dead = broker.published("im-route-dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, payload);
    }
}
