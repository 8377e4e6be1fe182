//! # Prometheus 指标收集模块
//!
//! 为路由核心各组件提供统一的 Prometheus 指标收集能力。
//! 死信发布失败是设计中唯一接受的数据丢失点，必须通过指标可观测。

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// 全局指标注册表
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// 路由核心指标
pub struct RouteMetrics {
    /// 本地直接写入成功的消息数
    pub delivered_local_total: IntCounter,
    /// 跨节点发布成功的消息数
    pub published_remote_total: IntCounter,
    /// 发布重试次数
    pub publish_retry_total: IntCounter,
    /// 转入死信队列的消息数（按原因）
    pub dead_letter_total: IntCounterVec,
    /// 死信发布失败次数（消息丢失）
    pub dead_letter_failure_total: IntCounter,
    /// 投递耗时（秒）
    pub deliver_duration_seconds: Histogram,
    /// 入站分发器消费的记录数
    pub dispatcher_consumed_total: IntCounter,
    /// 入站记录解码失败数
    pub dispatcher_decode_failure_total: IntCounter,
    /// 非本节点记录（共享分区）跳过数
    pub dispatcher_skipped_total: IntCounter,
    /// 当前注册的本地连接数
    pub registry_connections: IntGauge,
    /// 因容量已满被拒绝的注册数
    pub registry_rejected_total: IntCounter,
    /// RPC 连接池通道数
    pub rpc_pool_channels: IntGauge,
    /// RPC 连接池耗尽次数
    pub rpc_pool_exhausted_total: IntCounter,
    /// 在线状态本地缓存命中
    pub presence_cache_hit_total: IntCounter,
    /// 在线状态本地缓存未命中
    pub presence_cache_miss_total: IntCounter,
}

impl RouteMetrics {
    pub fn new() -> Self {
        let delivered_local_total = IntCounter::new(
            "route_delivered_local_total",
            "Total number of messages written directly to a local connection",
        )
        .expect("Failed to create route_delivered_local_total metric");

        let published_remote_total = IntCounter::new(
            "route_published_remote_total",
            "Total number of messages published to the broker for another node",
        )
        .expect("Failed to create route_published_remote_total metric");

        let publish_retry_total = IntCounter::new(
            "route_publish_retry_total",
            "Total number of broker publish retries",
        )
        .expect("Failed to create route_publish_retry_total metric");

        let dead_letter_total = IntCounterVec::new(
            Opts::new(
                "route_dead_letter_total",
                "Total number of messages diverted to the dead-letter topic",
            ),
            &["reason"],
        )
        .expect("Failed to create route_dead_letter_total metric");

        let dead_letter_failure_total = IntCounter::new(
            "route_dead_letter_failure_total",
            "Total number of dead-letter publish failures (messages lost)",
        )
        .expect("Failed to create route_dead_letter_failure_total metric");

        let deliver_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "route_deliver_duration_seconds",
                "Delivery pipeline duration in seconds",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )
        .expect("Failed to create route_deliver_duration_seconds metric");

        let dispatcher_consumed_total = IntCounter::new(
            "route_dispatcher_consumed_total",
            "Total number of records consumed by the inbound dispatcher",
        )
        .expect("Failed to create route_dispatcher_consumed_total metric");

        let dispatcher_decode_failure_total = IntCounter::new(
            "route_dispatcher_decode_failure_total",
            "Total number of inbound records that failed to decode",
        )
        .expect("Failed to create route_dispatcher_decode_failure_total metric");

        let dispatcher_skipped_total = IntCounter::new(
            "route_dispatcher_skipped_total",
            "Total number of inbound records addressed to another node",
        )
        .expect("Failed to create route_dispatcher_skipped_total metric");

        let registry_connections = IntGauge::new(
            "route_registry_connections",
            "Number of live connections registered on this node",
        )
        .expect("Failed to create route_registry_connections metric");

        let registry_rejected_total = IntCounter::new(
            "route_registry_rejected_total",
            "Total number of registrations rejected because the registry was full",
        )
        .expect("Failed to create route_registry_rejected_total metric");

        let rpc_pool_channels = IntGauge::new(
            "route_rpc_pool_channels",
            "Number of pooled outbound rpc channels",
        )
        .expect("Failed to create route_rpc_pool_channels metric");

        let rpc_pool_exhausted_total = IntCounter::new(
            "route_rpc_pool_exhausted_total",
            "Total number of acquire calls rejected because the pool was exhausted",
        )
        .expect("Failed to create route_rpc_pool_exhausted_total metric");

        let presence_cache_hit_total = IntCounter::new(
            "route_presence_cache_hit_total",
            "Total number of presence lookups served from the local cache",
        )
        .expect("Failed to create route_presence_cache_hit_total metric");

        let presence_cache_miss_total = IntCounter::new(
            "route_presence_cache_miss_total",
            "Total number of presence lookups that went to the shared store",
        )
        .expect("Failed to create route_presence_cache_miss_total metric");

        // 注册指标，忽略重复注册错误（测试中会重复创建）
        let _ = REGISTRY.register(Box::new(delivered_local_total.clone()));
        let _ = REGISTRY.register(Box::new(published_remote_total.clone()));
        let _ = REGISTRY.register(Box::new(publish_retry_total.clone()));
        let _ = REGISTRY.register(Box::new(dead_letter_total.clone()));
        let _ = REGISTRY.register(Box::new(dead_letter_failure_total.clone()));
        let _ = REGISTRY.register(Box::new(deliver_duration_seconds.clone()));
        let _ = REGISTRY.register(Box::new(dispatcher_consumed_total.clone()));
        let _ = REGISTRY.register(Box::new(dispatcher_decode_failure_total.clone()));
        let _ = REGISTRY.register(Box::new(dispatcher_skipped_total.clone()));
        let _ = REGISTRY.register(Box::new(registry_connections.clone()));
        let _ = REGISTRY.register(Box::new(registry_rejected_total.clone()));
        let _ = REGISTRY.register(Box::new(rpc_pool_channels.clone()));
        let _ = REGISTRY.register(Box::new(rpc_pool_exhausted_total.clone()));
        let _ = REGISTRY.register(Box::new(presence_cache_hit_total.clone()));
        let _ = REGISTRY.register(Box::new(presence_cache_miss_total.clone()));

        Self {
            delivered_local_total,
            published_remote_total,
            publish_retry_total,
            dead_letter_total,
            dead_letter_failure_total,
            deliver_duration_seconds,
            dispatcher_consumed_total,
            dispatcher_decode_failure_total,
            dispatcher_skipped_total,
            registry_connections,
            registry_rejected_total,
            rpc_pool_channels,
            rpc_pool_exhausted_total,
            presence_cache_hit_total,
            presence_cache_miss_total,
        }
    }

    /// 记录一次死信转移
    pub fn record_dead_letter(&self, reason: &str) {
        self.dead_letter_total.with_label_values(&[reason]).inc();
    }
}

impl Default for RouteMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// 以 Prometheus 文本格式导出全局注册表
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode prometheus metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_independent_per_instance() {
        let a = RouteMetrics::new();
        let b = RouteMetrics::new();
        a.delivered_local_total.inc();
        assert_eq!(a.delivered_local_total.get(), 1);
        assert_eq!(b.delivered_local_total.get(), 0);
    }

    #[test]
    fn test_dead_letter_reason_label() {
        let metrics = RouteMetrics::new();
        metrics.record_dead_letter("presence_miss");
        metrics.record_dead_letter("presence_miss");
        metrics.record_dead_letter("retry_exhausted");
        assert_eq!(
            metrics
                .dead_letter_total
                .with_label_values(&["presence_miss"])
                .get(),
            2
        );
    }
}
