//! Flare IM Route 配置模块
//!
//! 该模块提供路由核心的配置管理功能，包括：
//! - 配置文件加载和解析（单文件或分层目录）
//! - 环境特定配置覆盖
//! - 各组件配置定义（连接注册表、在线状态、负载均衡、投递、Kafka、Redis、ID 生成、RPC 连接池、日志）
//! - 热加载：配置快照原子替换，读取方始终看到完整快照

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use toml::Value;

use crate::balancer::NodeSet;
use crate::idgen::WorkerId;

mod manager;
pub use manager::ConfigManager;

/// 本节点配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct NodeConfig {
    /// 节点 ID（必填）
    #[serde(default)]
    pub node_id: String,
    /// 节点对外地址
    #[serde(default)]
    pub address: String,
}

/// 连接注册表配置
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// 单节点最大连接数
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// 单次本地写入等待上限（毫秒），客户端不读取时超时转死信
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

impl ConnectionConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// 在线状态目录配置
#[derive(Debug, Clone, Deserialize)]
pub struct PresenceConfig {
    /// 共享存储 key 前缀
    #[serde(default = "default_presence_prefix")]
    pub key_prefix: String,
    /// 本地缓存 TTL（毫秒）
    #[serde(default = "default_presence_local_ttl_ms")]
    pub local_ttl_ms: u64,
    /// 本地缓存最大条目数
    #[serde(default = "default_presence_local_max_entries")]
    pub local_max_entries: usize,
    /// 共享存储记录过期时间（秒，0 表示不过期）
    #[serde(default)]
    pub record_ttl_secs: u64,
    /// 共享存储调用超时（毫秒）
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_presence_prefix(),
            local_ttl_ms: default_presence_local_ttl_ms(),
            local_max_entries: default_presence_local_max_entries(),
            record_ttl_secs: 0,
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

/// 负载均衡策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BalancerStrategy {
    /// Ketama 一致性哈希
    #[default]
    Hash,
    /// 轮询
    RoundRobin,
}

/// 负载均衡配置
#[derive(Debug, Clone, Deserialize)]
pub struct BalancerConfig {
    #[serde(default)]
    pub strategy: BalancerStrategy,
    /// 一致性哈希节点及权重
    #[serde(default)]
    pub weighted_nodes: BTreeMap<String, u32>,
    /// 轮询节点列表
    #[serde(default)]
    pub ordered_nodes: Vec<String>,
    /// 投递主题分区数（节点 ID -> 分区的一致性哈希环）
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    /// 服务实例刷新间隔（毫秒）
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    /// 注册中心中的服务名
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: BalancerStrategy::default(),
            weighted_nodes: BTreeMap::new(),
            ordered_nodes: Vec::new(),
            partitions: default_partitions(),
            refresh_interval_ms: default_refresh_interval_ms(),
            service_name: default_service_name(),
        }
    }
}

impl BalancerConfig {
    /// 按策略构造节点集合
    pub fn node_set(&self) -> NodeSet {
        match self.strategy {
            BalancerStrategy::Hash => NodeSet::Weighted(
                self.weighted_nodes
                    .iter()
                    .map(|(node, weight)| (node.clone(), *weight))
                    .collect(),
            ),
            BalancerStrategy::RoundRobin => NodeSet::Ordered(self.ordered_nodes.clone()),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }
}

/// 投递重试配置
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// 最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 初始退避（毫秒）
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// 最大退避（毫秒）
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// 退避倍数
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// 单次发布超时（毫秒）
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            publish_timeout_ms: default_publish_timeout_ms(),
        }
    }
}

/// Kafka 集群配置
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaClusterConfig {
    /// Kafka 服务器地址列表
    #[serde(default)]
    pub bootstrap_servers: String,
    /// 投递主题
    #[serde(default = "default_topic")]
    pub topic: String,
    /// 消费组前缀（实际消费组为 `{group_id}-{node_id}`）
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// 死信主题后缀
    #[serde(default = "default_dlq_suffix")]
    pub dlq_topic_suffix: String,
    /// 单次读取等待（毫秒）
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// 客户端标识
    #[serde(default)]
    pub client_id: Option<String>,
    /// 其他选项（原样透传给 librdkafka）
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl Default for KafkaClusterConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: String::new(),
            topic: default_topic(),
            group_id: default_group_id(),
            dlq_topic_suffix: default_dlq_suffix(),
            read_timeout_ms: default_read_timeout_ms(),
            client_id: None,
            options: HashMap::new(),
        }
    }
}

impl KafkaClusterConfig {
    /// 死信主题 = 主主题 + 后缀
    pub fn dead_letter_topic(&self) -> String {
        format!("{}{}", self.topic, self.dlq_topic_suffix)
    }
}

/// Redis 配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RedisPoolConfig {
    /// Redis 服务器地址
    #[serde(default)]
    pub url: String,
}

/// ID 生成配置
#[derive(Debug, Clone, Deserialize)]
pub struct IdGenConfig {
    #[serde(default)]
    pub biz_id: u16,
    #[serde(default)]
    pub datacenter_id: u16,
    #[serde(default)]
    pub machine_id: u16,
    /// 会话序列号 key 前缀
    #[serde(default = "default_seq_prefix")]
    pub seq_key_prefix: String,
    /// 共享计数器调用超时（毫秒）
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
}

impl Default for IdGenConfig {
    fn default() -> Self {
        Self {
            biz_id: 0,
            datacenter_id: 0,
            machine_id: 0,
            seq_key_prefix: default_seq_prefix(),
            store_timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl IdGenConfig {
    pub fn worker_id(&self) -> crate::error::Result<WorkerId> {
        WorkerId::new(self.biz_id, self.datacenter_id, self.machine_id)
    }
}

/// RPC 传输层 TLS 配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RpcTlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
    #[serde(default)]
    pub ca_file: Option<String>,
    #[serde(default)]
    pub domain_name: Option<String>,
}

/// RPC 连接池配置
#[derive(Debug, Clone, Deserialize)]
pub struct RpcPoolConfig {
    /// 每个地址最大连接数
    #[serde(default = "default_max_conn_per_address")]
    pub max_conn_per_address: usize,
    /// 连接超时（毫秒）
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// 空闲超时（毫秒）
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// 空闲回收间隔（毫秒）
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
    /// keepalive ping 间隔（毫秒）
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_interval_ms: u64,
    /// keepalive ping 响应超时（毫秒）
    #[serde(default = "default_keep_alive_timeout_ms")]
    pub keep_alive_timeout_ms: u64,
    /// 无活跃流时是否发送 keepalive
    #[serde(default)]
    pub keep_alive_while_idle: bool,
    #[serde(default)]
    pub tls: RpcTlsConfig,
}

impl Default for RpcPoolConfig {
    fn default() -> Self {
        Self {
            max_conn_per_address: default_max_conn_per_address(),
            connect_timeout_ms: default_connect_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            reap_interval_ms: default_reap_interval_ms(),
            keep_alive_interval_ms: default_keep_alive_ms(),
            keep_alive_timeout_ms: default_keep_alive_timeout_ms(),
            keep_alive_while_idle: false,
            tls: RpcTlsConfig::default(),
        }
    }
}

impl RpcPoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

/// 日志配置
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 是否输出 JSON 格式
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub with_target: bool,
    #[serde(default = "default_true")]
    pub with_thread_ids: bool,
    #[serde(default = "default_true")]
    pub with_file: bool,
    #[serde(default = "default_true")]
    pub with_line_number: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            with_target: false,
            with_thread_ids: true,
            with_file: true,
            with_line_number: true,
        }
    }
}

/// 路由核心应用配置
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RouteAppConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub kafka: KafkaClusterConfig,
    #[serde(default)]
    pub redis: RedisPoolConfig,
    #[serde(default)]
    pub idgen: IdGenConfig,
    #[serde(default)]
    pub rpc_pool: RpcPoolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RouteAppConfig {
    /// 校验配置，致命错误在启动期直接返回
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::RouteError;

        if self.node.node_id.trim().is_empty() {
            return Err(RouteError::ConfigurationFatal(
                "node.node_id is required".to_string(),
            ));
        }
        if self.connection.max_connections == 0 {
            return Err(RouteError::ConfigurationFatal(
                "connection.max_connections must be positive".to_string(),
            ));
        }
        if self.balancer.partitions == 0 {
            return Err(RouteError::ConfigurationFatal(
                "balancer.partitions must be positive".to_string(),
            ));
        }
        if self.rpc_pool.max_conn_per_address == 0 {
            return Err(RouteError::ConfigurationFatal(
                "rpc_pool.max_conn_per_address must be positive".to_string(),
            ));
        }
        if self.kafka.bootstrap_servers.trim().is_empty() {
            return Err(RouteError::ConfigurationFatal(
                "kafka.bootstrap_servers is required".to_string(),
            ));
        }
        if self.rpc_pool.tls.enabled
            && (self.rpc_pool.tls.cert_file.is_none()
                || self.rpc_pool.tls.key_file.is_none()
                || self.rpc_pool.tls.ca_file.is_none())
        {
            return Err(RouteError::ConfigurationFatal(
                "rpc_pool.tls requires cert_file, key_file and ca_file".to_string(),
            ));
        }
        self.idgen.worker_id()?;
        Ok(())
    }
}

/// 加载配置
///
/// `path` 可以是单个 TOML 文件，也可以是包含 `base.toml` 的配置目录；
/// 加载后叠加 `config/environments/{FLARE_ENV}.toml` 并校验。
pub fn load_config(path: &Path) -> crate::error::Result<RouteAppConfig> {
    let mut merged = load_value_from_source(path)?;
    if let Err(e) = ConfigManager::merge_environment_overlay(&mut merged) {
        tracing::warn!("failed to load environment config: {}", e);
    }
    let cfg: RouteAppConfig = merged
        .try_into()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// 从源加载 TOML 值
fn load_value_from_source(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Err(anyhow!(
            "configuration path {} does not exist",
            path.display()
        ));
    }

    let metadata = path
        .metadata()
        .with_context(|| format!("unable to read metadata for {}", path.display()))?;

    if metadata.is_dir() {
        load_value_from_directory(path)
    } else {
        load_toml_value(path)
    }
}

/// 从目录加载配置
fn load_value_from_directory(path: &Path) -> Result<Value> {
    let base_file = path.join("base.toml");
    if !base_file.exists() {
        return Err(anyhow!(
            "missing base configuration: {}",
            base_file.display()
        ));
    }

    let mut merged = load_toml_value(&base_file)?;

    if !merged.is_table() {
        return Err(anyhow!(
            "base configuration must be a table: {}",
            base_file.display()
        ));
    }

    for layer in CONFIG_LAYERS {
        merge_directory(&mut merged, &path.join(layer))?;
    }

    Ok(merged)
}

/// 目录配置的叠加顺序
pub(crate) const CONFIG_LAYERS: [&str; 3] = ["shared", "services", "overrides"];

/// 列出目录中的 TOML 片段（按路径排序）
pub(crate) fn toml_fragments(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = fs::read_dir(dir)
        .with_context(|| format!("unable to read config directory {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(OsStr::to_str)
                .map(|ext| ext.eq_ignore_ascii_case("toml"))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();

    entries.sort();
    Ok(entries)
}

/// 合并目录中的配置
fn merge_directory(root: &mut Value, dir: &Path) -> Result<()> {
    for fragment in toml_fragments(dir)? {
        let value = load_toml_value(&fragment)?;
        merge_value(root, value);
    }
    Ok(())
}

/// 加载 TOML 值
pub(crate) fn load_toml_value(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("unable to read config fragment {}", path.display()))?;
    let value: Value = toml::from_str(&content)
        .with_context(|| format!("invalid TOML content in fragment {}", path.display()))?;
    Ok(value)
}

/// 深度合并 TOML 值
pub(crate) fn merge_value(base: &mut Value, overlay: Value) {
    match overlay {
        Value::Table(overlay_table) => {
            if let Value::Table(base_table) = base {
                for (key, overlay_value) in overlay_table.into_iter() {
                    match base_table.get_mut(&key) {
                        Some(base_value) => merge_value(base_value, overlay_value),
                        None => {
                            base_table.insert(key, overlay_value);
                        }
                    }
                }
            } else {
                *base = Value::Table(overlay_table);
            }
        }
        other => {
            *base = other;
        }
    }
}

fn default_max_connections() -> usize {
    400
}

fn default_write_timeout_ms() -> u64 {
    5_000
}

fn default_presence_prefix() -> String {
    "status:".to_string()
}

fn default_presence_local_ttl_ms() -> u64 {
    5_000
}

fn default_presence_local_max_entries() -> usize {
    100_000
}

fn default_store_timeout_ms() -> u64 {
    5_000
}

fn default_partitions() -> u32 {
    16
}

fn default_refresh_interval_ms() -> u64 {
    10_000
}

fn default_service_name() -> String {
    "flare-im-route".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_publish_timeout_ms() -> u64 {
    5_000
}

fn default_topic() -> String {
    "im-route".to_string()
}

fn default_group_id() -> String {
    "im-gateway".to_string()
}

fn default_dlq_suffix() -> String {
    "-dlq".to_string()
}

fn default_read_timeout_ms() -> u64 {
    35_000
}

fn default_seq_prefix() -> String {
    "seq:".to_string()
}

fn default_max_conn_per_address() -> usize {
    10
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_reap_interval_ms() -> u64 {
    30_000
}

fn default_keep_alive_ms() -> u64 {
    30_000
}

fn default_keep_alive_timeout_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}
