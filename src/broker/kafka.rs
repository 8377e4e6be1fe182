//! Kafka 实现（rdkafka）

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as _;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, info};

use super::{BrokerConsumer, InboundRecord, MessagePublisher, OutboundRecord};
use crate::config::KafkaClusterConfig;
use crate::error::{Result, RouteError};

fn base_client_config(config: &KafkaClusterConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.bootstrap_servers);
    if let Some(client_id) = &config.client_id {
        client.set("client.id", client_id);
    }
    for (key, value) in &config.options {
        client.set(key, value);
    }
    client
}

/// Kafka 生产者
pub struct KafkaPublisher {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaPublisher {
    pub fn new(config: &KafkaClusterConfig, send_timeout: Duration) -> Result<Self> {
        let producer: FutureProducer = base_client_config(config)
            .set("message.timeout.ms", send_timeout.as_millis().to_string())
            .set("acks", "all")
            .create()?;

        info!(
            bootstrap = %config.bootstrap_servers,
            topic = %config.topic,
            "Kafka publisher initialized"
        );
        Ok(Self {
            producer,
            send_timeout,
        })
    }
}

#[async_trait]
impl MessagePublisher for KafkaPublisher {
    async fn publish(&self, record: OutboundRecord) -> Result<()> {
        let mut future_record = FutureRecord::to(&record.topic)
            .key(&record.key)
            .payload(&record.payload);
        if let Some(partition) = record.partition {
            future_record = future_record.partition(partition);
        }

        match self.producer.send(future_record, self.send_timeout).await {
            Ok(_) => {
                debug!(topic = %record.topic, key = %record.key, "Record published");
                Ok(())
            }
            Err((e, _)) => Err(RouteError::Broker(e.to_string())),
        }
    }
}

/// 绑定单个分区的 Kafka 消费者
///
/// 消费组为 `{group_id}-{node_id}`，手动分配分区，手动提交位置。
pub struct KafkaPartitionConsumer {
    consumer: StreamConsumer,
    topic: String,
    partition: i32,
}

impl KafkaPartitionConsumer {
    pub fn new(config: &KafkaClusterConfig, node_id: &str, partition: i32) -> Result<Self> {
        let group_id = format!("{}-{}", config.group_id, node_id);
        let consumer: StreamConsumer = base_client_config(config)
            .set("group.id", &group_id)
            .set("enable.partition.eof", "false")
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .create()?;

        let mut assignment = TopicPartitionList::new();
        assignment.add_partition_offset(&config.topic, partition, Offset::Stored)?;
        consumer.assign(&assignment)?;

        info!(
            bootstrap = %config.bootstrap_servers,
            topic = %config.topic,
            group = %group_id,
            partition,
            "Kafka partition consumer assigned"
        );
        Ok(Self {
            consumer,
            topic: config.topic.clone(),
            partition,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

#[async_trait]
impl BrokerConsumer for KafkaPartitionConsumer {
    async fn recv(&self, timeout: Duration) -> Result<Option<InboundRecord>> {
        let message = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(Err(e)) => return Err(RouteError::Broker(e.to_string())),
            Ok(Ok(message)) => message,
        };

        Ok(Some(InboundRecord {
            topic: message.topic().to_string(),
            key: message
                .key()
                .map(|key| String::from_utf8_lossy(key).into_owned()),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            partition: message.partition(),
            offset: message.offset(),
        }))
    }

    async fn commit(&self, record: &InboundRecord) -> Result<()> {
        let mut position = TopicPartitionList::new();
        position.add_partition_offset(
            &record.topic,
            record.partition,
            Offset::Offset(record.offset + 1),
        )?;
        self.consumer.commit(&position, CommitMode::Async)?;
        Ok(())
    }
}
