//! 路由核心性能基准测试
//! 测试节点选择、分区映射和 ID 生成的吞吐量

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use flare_im_route::balancer::{KetamaBalancer, NodeSelector, PartitionSelector, RoundRobinBalancer};
use flare_im_route::config::PresenceConfig;
use flare_im_route::metrics::RouteMetrics;
use flare_im_route::presence::store::MemoryStore;
use flare_im_route::presence::{PresenceDirectory, PresenceRecord};
use flare_im_route::idgen::{SnowflakeGenerator, WorkerId};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

fn bench_node_selection(c: &mut Criterion) {
    let nodes: HashMap<String, u32> = (0..16).map(|i| (format!("gw-{i}"), 1 + i % 3)).collect();
    let ketama = KetamaBalancer::new(nodes).unwrap();
    let ordered: Vec<String> = (0..16).map(|i| format!("gw-{i}")).collect();
    let round_robin = RoundRobinBalancer::new(&ordered).unwrap();
    let partitions = PartitionSelector::new(64).unwrap();
    let keys: Vec<String> = (0..1024).map(|i| format!("user_{i}")).collect();

    let mut group = c.benchmark_group("node_selection");
    group.throughput(Throughput::Elements(1));

    let mut i = 0usize;
    group.bench_function("ketama_select", |b| {
        b.iter(|| {
            i = (i + 1) % keys.len();
            ketama.select_node(&keys[i]).unwrap()
        })
    });

    group.bench_function("round_robin_select", |b| {
        b.iter(|| round_robin.select_node("ignored").unwrap())
    });

    group.bench_function("partition_for_node", |b| {
        b.iter(|| partitions.partition_for("gw-7").unwrap())
    });

    group.finish();
}

fn bench_snowflake(c: &mut Criterion) {
    let generator = SnowflakeGenerator::new(WorkerId::new(1, 2, 3).unwrap());

    let mut group = c.benchmark_group("idgen");
    group.throughput(Throughput::Elements(1));
    group.bench_function("snowflake_next_id", |b| b.iter(|| generator.next_id()));
    group.finish();
}

fn bench_presence_lookup(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let directory = Arc::new(PresenceDirectory::new(
        Arc::new(MemoryStore::new()),
        &PresenceConfig {
            local_ttl_ms: 60_000,
            ..PresenceConfig::default()
        },
        Arc::new(RouteMetrics::new()),
    ));
    let cancel = CancellationToken::new();
    rt.block_on(async {
        for i in 0..1000 {
            directory
                .put(&cancel, PresenceRecord::online(format!("user_{i}"), "gw-1", "gw-1:9000"))
                .await
                .unwrap();
        }
    });

    let mut group = c.benchmark_group("presence");
    group.throughput(Throughput::Elements(1));
    group.measurement_time(Duration::from_secs(5));
    group.bench_function("cached_get", |b| {
        b.iter(|| {
            rt.block_on(async { directory.get(&cancel, "user_500").await.unwrap() })
        })
    });
    group.finish();
}

criterion_group!(benches, bench_node_selection, bench_snowflake, bench_presence_lookup);
criterion_main!(benches);
