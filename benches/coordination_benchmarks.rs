//! Performance Benchmarks for the Coordination Layer
//!
//! Measures replica-set bookkeeping, ring key hashing and routing, and a
//! full replicated commit round over the in-process network.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ringdb_core::*;
use std::sync::Arc;

fn replica(n: u16) -> DatabaseId {
    DatabaseId::new("bench", 7000 + n, "db")
}

fn bench_replica_bookkeeping(c: &mut Criterion) {
    let mut group = c.benchmark_group("replica_manager");
    for size in [3u16, 8, 32] {
        group.bench_with_input(BenchmarkId::new("complete_update", size), &size, |b, &size| {
            let mut replicas = ReplicaManager::new();
            for n in 0..size {
                replicas.add(replica(n));
            }
            b.iter(|| {
                let update_id = replicas.get_new_update_id();
                let expected = update_id - 1;
                let results: Vec<CommitResult> = replicas
                    .active_replicas()
                    .into_iter()
                    .map(|db| CommitResult {
                        replica: db,
                        commit: true,
                        update_id: expected,
                        expected_update_id: expected,
                        table: None,
                    })
                    .collect();
                black_box(replicas.complete_update(&results, update_id, true));
            });
        });
    }
    group.finish();
}

fn bench_ring_keys(c: &mut Criterion) {
    let address = NodeAddress::new("bench-host", 9000);
    c.bench_function("overlay_key_for_address", |b| {
        b.iter(|| OverlayKey::for_address(black_box(&address)))
    });

    let from = OverlayKey::for_name("from");
    let to = OverlayKey::for_name("to");
    let key = OverlayKey::for_name("systemTable");
    c.bench_function("overlay_key_in_range", |b| {
        b.iter(|| black_box(key).in_range(black_box(from), black_box(to)))
    });
}

fn bench_commit_round(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let network = LocalNetwork::new();
    let orders = TableInfo::from_full_name("PUBLIC.ORDERS");

    let nodes: Vec<Arc<DatabaseRemoteFacade>> = runtime.block_on(async {
        let mut nodes: Vec<Arc<DatabaseRemoteFacade>> = Vec::new();
        for n in 0..3u16 {
            let mut config = InstanceConfig::new(replica(n * 10));
            config.run_background_tasks = false;
            let env = InstanceEnvironment::in_process(network.clone())
                .unwrap()
                .with_known_hosts(nodes.first().map(|f| vec![f.database_id().clone()]).unwrap_or_default());
            nodes.push(DatabaseRemoteFacade::start(config, env).await.unwrap());
            for _ in 0..3 {
                for node in &nodes {
                    node.run_maintenance().await;
                }
            }
        }
        nodes[0]
            .create_table(&orders, "CREATE TABLE PUBLIC.ORDERS (ID INT)")
            .await
            .unwrap();
        for node in &nodes[1..] {
            node.register_replica(&orders).await.unwrap();
        }
        nodes
    });

    c.bench_function("replicated_insert_3_replicas", |b| {
        b.to_async(&runtime).iter(|| async {
            let outcome = nodes[0]
                .execute_update(&orders, "INSERT INTO PUBLIC.ORDERS VALUES (1)")
                .await
                .unwrap();
            black_box(outcome.committed)
        })
    });
}

criterion_group!(benches, bench_replica_bookkeeping, bench_ring_keys, bench_commit_round);
criterion_main!(benches);
