// Criterion benchmarks for birpc-manager
//
// Run benchmarks with:
//   cargo bench -p birpc-manager
//
// For detailed output with plots:
//   cargo bench -p birpc-manager -- --save-baseline main

use birpc_common::transport::MessageChannel;
use birpc_common::Params;
use birpc_manager::{ConnectionManager, ManagerConfig};
use birpc_server::Exposed;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use tokio::runtime::Runtime;

/// A caller connected to `peers` managers that all expose `Logger.flush`.
fn fan(rt: &Runtime, peers: usize) -> (ConnectionManager, Vec<ConnectionManager>) {
    rt.block_on(async {
        let caller = ConnectionManager::new(ManagerConfig::default());
        let mut servers = Vec::new();
        for _ in 0..peers {
            let server = ConnectionManager::new(ManagerConfig::default());
            server.register(&Exposed::new("Logger").method("flush", |_| Ok(true)), None);
            let (a, b) = MessageChannel::pair();
            let remote = caller.serve(a);
            server.serve(b);
            remote.wait_ready().await.expect("discovery failed");
            servers.push(server);
        }
        (caller, servers)
    })
}

fn bench_single_call(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let (caller, _servers) = fan(&rt, 1);

    c.bench_function("single_call", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(caller.call("Logger.flush", Params::empty()).await).ok();
        });
    });
}

fn bench_call_all(c: &mut Criterion) {
    let mut group = c.benchmark_group("call_all");
    let rt = Runtime::new().expect("runtime");

    for peers in [1, 4, 16].iter() {
        let (caller, _servers) = fan(&rt, *peers);
        group.bench_with_input(BenchmarkId::from_parameter(peers), peers, |b, _| {
            b.to_async(&rt).iter(|| async {
                black_box(caller.call_all("Logger.flush", vec![json!("now")]).await).ok();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_single_call, bench_call_all);
criterion_main!(benches);
