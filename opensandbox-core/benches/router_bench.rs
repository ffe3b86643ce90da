//! `SandboxRouter::route` overhead on the hot (already-running) path, and
//! registration cost at fleet scale. Every exec/file/PTY call passes
//! through `route`, so its steady-state cost must stay well under the
//! operation it's gating.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use opensandbox_core::error::Result;
use opensandbox_core::router::{RuntimeHooks, SandboxRouter};
use tokio::runtime::Runtime;

struct NoopHooks;

#[async_trait]
impl RuntimeHooks for NoopHooks {
    async fn snapshot(&self, _id: &str) -> Result<(String, u64)> {
        Ok(("ck".into(), 0))
    }
    async fn restore(&self, _id: &str, _checkpoint_key: &str) -> Result<()> {
        Ok(())
    }
    async fn destroy(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}

fn route_hot_path(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let router = rt.block_on(async { SandboxRouter::new(Arc::new(NoopHooks)) });
    router.register("sbx-bench", Duration::from_secs(3600));

    c.bench_function("router/route_running", |b| {
        b.to_async(&rt)
            .iter(|| async { router.route("sbx-bench", || async { Ok(1u32) }).await.unwrap() });
    });
}

fn registration_at_scale(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("router/register");
    for fleet_size in [100usize, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(fleet_size), &fleet_size, |b, &fleet_size| {
            b.iter_batched(
                || rt.block_on(async { SandboxRouter::new(Arc::new(NoopHooks)) }),
                |router| {
                    for i in 0..fleet_size {
                        router.register(&format!("sbx-{i}"), Duration::from_secs(3600));
                    }
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, route_hot_path, registration_at_scale);
criterion_main!(benches);
