#![forbid(unsafe_code)]

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use vnc_core::{CacheConfig, LogicalBlock, Mount, Result, Tunables, Vnode, VnodeCache, VnodeId};
use vnc_core::{VnodeOps, VnodeType};

struct NullOps;

impl VnodeOps for NullOps {
    fn write_buffer(&self, _: VnodeId, _: LogicalBlock, _: &[u8]) -> Result<()> {
        Ok(())
    }
}

fn setup(desired: u64) -> (Arc<VnodeCache>, Arc<Mount>) {
    let cache = VnodeCache::new(CacheConfig {
        tunables: Tunables {
            desired_vnodes: desired,
            want_free_vnodes: desired / 4,
            ..Tunables::default()
        },
        batch_count: 4,
        ..CacheConfig::default()
    })
    .expect("cache");
    let mount = cache.mount("bench", Arc::new(NullOps));
    (cache, mount)
}

fn open(cache: &VnodeCache, mount: &Arc<Mount>) -> Arc<Vnode> {
    let vp = cache.acquire(Some(mount));
    cache
        .construct(&vp, mount, VnodeType::Regular, None)
        .expect("construct");
    vp
}

// ── Benchmarks ──────────────────────────────────────────────────────────

fn bench_hold_fast_path(c: &mut Criterion) {
    let (cache, mount) = setup(1024);
    let vp = open(&cache, &mount);

    c.bench_function("hold_drop_fast", |b| {
        b.iter(|| {
            cache.hold(black_box(&vp)).expect("hold");
            cache.drop_hold(black_box(&vp));
        });
    });
    cache.release_use(&vp);
}

fn bench_last_hold_batches(c: &mut Criterion) {
    let (cache, mount) = setup(1024);
    let vp = open(&cache, &mount);
    cache.release_use(&vp);

    // Every iteration drops the last hold and stages a batch entry.
    c.bench_function("hold_drop_last", |b| {
        b.iter(|| {
            cache.hold(black_box(&vp)).expect("hold");
            cache.drop_hold(black_box(&vp));
        });
    });
}

fn bench_use_cycle(c: &mut Criterion) {
    let (cache, mount) = setup(1024);
    let vp = open(&cache, &mount);

    c.bench_function("use_acquire_release", |b| {
        b.iter(|| {
            cache.add_use(black_box(&vp)).expect("use");
            cache.release_use(black_box(&vp));
        });
    });
    cache.release_use(&vp);
}

fn bench_recycle_churn(c: &mut Criterion) {
    let (cache, mount) = setup(256);
    for _ in 0..256 {
        let vp = open(&cache, &mount);
        cache.release_use(&vp);
    }

    // At the limit every open recycles an idle vnode first.
    c.bench_function("open_close_at_limit", |b| {
        b.iter(|| {
            let vp = open(&cache, &mount);
            cache.release_use(black_box(&vp));
        });
    });
}

criterion_group!(
    benches,
    bench_hold_fast_path,
    bench_last_hold_batches,
    bench_use_cycle,
    bench_recycle_churn
);
criterion_main!(benches);
