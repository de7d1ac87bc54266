use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use vnc_core::{
    CacheConfig, LogicalBlock, ReclaimPlan, Result, Tunables, VnodeCache, VnodeId, VnodeOps,
    VnodeType,
};

#[derive(Default)]
struct CountingOps {
    written: AtomicU64,
}

impl VnodeOps for CountingOps {
    fn write_buffer(&self, _: VnodeId, _: LogicalBlock, _: &[u8]) -> Result<()> {
        self.written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn tunables() -> Tunables {
    Tunables {
        desired_vnodes: 64,
        want_free_vnodes: 16,
        file_delay: 1,
        alloc_sleep_timeout_ms: 50,
        inactive_lock_wait_ms: 1,
        reclaim_tick_ms: 5,
        syncer_tick_ms: 5,
        ..Tunables::default()
    }
}

#[test]
fn daemons_settle_population_and_drain_writes() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 300;

    let cache = VnodeCache::new(CacheConfig {
        tunables: tunables(),
        batch_count: 2,
        batch_size: 4,
        syncer_slots: 8,
        ..CacheConfig::default()
    })
    .expect("cache");
    let ops = Arc::new(CountingOps::default());
    let mount = cache.mount("live", Arc::clone(&ops) as Arc<dyn VnodeOps>);
    let daemons = cache.spawn_daemons().expect("daemons");

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let cache = Arc::clone(&cache);
            let mount = Arc::clone(&mount);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for round in 0..ROUNDS {
                    let vp = cache.acquire(Some(&mount));
                    cache
                        .construct(&vp, &mount, VnodeType::Regular, None)
                        .expect("construct");
                    if (round + t) % 10 == 0 {
                        cache
                            .write_block(&vp, LogicalBlock(0), vec![1; 16])
                            .expect("write");
                    }
                    cache.release_use(&vp);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker");
    }

    let t = tunables();
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut live = cache.stats().live_vnodes;
    while ReclaimPlan::compute(live, &t).is_some() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
        live = cache.stats().live_vnodes;
    }
    assert!(
        ReclaimPlan::compute(live, &t).is_none(),
        "reclaimer left {live} live vnodes"
    );
    assert!(live >= t.want_free_vnodes, "over-reclaimed to {live}");

    daemons.shutdown();
    assert_eq!(cache.syncer_pending(), 0);
    assert!(ops.written.load(Ordering::Relaxed) > 0);
}
