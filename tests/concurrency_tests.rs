//! Concurrent use of one context from many threads

mod common;

use std::sync::Arc;
use std::thread;

use common::{context, CountingAllocator};
use memforge::config::MemoryConfig;

#[test]
fn test_parallel_churn_keeps_accounting_consistent() {
    let native = Arc::new(CountingAllocator::new());
    let (ctx, _) = context(MemoryConfig::new().with_step_bytes(256), native.clone(), 1);

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let ctx = ctx.clone();
            thread::spawn(move || {
                let mut live = Vec::new();
                for i in 0..500 {
                    let bytes = 1 + (t * 131 + i * 17) % 4096;
                    live.push(ctx.mem_alloc::<u8>(bytes).unwrap());
                    if live.len() > 4 {
                        ctx.mem_free(live.remove(0)).unwrap();
                    }
                    if i % 100 == 0 {
                        let p = ctx.mem_alloc_user(64).unwrap();
                        ctx.mem_lock(p).unwrap();
                        ctx.mem_unlock(p).unwrap();
                        ctx.mem_free_user(p).unwrap();
                    }
                }
                for p in live {
                    ctx.mem_free(p).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let stats = ctx.manager().stats(0).unwrap();
    assert_eq!(stats.in_use_bytes, 0);
    assert_eq!(stats.in_use_buffers, 0);
    assert_eq!(stats.lock_buffers, 0);
    assert_eq!(stats.free_buffers, stats.total_buffers);
    assert_eq!(stats.total_bytes, native.live_bytes());

    drop(ctx);
    assert_eq!(native.allocs(), native.frees());
    assert_eq!(native.double_frees(), 0);
}

#[test]
fn test_concurrent_garbage_collection() {
    let native = Arc::new(CountingAllocator::new());
    let (ctx, _) = context(MemoryConfig::new(), native.clone(), 1);

    let workers: Vec<_> = (0..4)
        .map(|t| {
            let ctx = ctx.clone();
            thread::spawn(move || {
                for i in 0..200 {
                    let p = ctx.mem_alloc_user(1024 * (1 + (t + i) % 8)).unwrap();
                    ctx.mem_free_user(p).unwrap();
                }
            })
        })
        .collect();
    let collector = {
        let ctx = ctx.clone();
        thread::spawn(move || {
            for _ in 0..50 {
                ctx.garbage_collect().unwrap();
            }
        })
    };

    for handle in workers {
        handle.join().unwrap();
    }
    collector.join().unwrap();

    ctx.garbage_collect().unwrap();
    assert_eq!(ctx.manager().stats(0).unwrap().total_buffers, 0);
    assert_eq!(native.allocs(), native.frees());
    assert_eq!(native.live_bytes(), 0);
}
