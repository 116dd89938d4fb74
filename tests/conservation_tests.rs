//! Property test: accounting always matches the buffers callers hold

mod common;

use std::sync::Arc;

use common::{context, CountingAllocator};
use memforge::config::MemoryConfig;
use memforge::memory::{size_class, DevicePtr};
use proptest::prelude::*;

const STEP: usize = 64;

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    Free(usize),
    Lock(usize),
    Unpin(usize),
    Collect,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0usize..1000).prop_map(Op::Alloc),
        3 => any::<usize>().prop_map(Op::Free),
        1 => any::<usize>().prop_map(Op::Lock),
        1 => any::<usize>().prop_map(Op::Unpin),
        1 => Just(Op::Collect),
    ]
}

/// What the caller believes it holds
struct Held {
    ptr: DevicePtr,
    class: usize,
    locked: bool,
}

proptest! {
    #[test]
    fn test_accounting_matches_held_buffers(ops in prop::collection::vec(op(), 1..60)) {
        let native = Arc::new(CountingAllocator::new());
        let (ctx, _) = context(MemoryConfig::new().with_step_bytes(STEP), native.clone(), 1);
        let mut held: Vec<Held> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(bytes) => {
                    let ptr = ctx.mem_alloc_user(bytes).unwrap();
                    let class = size_class(bytes, STEP).unwrap();
                    held.push(Held { ptr, class, locked: false });
                }
                Op::Free(i) if !held.is_empty() => {
                    let i = i % held.len();
                    if !held[i].locked {
                        ctx.mem_free_user(held.remove(i).ptr).unwrap();
                    }
                }
                Op::Lock(i) if !held.is_empty() => {
                    let i = i % held.len();
                    if !held[i].locked {
                        ctx.mem_lock(held[i].ptr).unwrap();
                        held[i].locked = true;
                    }
                }
                Op::Unpin(i) if !held.is_empty() => {
                    let i = i % held.len();
                    if held[i].locked {
                        ctx.mem_unlock(held[i].ptr).unwrap();
                        held[i].locked = false;
                    }
                }
                Op::Collect => {
                    ctx.garbage_collect().unwrap();
                }
                _ => {}
            }

            let stats = ctx.manager().stats(0).unwrap();
            let in_use: usize = held.iter().map(|h| h.class).sum();
            let locked: Vec<_> = held.iter().filter(|h| h.locked).collect();

            prop_assert_eq!(stats.in_use_bytes, in_use);
            prop_assert_eq!(stats.in_use_buffers, held.len());
            prop_assert_eq!(stats.lock_bytes, locked.iter().map(|h| h.class).sum::<usize>());
            prop_assert_eq!(stats.lock_buffers, locked.len());
            prop_assert_eq!(stats.total_buffers, held.len() + stats.free_buffers);
            prop_assert_eq!(stats.total_bytes, native.live_bytes());
            for h in &held {
                prop_assert_eq!(ctx.is_locked(h.ptr).unwrap(), h.locked);
            }
        }

        for h in held {
            if h.locked {
                ctx.mem_unlock(h.ptr).unwrap();
            }
            ctx.mem_free_user(h.ptr).unwrap();
        }
        drop(ctx);
        prop_assert_eq!(native.allocs(), native.frees());
    }
}
