//! Allocator Benchmark Suite
//!
//! Compares the caching manager against the native allocator it wraps:
//! - Steady-state alloc/free of a single size class (pure reuse)
//! - Mixed request sizes across many size classes
//! - Debug mode (caching disabled) as the native baseline
//! - Garbage collection of a populated free list
//!
//! Run with: `cargo bench --bench alloc_bench`

use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};

use memforge::backend::{HostAllocator, HostDevices, NativeAllocator};
use memforge::config::MemoryConfig;
use memforge::memory::{format_bytes, MemoryManager};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

// ============================================================================
// Benchmark Harness
// ============================================================================

struct Benchmark {
    name: String,
    iterations: usize,
    warmup_iterations: usize,
}

impl Benchmark {
    fn new(name: &str, iterations: usize) -> Self {
        Benchmark {
            name: name.to_string(),
            iterations,
            warmup_iterations: iterations.min(10),
        }
    }

    fn run<F, R>(&self, mut f: F) -> BenchmarkResult
    where
        F: FnMut() -> R,
    {
        for _ in 0..self.warmup_iterations {
            black_box(f());
        }

        let mut durations = Vec::with_capacity(self.iterations);
        for _ in 0..self.iterations {
            let start = Instant::now();
            black_box(f());
            durations.push(start.elapsed());
        }

        BenchmarkResult {
            name: self.name.clone(),
            durations,
        }
    }
}

struct BenchmarkResult {
    name: String,
    durations: Vec<Duration>,
}

impl BenchmarkResult {
    fn report(&self, ops_per_iteration: usize) {
        let mut sorted = self.durations.clone();
        sorted.sort();
        let total: Duration = sorted.iter().sum();
        let avg = total / sorted.len().max(1) as u32;
        let p50 = sorted[sorted.len() / 2];
        let p99 = sorted[(sorted.len() * 99) / 100];
        let per_op_ns = avg.as_nanos() as f64 / ops_per_iteration.max(1) as f64;

        println!("\n=== {} ===", self.name);
        println!("Iterations: {}", sorted.len());
        println!("Average: {:?} ({:.1} ns/op)", avg, per_op_ns);
        println!("P50:     {:?}", p50);
        println!("P99:     {:?}", p99);
    }
}

fn manager(config: MemoryConfig) -> MemoryManager {
    MemoryManager::new(
        config,
        Arc::new(HostAllocator::new()),
        Arc::new(HostDevices::with_memory_size(1, 1 << 34)),
    )
    .expect("manager construction")
}

/// Deterministic request sizes spread over many size classes
fn request_sizes(count: usize, max: usize) -> Vec<usize> {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    (0..count).map(|_| rng.gen_range(1..=max)).collect()
}

// ============================================================================
// Benchmarks
// ============================================================================

const OPS: usize = 1_000;

fn benchmark_native_baseline() {
    let native = HostAllocator::new();
    let result = Benchmark::new("native malloc/free (4 KB)", 200).run(|| {
        for _ in 0..OPS {
            let ptr = native.alloc(4096).expect("native alloc");
            native.free(black_box(ptr), 4096).expect("native free");
        }
    });
    result.report(OPS);
}

fn benchmark_steady_reuse() {
    let mm = manager(MemoryConfig::new());
    let result = Benchmark::new("cached alloc/free, single class (4 KB)", 200).run(|| {
        for _ in 0..OPS {
            let ptr = mm.alloc(4096, false).expect("alloc");
            mm.unlock(black_box(ptr), false).expect("unlock");
        }
    });
    result.report(OPS);
    println!("  {}", mm.stats(0).expect("stats"));
}

fn benchmark_mixed_sizes(debug_mode: bool) {
    let mm = manager(MemoryConfig::new().with_debug_mode(debug_mode));
    let sizes = request_sizes(OPS, 256 * 1024);
    let name = if debug_mode {
        "mixed sizes, caching disabled"
    } else {
        "mixed sizes, caching enabled"
    };

    let mut live = Vec::with_capacity(16);
    let result = Benchmark::new(name, 100).run(|| {
        for &bytes in &sizes {
            live.push(mm.alloc(bytes, false).expect("alloc"));
            if live.len() == 16 {
                for ptr in live.drain(..) {
                    mm.unlock(ptr, false).expect("unlock");
                }
            }
        }
    });
    for ptr in live.drain(..) {
        mm.unlock(ptr, false).expect("unlock");
    }
    result.report(OPS);

    let stats = mm.stats(0).expect("stats");
    println!(
        "  held {} in {} buffers, reuse rate {:.1}%",
        format_bytes(stats.total_bytes),
        stats.total_buffers,
        stats.reuse_rate_percent()
    );
}

fn benchmark_garbage_collect() {
    let mm = manager(MemoryConfig::new());
    let sizes = request_sizes(512, 1 << 20);
    let result = Benchmark::new("garbage_collect of 512 free buffers", 50).run(|| {
        let ptrs: Vec<_> = sizes
            .iter()
            .map(|&bytes| mm.alloc(bytes, false).expect("alloc"))
            .collect();
        for ptr in ptrs {
            mm.unlock(ptr, false).expect("unlock");
        }
        mm.garbage_collect().expect("gc")
    });
    result.report(sizes.len());
}

fn main() {
    println!("memforge allocator benchmarks");
    println!("=============================");

    benchmark_native_baseline();
    benchmark_steady_reuse();
    benchmark_mixed_sizes(false);
    benchmark_mixed_sizes(true);
    benchmark_garbage_collect();
}
