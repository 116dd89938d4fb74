use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use memforge::backend::{HostDevices, ImmediateQueue};
use memforge::config::MemoryConfig;
use memforge::context::MemoryContext;
use memforge::logging::init_logging_default;
use memforge::memory::format_bytes;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

#[derive(Parser, Debug)]
#[command(name = "memforge-cli", version)]
#[command(about = "Inspect and exercise the memforge caching allocator", long_about = None)]
struct Cli {
    /// Number of simulated devices
    #[arg(long, default_value_t = 1)]
    devices: usize,

    /// Size-class granularity in bytes (defaults to MEMFORGE_MEM_STEP_SIZE or 1024)
    #[arg(long)]
    step: Option<usize>,

    /// Buffer-count ceiling (defaults to MEMFORGE_MAX_BUFFERS or 1000)
    #[arg(long)]
    max_buffers: Option<usize>,

    /// Byte ceiling per device (defaults to MEMFORGE_MAX_BYTES or 75% of host memory)
    #[arg(long)]
    max_bytes: Option<usize>,

    /// Disable caching: every release frees natively
    #[arg(long)]
    debug_mode: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the configured limits and a report for every device
    Info,
    /// Run a multi-threaded alloc/free workload and print statistics
    Churn {
        /// Worker threads
        #[arg(long, default_value_t = 4)]
        threads: usize,
        /// Alloc/free rounds per thread
        #[arg(long, default_value_t = 10_000)]
        iterations: usize,
        /// Largest request size in bytes
        #[arg(long, default_value_t = 64 * 1024)]
        max_request: usize,
        /// Buffers each thread keeps alive at once
        #[arg(long, default_value_t = 8)]
        window: usize,
    },
}

impl Cli {
    fn memory_config(&self) -> anyhow::Result<MemoryConfig> {
        let mut config = MemoryConfig::from_env().context("invalid MEMFORGE_* environment")?;
        if self.debug_mode {
            config = config.with_debug_mode(true);
        }
        if let Some(step) = self.step {
            config = config.with_step_bytes(step);
        }
        if let Some(max_buffers) = self.max_buffers {
            config = config.with_max_buffers(max_buffers);
        }
        if let Some(max_bytes) = self.max_bytes {
            config = config.with_max_bytes(max_bytes);
        }
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    init_logging_default();
    let cli = Cli::parse();

    let devices = Arc::new(HostDevices::new(cli.devices));
    let ctx = MemoryContext::with_queue(cli.memory_config()?, Arc::new(ImmediateQueue), devices)
        .context("failed to create memory context")?;

    match cli.command {
        Commands::Info => run_info(&ctx),
        Commands::Churn {
            threads,
            iterations,
            max_request,
            window,
        } => run_churn(&ctx, threads, iterations, max_request, window),
    }
}

fn run_info(ctx: &MemoryContext) -> anyhow::Result<()> {
    println!("allocator:    {}", ctx.manager().allocator_name());
    println!("devices:      {}", ctx.manager().device_count());
    println!("step size:    {}", format_bytes(ctx.mem_step_size()?));
    println!("max buffers:  {}", ctx.max_buffers()?);
    println!("max bytes:    {}", format_bytes(ctx.max_bytes()?));
    for device in 0..ctx.manager().device_count() {
        println!("{}", ctx.manager().stats(device)?);
    }
    Ok(())
}

fn run_churn(
    ctx: &MemoryContext,
    threads: usize,
    iterations: usize,
    max_request: usize,
    window: usize,
) -> anyhow::Result<()> {
    let max_request = max_request.max(1);
    let window = window.max(1);
    let start = Instant::now();

    std::thread::scope(|scope| -> anyhow::Result<()> {
        let handles: Vec<_> = (0..threads.max(1))
            .map(|t| {
                let ctx = ctx.clone();
                scope.spawn(move || churn_worker(&ctx, t, iterations, max_request, window))
            })
            .collect();
        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("churn worker panicked"))??;
        }
        Ok(())
    })?;

    let elapsed = start.elapsed();
    let stats = ctx.manager().stats(0)?;
    let ops = threads.max(1) * iterations;
    println!("{} alloc/free pairs in {:.3} s", ops, elapsed.as_secs_f64());
    println!("{}", stats);

    let report = ctx.garbage_collect()?;
    println!(
        "garbage collected {} buffers ({})",
        report.buffers,
        format_bytes(report.bytes)
    );
    Ok(())
}

/// Keeps a sliding window of live buffers with randomly drawn sizes
fn churn_worker(
    ctx: &MemoryContext,
    seed: usize,
    iterations: usize,
    max_request: usize,
    window: usize,
) -> anyhow::Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed as u64);
    let mut live = Vec::with_capacity(window);

    for _ in 0..iterations {
        let bytes = rng.gen_range(1..=max_request);
        let ptr = ctx.mem_alloc::<u8>(bytes)?;
        live.push(ptr);
        if live.len() >= window {
            let victim = live.swap_remove(rng.gen_range(0..live.len()));
            ctx.mem_free(victim)?;
        }
    }
    for ptr in live {
        ctx.mem_free(ptr)?;
    }
    Ok(())
}
