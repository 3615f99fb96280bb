//! CLI comparing sequential and speculative parallel block delivery.

use clap::Parser;
use deliver_bench::{Executor, ParallelExecutor, SequentialExecutor, Workload, WorkloadConfig};
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "deliver-bench")]
#[command(about = "Benchmark speculative parallel block delivery against sequential delivery")]
struct Args {
    /// Number of funded accounts
    #[arg(long, default_value = "1000")]
    accounts: usize,

    /// Number of transactions per run
    #[arg(long, default_value = "1000")]
    transactions: usize,

    /// Transactions per block
    #[arg(long, default_value = "250")]
    block_size: usize,

    /// Conflict factors to run, comma separated
    #[arg(long, value_delimiter = ',', default_value = "0,0.25,0.5,0.75,1")]
    conflicts: Vec<f64>,

    /// Share of EVM transfers
    #[arg(long, default_value = "0.5")]
    evm_ratio: f64,

    /// Share of transfers that fail their pre-checks
    #[arg(long, default_value = "0.0")]
    invalid_ratio: f64,

    /// Worker threads for parallel delivery
    #[arg(long, default_value = "8")]
    threads: usize,

    /// Skip signature verification in the ante step
    #[arg(long)]
    no_verify: bool,

    /// Workload seed
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        accounts = args.accounts,
        transactions = args.transactions,
        block_size = args.block_size,
        threads = args.threads,
        verify = !args.no_verify,
        "starting delivery benchmark"
    );

    let sequential = SequentialExecutor::new(!args.no_verify);
    let parallel = ParallelExecutor::new(!args.no_verify, args.threads);
    let executors: [&dyn Executor; 2] = [&sequential, &parallel];

    println!(
        "{:>9} | {:>10} | {:>6} | {:>6} | {:>6} | {:>9} | {:>9}",
        "conflict", "executor", "ok", "failed", "reruns", "ms", "tx/s"
    );
    for &conflict_factor in &args.conflicts {
        let config = WorkloadConfig {
            num_accounts: args.accounts,
            num_transactions: args.transactions,
            transactions_per_block: args.block_size,
            conflict_factor,
            evm_ratio: args.evm_ratio,
            invalid_ratio: args.invalid_ratio,
            seed: args.seed,
            chain_id: 1,
        };

        // Generate workload (includes signing).
        let workload = Workload::generate(config);

        let mut roots = Vec::with_capacity(executors.len());
        for executor in executors {
            let start = Instant::now();
            let (store, result) = executor.execute(&workload)?;
            let elapsed = start.elapsed();

            let tps = result.total() as f64 / elapsed.as_secs_f64();
            println!(
                "{:>8.0}% | {:>10} | {:>6} | {:>6} | {:>6} | {:>9.2} | {:>9.0}",
                conflict_factor * 100.0,
                executor.name(),
                result.successful,
                result.failed,
                result.reruns,
                elapsed.as_secs_f64() * 1000.0,
                tps
            );
            roots.push((executor.name(), store.state_root()));
        }

        if let Some((_, expected)) = roots.first() {
            for (name, root) in &roots[1..] {
                if root != expected {
                    error!(%conflict_factor, executor = name, %root, %expected, "state root mismatch");
                    return Err(format!("{name} diverged from sequential delivery").into());
                }
            }
        }
    }

    Ok(())
}
