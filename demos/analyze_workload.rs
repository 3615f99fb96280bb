use deliver_bench::{TxKind, Workload, WorkloadConfig};
use std::collections::HashMap;

fn main() {
    let config = WorkloadConfig {
        num_accounts: 50_000,
        num_transactions: 10_000,
        transactions_per_block: 5_000,
        conflict_factor: 0.0,
        evm_ratio: 0.5,
        invalid_ratio: 0.01,
        seed: 42,
        chain_id: 1,
    };

    let workload = Workload::generate(config);

    for (height, block) in workload.blocks.iter().enumerate() {
        // A transaction is a rerun candidate if it touches an account that an
        // earlier transaction of the same block already touched.
        let mut touched: HashMap<_, usize> = HashMap::new();
        let mut candidates = 0;
        for (index, tx) in block.iter().enumerate() {
            let seen_from = touched.insert(tx.from, index).is_some();
            let seen_to = touched.insert(tx.to, index).is_some();
            if seen_from || seen_to {
                candidates += 1;
            }
        }
        let evm = block.iter().filter(|tx| tx.kind == TxKind::Evm).count();

        println!(
            "block {}: {} txs, {} evm, {} accounts touched, {} rerun candidates",
            height,
            block.len(),
            evm,
            touched.len(),
            candidates
        );
    }

    let mut sender_counts: HashMap<_, usize> = HashMap::new();
    for tx in workload.blocks.iter().flatten() {
        *sender_counts.entry(tx.from).or_insert(0) += 1;
    }

    let multi_tx_accounts = sender_counts.values().filter(|&&count| count > 1).count();

    println!("\nTotal accounts that sent txs: {}", sender_counts.len());
    println!("Accounts that sent >1 tx: {}", multi_tx_accounts);
    println!(
        "Max txs from one account: {}",
        sender_counts.values().max().copied().unwrap_or(0)
    );

    let mut hist = HashMap::new();
    for count in sender_counts.values() {
        *hist.entry(*count).or_insert(0) += 1;
    }

    println!("\nTransaction count distribution:");
    let mut hist_vec: Vec<_> = hist.iter().collect();
    hist_vec.sort_by_key(|(k, _)| *k);
    for (count, num_accounts) in hist_vec {
        println!("  {} tx: {} accounts", count, num_accounts);
    }
}
