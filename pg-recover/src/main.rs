use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pg_recover_lib::context::TimeWindow;
use pg_recover_lib::wal::{discover, list_segments, CancellationToken, FpwCache};

#[derive(Parser, Debug)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

/// Subcommands available. Wires the library's discovery pass onto a
/// terminal; argument validation beyond what `clap::Parser` gives for
/// free is out of scope.
#[derive(Subcommand, Debug)]
enum Commands {
    /// List candidate transactions in a WAL archive directory.
    Discover {
        #[arg(long)]
        archive_dir: PathBuf,
        #[arg(long)]
        cache_dir: PathBuf,
        #[arg(long)]
        segment_size: u64,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Discover { archive_dir, cache_dir, segment_size } => {
            let segments = list_segments(&archive_dir)?;
            let cache = FpwCache::open(&cache_dir)?;
            let window = TimeWindow::new(None, None);
            let cancel = CancellationToken::new();
            let transactions = discover(&archive_dir, &segments, segment_size, &cache, window, &cancel)?;
            for txn in transactions {
                println!(
                    "xid={} commit_time={} relfilenodes={:?} tuples={}",
                    txn.xid, txn.commit_time, txn.relfilenodes, txn.tuple_count
                );
            }
        }
    }

    Ok(())
}
