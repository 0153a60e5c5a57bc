use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use pixels_cache::coordination::FileCoordinationStore;
use pixels_cache::daemon::{stop_path, CacheDaemon};
use pixels_cache::source::FileBlockSource;
use pixels_cache::writer;
use pixels_cache::CacheConfig;

#[derive(Parser)]
#[command(name = "pixcached", version = "0.1.0", about = "Pixels columnar-chunk cache daemon")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cache writer daemon in the foreground
    Start {
        /// Cache configuration file (JSON, dotted keys)
        #[arg(short, long)]
        config: PathBuf,
        /// Coordination store directory
        #[arg(long)]
        coordination: PathBuf,
        /// Host name used in coordination keys
        #[arg(long, default_value = "localhost")]
        host: String,
        /// Re-initialize both mapped files instead of reusing them
        #[arg(long)]
        overwrite: bool,
        /// Seconds between coordination polls
        #[arg(long, default_value = "1")]
        poll_interval: u64,
    },
    /// Ask a running daemon to exit
    Stop {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show the index header of an existing cache
    Status {
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    match Cli::parse().command {
        // ── Start ────────────────────────────────────────────────────────────
        Commands::Start { config, coordination, host, overwrite, poll_interval } => {
            let cfg = CacheConfig::load(&config)?;
            let store = FileCoordinationStore::new(&coordination)?;
            let source = FileBlockSource::new();
            let mut daemon = CacheDaemon::new(
                cfg,
                store,
                source,
                host,
                overwrite,
                Duration::from_secs(poll_interval),
            )?;
            daemon.run()?;
        }

        // ── Stop ─────────────────────────────────────────────────────────────
        Commands::Stop { config } => {
            let cfg = CacheConfig::load(&config)?;
            let sentinel = stop_path(&cfg);
            std::fs::write(&sentinel, b"")?;
            println!("stop requested via {}", sentinel.display());
        }

        // ── Status ───────────────────────────────────────────────────────────
        Commands::Status { config } => {
            let cfg = CacheConfig::load(&config)?;
            let snap = writer::inspect(&cfg)?;
            println!("── pixels cache ─────────────────────────────────────────");
            println!("  Index file   {}", cfg.index_location.display());
            println!("  Cache file   {}", cfg.cache_location.display());
            println!("  Magic        {}", if snap.magic_ok { "ok" } else { "INVALID" });
            println!("  State        {}", if snap.writing { "writing" } else { "readable" });
            println!("  Readers      {}", snap.readers);
            println!("  Version      {}", snap.version);
        }
    }

    Ok(())
}
