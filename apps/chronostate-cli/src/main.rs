use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chronostate_common::Value;
use chronostate_kernel::{Engine, EngineConfig};
use chronostate_patch::{DiffOptions, diff_with};
use chronostate_persist::{Algorithm, FsDriver, MemoryDriver, Persister, StorageDriver, chunk_prefix};
use chronostate_timeline::ReconstructOptions;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chronostate-cli", about = "CLI tool for chronostate stores")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// YAML engine config; defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print crate versions and the effective config
    Info,
    /// Print the patch turning one JSON document into another
    Diff {
        old: PathBuf,
        new: PathBuf,
        /// Describe equal-length blob changes as byte-range overwrites
        #[arg(long)]
        binary_ranges: bool,
    },
    /// Persist a JSON document into a file store
    Persist {
        #[arg(long)]
        root: PathBuf,
        #[arg(long)]
        key: String,
        value: PathBuf,
        /// none, zstd or lz4
        #[arg(long)]
        algorithm: Option<Algorithm>,
        /// Serialized size above which the value is chunked
        #[arg(long)]
        threshold: Option<usize>,
        #[arg(long)]
        chunk_size: Option<usize>,
    },
    /// Log synthetic writes and reconstruct state at a sequence number
    Replay {
        /// Number of events to log
        #[arg(short, long, default_value = "250")]
        events: u64,
        /// Snapshot every this many events
        #[arg(short, long)]
        interval: Option<u64>,
        /// Sequence number to reconstruct; defaults to the latest
        #[arg(short, long)]
        target: Option<u64>,
    },
    /// List keys held by a file store
    Inspect {
        #[arg(long)]
        root: PathBuf,
        #[arg(long, default_value = "")]
        prefix: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    let config = match &cli.config {
        Some(path) => EngineConfig::from_yaml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Info => {
            println!("chronostate-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("common: {}", chronostate_common::crate_info());
            println!("patch: {}", chronostate_patch::crate_info());
            println!("persist: {}", chronostate_persist::crate_info());
            println!("timeline: {}", chronostate_timeline::crate_info());
            println!("sync: {}", chronostate_sync::crate_info());
            println!("kernel: {}", chronostate_kernel::crate_info());
            let codecs = chronostate_persist::CompressionRegistry::default();
            let names: Vec<&str> = codecs.available().into_iter().map(|a| a.name()).collect();
            println!("codecs: {}", names.join(", "));
            print!("{}", config.to_yaml()?);
        }
        Commands::Diff {
            old,
            new,
            binary_ranges,
        } => {
            let old = read_value(&old)?;
            let new = read_value(&new)?;
            let ops = diff_with(&old, &new, DiffOptions { binary_ranges });
            println!("{}", serde_json::to_string_pretty(&ops)?);
        }
        Commands::Persist {
            root,
            key,
            value,
            algorithm,
            threshold,
            chunk_size,
        } => {
            let mut persist = config.persist;
            if let Some(algorithm) = algorithm {
                persist.compression = algorithm;
            }
            if let Some(threshold) = threshold {
                persist.chunk_threshold = threshold;
            }
            if let Some(chunk_size) = chunk_size {
                anyhow::ensure!(chunk_size > 0, "--chunk-size must be greater than zero");
                persist.chunk_size = chunk_size;
            }
            let value = read_value(&value)?;
            let driver = Arc::new(FsDriver::open(&root).await?);
            let persister = Persister::new(Arc::clone(&driver), persist);
            let report = persister.persist(&key, &value).await?;
            println!(
                "persisted {key}: {} bytes, algorithm={}, layout={:?}",
                report.stored_bytes,
                report.algorithm,
                persister.layout(&key).await?
            );
            for stored in stored_entries(driver.as_ref(), &key).await? {
                println!("  {stored}");
            }
        }
        Commands::Replay {
            events,
            interval,
            target,
        } => {
            let mut config = config;
            if let Some(interval) = interval {
                config.event_log.snapshot_interval = interval;
            }
            config.validate()?;
            let mut engine = Engine::new(Arc::new(MemoryDriver::new()), config);
            for i in 1..=events {
                let key = format!("k{}", i % 3);
                engine.set(&key, Value::Int(i as i64)).await?;
            }
            engine.flush().await;

            let log = engine.events();
            println!(
                "logged {} events, retained {}, snapshots at {:?}",
                log.latest_seq(),
                log.retained(),
                log.snapshots().iter().map(|s| s.seq).collect::<Vec<_>>()
            );
            let options = match target {
                Some(seq) => ReconstructOptions::at(seq),
                None => ReconstructOptions::default(),
            };
            let r = engine.reconstruct(&options.with_state())?;
            println!(
                "reconstructed seq {} from snapshot {:?}, replayed {}",
                r.seq, r.base_snapshot, r.replayed
            );
            for (key, value) in r.state.unwrap_or_default() {
                println!("  {key} = {}", value.to_json());
            }
        }
        Commands::Inspect { root, prefix } => {
            let driver = FsDriver::open(&root).await?;
            let keys = driver.keys(&prefix).await?;
            for key in &keys {
                let size = driver.get(key).await?.map_or(0, |data| data.len());
                println!("{key}\t{size}");
            }
            tracing::info!(count = keys.len(), root = %root.display(), "inspected");
        }
    }

    Ok(())
}

fn read_value(path: &Path) -> anyhow::Result<Value> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let json: serde_json::Value =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Value::from(json))
}

/// Driver entries backing `key`: the single entry and its chunks, nothing
/// that merely shares the prefix.
async fn stored_entries<D: StorageDriver>(driver: &D, key: &str) -> anyhow::Result<Vec<String>> {
    let mut entries = Vec::new();
    if driver.has(key).await? {
        entries.push(key.to_owned());
    }
    entries.extend(driver.keys(&chunk_prefix(key)).await?);
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronostate_persist::PersistConfig;

    #[tokio::test]
    async fn stored_entries_skip_neighbouring_keys() {
        let driver = Arc::new(MemoryDriver::new());
        let config = PersistConfig {
            chunk_threshold: 64,
            chunk_size: 64,
            compression: Algorithm::None,
        };
        let persister = Persister::new(Arc::clone(&driver), config);
        persister.persist("a", &Value::Int(1)).await.unwrap();
        persister.persist("ab", &Value::Int(2)).await.unwrap();
        persister.persist("big", &Value::Bytes(vec![7; 150])).await.unwrap();
        persister.persist("bigger", &Value::Int(3)).await.unwrap();

        assert_eq!(stored_entries(driver.as_ref(), "a").await.unwrap(), vec!["a"]);
        let big = stored_entries(driver.as_ref(), "big").await.unwrap();
        assert_eq!(big.len(), 4);
        assert!(big.iter().all(|k| k.starts_with("big:chunk:")));
    }
}
