//! zblock command-line tool
//!
//! Drives an in-process compressed block device:
//! - Benchmark parallel page writes and report compression statistics
//! - Load a file through the device and verify it reads back intact
//! - Print the effective configuration
//!
//! # Examples
//!
//! ```bash
//! # Write 64 MiB of mixed pages with zstd, then dump stats
//! zblock bench --disksize 64M --pattern mixed
//!
//! # Same with lz4 and Prometheus output
//! zblock --compression lz4 bench --disksize 64M --prometheus
//!
//! # Push a file through the device
//! zblock load --input /var/log/syslog
//!
//! # Show the configuration that would be used
//! zblock --config zblock.toml config
//! ```

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use rayon::prelude::*;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use zblock::storage::CompressionAlgorithm;
use zblock::{Device, DeviceConfig, StatsSnapshot, PAGE_SIZE, SECTOR_SIZE};

/// zblock - compressed in-memory block device
#[derive(Parser, Debug)]
#[command(name = "zblock")]
#[command(version = zblock::VERSION)]
#[command(about = "Compressed in-memory block device", long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "ZBLOCK_CONFIG")]
    config: Option<PathBuf>,

    /// Compression algorithm (overrides the config file)
    #[arg(long, global = true, value_enum)]
    compression: Option<Algorithm>,

    /// Compression level (overrides the config file)
    #[arg(long, global = true)]
    level: Option<i32>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "ZBLOCK_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write pages in parallel and report statistics
    Bench(BenchArgs),

    /// Write a file through the device and read it back
    Load(LoadArgs),

    /// Print the effective configuration as TOML
    Config,

    /// Show version information
    Version,
}

#[derive(Args, Debug)]
struct BenchArgs {
    /// Device size (accepts K, M, G suffixes)
    #[arg(short, long, default_value = "64M", value_parser = parse_size)]
    disksize: u64,

    /// Page content to write
    #[arg(short, long, value_enum, default_value = "mixed")]
    pattern: Pattern,

    /// Fraction of pages to discard after writing
    #[arg(long, default_value = "0.5")]
    discard_ratio: f64,

    /// Render metrics in Prometheus text format at the end
    #[arg(long)]
    prometheus: bool,
}

#[derive(Args, Debug)]
struct LoadArgs {
    /// File to load
    #[arg(short, long)]
    input: PathBuf,

    /// Device size (defaults to the file size rounded up to a page)
    #[arg(short, long, value_parser = parse_size)]
    disksize: Option<u64>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Algorithm {
    Zstd,
    Lz4,
}

impl From<Algorithm> for CompressionAlgorithm {
    fn from(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::Zstd => CompressionAlgorithm::Zstd,
            Algorithm::Lz4 => CompressionAlgorithm::Lz4,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Pattern {
    /// All-zero pages
    Zero,
    /// Repetitive text
    Text,
    /// Incompressible noise
    Random,
    /// A mix of the three
    Mixed,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli)?;

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Bench(args) => bench_command(config, args),
        Commands::Load(args) => load_command(config, args),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Version => {
            println!("zblock {}", zblock::VERSION);
            Ok(())
        }
    }
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "zblock.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color)
                .pretty(),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

/// Config file (if any) with command-line overrides applied
fn load_config(cli: &Cli) -> anyhow::Result<DeviceConfig> {
    let mut config = match &cli.config {
        Some(path) => DeviceConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => DeviceConfig::default(),
    };
    if let Some(algorithm) = cli.compression {
        config.compression = algorithm.into();
    }
    if let Some(level) = cli.level {
        config.compression_level = level;
    }
    config.validate()?;
    Ok(config)
}

/// Parse a byte count with an optional K/M/G suffix
fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, shift) = match s.char_indices().last() {
        Some((i, 'k' | 'K')) => (&s[..i], 10),
        Some((i, 'm' | 'M')) => (&s[..i], 20),
        Some((i, 'g' | 'G')) => (&s[..i], 30),
        _ => (s, 0),
    };
    let value: u64 = digits
        .parse()
        .map_err(|e| format!("invalid size '{}': {}", s, e))?;
    value
        .checked_mul(1 << shift)
        .ok_or_else(|| format!("size '{}' is too large", s))
}

/// Deterministic page content for `index`
fn make_page(pattern: Pattern, index: u64) -> Vec<u8> {
    let pattern = match pattern {
        Pattern::Mixed => match index % 4 {
            0 => Pattern::Zero,
            1 => Pattern::Random,
            _ => Pattern::Text,
        },
        other => other,
    };
    match pattern {
        Pattern::Zero | Pattern::Mixed => vec![0u8; PAGE_SIZE],
        Pattern::Text => format!("page {:>10} of the zblock benchmark. ", index)
            .into_bytes()
            .into_iter()
            .cycle()
            .take(PAGE_SIZE)
            .collect(),
        Pattern::Random => {
            let mut x = index.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
            (0..PAGE_SIZE)
                .map(|_| {
                    x ^= x << 13;
                    x ^= x >> 7;
                    x ^= x << 17;
                    (x >> 24) as u8
                })
                .collect()
        }
    }
}

/// Bench command - parallel writes, verification, discard
fn bench_command(config: DeviceConfig, args: BenchArgs) -> anyhow::Result<()> {
    if !(0.0..=1.0).contains(&args.discard_ratio) {
        bail!("discard ratio must be between 0 and 1");
    }
    let recorder = if args.prometheus {
        Some(PrometheusBuilder::new().install_recorder()?)
    } else {
        None
    };

    let device = Device::new(config)?;
    device.init(args.disksize)?;
    let pages = device.num_pages();
    info!(pages, pattern = ?args.pattern, "Starting benchmark");

    let start = Instant::now();
    (0..pages)
        .into_par_iter()
        .try_for_each(|i| device.write_page(i, &make_page(args.pattern, i)))?;
    let write_elapsed = start.elapsed();

    let start = Instant::now();
    let mismatches: u64 = (0..pages)
        .into_par_iter()
        .map(|i| -> zblock::error::Result<u64> {
            let mut out = vec![0u8; PAGE_SIZE];
            device.read_page(i, &mut out)?;
            Ok(u64::from(out != make_page(args.pattern, i)))
        })
        .try_reduce(|| 0, |a, b| Ok(a + b))?;
    let read_elapsed = start.elapsed();
    if mismatches > 0 {
        warn!(mismatches, "Pages read back with unexpected content");
    }

    let written = device.stats();

    let discard_pages = (pages as f64 * args.discard_ratio) as u64;
    if discard_pages > 0 {
        device.discard(0, discard_pages * PAGE_SIZE as u64)?;
    }
    let freed = device.flush_pending_frees()?;
    info!(discarded = discard_pages, freed, "Discarded pages");

    let mb = (pages * PAGE_SIZE as u64) as f64 / (1024.0 * 1024.0);
    println!("Pages:        {}", pages);
    println!(
        "Write:        {:.1} MiB/s",
        mb / write_elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!(
        "Read:         {:.1} MiB/s",
        mb / read_elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!("Mismatches:   {}", mismatches);
    println!("Ratio:        {:.2}", written.compression_ratio());
    print_stats(&device.stats())?;

    if let Some(handle) = recorder {
        device.publish_metrics();
        println!("{}", handle.render());
    }

    device.reset()?;
    if mismatches > 0 {
        bail!("{} pages failed verification", mismatches);
    }
    Ok(())
}

/// Load command - write a file through the device and verify it
fn load_command(config: DeviceConfig, args: LoadArgs) -> anyhow::Result<()> {
    let data = std::fs::read(&args.input)
        .with_context(|| format!("reading {}", args.input.display()))?;
    if data.is_empty() {
        bail!("{} is empty", args.input.display());
    }

    // Pad to whole sectors so the range is addressable
    let padded_len = data.len().div_ceil(SECTOR_SIZE) * SECTOR_SIZE;
    let mut padded = data;
    padded.resize(padded_len, 0);

    let disksize = args
        .disksize
        .unwrap_or_else(|| (padded_len as u64).div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64);

    let device = Device::new(config)?;
    device.init(disksize)?;
    info!(file = %args.input.display(), bytes = padded_len, "Loading file");

    device.write_at(0, &padded)?;
    let mut readback = vec![0u8; padded_len];
    device.read_at(0, &mut readback)?;

    let stats = device.stats();
    print_stats(&stats)?;
    println!("Ratio: {:.2}", stats.compression_ratio());

    device.reset()?;
    if readback != padded {
        bail!("read back data differs from {}", args.input.display());
    }
    println!("Verified {} bytes", padded_len);
    Ok(())
}

fn print_stats(stats: &StatsSnapshot) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(stats)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("4K"), Ok(4096));
        assert_eq!(parse_size("64M"), Ok(64 << 20));
        assert_eq!(parse_size("2g"), Ok(2 << 30));
        assert!(parse_size("lots").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn test_make_page_patterns() {
        assert!(make_page(Pattern::Zero, 3).iter().all(|&b| b == 0));
        assert_eq!(make_page(Pattern::Text, 1).len(), PAGE_SIZE);
        assert_ne!(make_page(Pattern::Random, 1), make_page(Pattern::Random, 2));
        assert!(make_page(Pattern::Mixed, 0).iter().all(|&b| b == 0));
    }
}
