use std::fs::File;
use std::path::{Path, PathBuf};
use clap::{Parser, ValueEnum};
use serde::de::DeserializeOwned;
use thiserror::Error;
use procgroup::{Rank, Tag};

mod sizes;
pub use sizes::{IterationCounts, MessageSizes, SizeSchedule};
mod options;
pub use options::{BcastOptions, LatencyMtOptions, LARGE_MESSAGE_SIZE, MAX_THREADS};
mod epoch;
pub use epoch::{Arrival, EpochCoordinator, Role};
mod timer;
pub use timer::IntervalTimer;
mod buffers;
pub use buffers::{reply_fill, request_fill, PingPongBuffers, RECV_FILL, SEND_FILL};
mod report;
pub use report::{CollectingReporter, LatencySample, Reporter, StdoutReporter};
mod latency;
pub use latency::{
    latency_mt,
    latency_mt_local,
    partition,
    timer_holder,
    validate_startup,
    TagScheme,
    RECEIVER_RANK,
    SENDER_RANK,
};
mod bcast;
pub use bcast::{bcast, bcast_local, print_bcast, BcastStats};

#[derive(Debug, Error)]
pub enum Error {
    /// The point-to-point test runs between exactly two processes
    #[error("this test requires exactly two processes, found {0}")]
    WorldSize(usize),

    /// Collective tests need a peer
    #[error("this test requires at least two processes, found {0}")]
    TooFewProcesses(usize),

    /// Several threads per process call into the group
    #[error("process group does not allow concurrent callers (MPI_THREAD_MULTIPLE required)")]
    ThreadLevel,

    /// Thread counts disagree, the epoch protocol would deadlock
    #[error("{role} thread count mismatch: expected {expected}, found {found}")]
    ThreadCountMismatch {
        role: Role,
        expected: usize,
        found: usize,
    },

    /// Processes were started with different options
    #[error("options on rank {0} differ from rank 0")]
    PeerMismatch(Rank),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// Per-iteration tags would exceed the largest usable tag
    #[error("per-iteration tags up to {needed} exceed the largest tag {max}")]
    TagOverflow { needed: usize, max: Tag },

    #[error("failed to allocate {bytes} bytes on rank {rank}, worker {worker}")]
    Allocation {
        rank: Rank,
        worker: usize,
        bytes: usize,
    },

    /// Another worker of this role failed and released the epoch early
    #[error("epoch synchronization aborted")]
    EpochAborted,

    #[error("reply for size {size} failed validation at iteration {iteration}")]
    Validation { size: usize, iteration: usize },

    #[error(transparent)]
    Threading(#[from] threading::Error),

    #[error(transparent)]
    Group(#[from] procgroup::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Startup errors every rank detects identically. Only one rank needs
    /// to report them.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::WorldSize(_)
                | Error::TooFewProcesses(_)
                | Error::ThreadLevel
                | Error::ThreadCountMismatch { .. }
                | Error::PeerMismatch(_)
                | Error::InvalidOptions(_)
                | Error::TagOverflow { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Load benchmark options from a YAML file.
pub fn load_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path)?;
    Ok(serde_yaml::from_reader(file)?)
}

/// Which threading backend runs the workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// One OS thread per worker
    Threads,
    /// Cooperative tasklets (TASKLET_WORKERS execution contexts)
    Tasklets,
}

/// Message size range given as `MAX`, `MIN:MAX` or `MIN:`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeRange {
    pub min: Option<usize>,
    pub max: Option<usize>,
}

fn parse_size_range(s: &str) -> std::result::Result<SizeRange, String> {
    let parse = |v: &str| {
        v.trim()
            .parse::<usize>()
            .map_err(|e| format!("invalid size {:?}: {}", v, e))
    };
    match s.split_once(':') {
        None => Ok(SizeRange {
            min: None,
            max: Some(parse(s)?),
        }),
        Some((min, max)) => Ok(SizeRange {
            min: Some(parse(min)?),
            max: if max.trim().is_empty() { None } else { Some(parse(max)?) },
        }),
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-threaded point-to-point latency test", long_about = None)]
pub struct LatencyMtArgs {
    /// YAML file with benchmark options (flags override it)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Message sizes in bytes: MAX, MIN:MAX or MIN:
    #[arg(short, long, value_parser = parse_size_range)]
    pub message_size: Option<SizeRange>,
    /// Measured iterations per size
    #[arg(short, long)]
    pub iterations: Option<usize>,
    /// Warm-up iterations per size
    #[arg(short = 'x', long)]
    pub skip: Option<usize>,
    /// Measured iterations above the large message size
    #[arg(long)]
    pub iterations_large: Option<usize>,
    /// Warm-up iterations above the large message size
    #[arg(long)]
    pub skip_large: Option<usize>,
    /// Sizes strictly above this use the large iteration counts
    #[arg(long)]
    pub large_message_size: Option<usize>,
    /// Sender threads on rank 0
    #[arg(short, long)]
    pub sender_threads: Option<usize>,
    /// Receiver threads on rank 1
    #[arg(short, long)]
    pub receiver_threads: Option<usize>,
    /// Check every reply against the peer's fill pattern
    #[arg(long)]
    pub validate: bool,
    /// Threading backend for the workers
    #[arg(short, long, value_enum, default_value_t = BackendKind::Threads)]
    pub backend: BackendKind,
    /// Run both ranks inside this process instead of under MPI
    #[arg(long)]
    pub local: bool,
}

impl LatencyMtArgs {
    /// Options from the config file (or defaults) with flags applied.
    pub fn options(&self) -> Result<LatencyMtOptions> {
        let mut opts: LatencyMtOptions = match &self.config {
            Some(path) => load_config(path)?,
            None => LatencyMtOptions::default(),
        };
        if let Some(range) = self.message_size {
            if let Some(min) = range.min {
                opts.min_size = min;
            }
            if let Some(max) = range.max {
                opts.max_size = max;
            }
        }
        opts.iterations = self.iterations.unwrap_or(opts.iterations);
        opts.skip = self.skip.unwrap_or(opts.skip);
        opts.iterations_large = self.iterations_large.unwrap_or(opts.iterations_large);
        opts.skip_large = self.skip_large.unwrap_or(opts.skip_large);
        opts.large_message_size = self.large_message_size.unwrap_or(opts.large_message_size);
        opts.sender_threads = self.sender_threads.unwrap_or(opts.sender_threads);
        opts.receiver_threads = self.receiver_threads.unwrap_or(opts.receiver_threads);
        opts.validate |= self.validate;
        Ok(opts)
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Broadcast latency test", long_about = None)]
pub struct BcastArgs {
    /// YAML file with benchmark options (flags override it)
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Message sizes in bytes: MAX, MIN:MAX or MIN:
    #[arg(short, long, value_parser = parse_size_range)]
    pub message_size: Option<SizeRange>,
    /// Measured iterations per size
    #[arg(short, long)]
    pub iterations: Option<usize>,
    /// Warm-up iterations per size
    #[arg(short = 'x', long)]
    pub skip: Option<usize>,
    /// Upper bound for the broadcast buffer in bytes
    #[arg(short = 'M', long)]
    pub max_mem_limit: Option<usize>,
    /// Also print min, max and iteration columns
    #[arg(short, long)]
    pub full: bool,
    /// Run all ranks inside this process instead of under MPI
    #[arg(long)]
    pub local: bool,
    /// Number of ranks for a local run
    #[arg(short = 'n', long, default_value_t = 2)]
    pub ranks: usize,
}

impl BcastArgs {
    pub fn options(&self) -> Result<BcastOptions> {
        let mut opts: BcastOptions = match &self.config {
            Some(path) => load_config(path)?,
            None => BcastOptions::default(),
        };
        if let Some(range) = self.message_size {
            if let Some(min) = range.min {
                opts.min_size = min;
            }
            if let Some(max) = range.max {
                opts.max_size = max;
            }
        }
        opts.iterations = self.iterations.unwrap_or(opts.iterations);
        opts.skip = self.skip.unwrap_or(opts.skip);
        opts.max_mem_limit = self.max_mem_limit.unwrap_or(opts.max_mem_limit);
        opts.full |= self.full;
        Ok(opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_size_range() {
        assert_eq!(
            parse_size_range("64").unwrap(),
            SizeRange { min: None, max: Some(64) }
        );
        assert_eq!(
            parse_size_range("4:1024").unwrap(),
            SizeRange { min: Some(4), max: Some(1024) }
        );
        assert_eq!(
            parse_size_range("8:").unwrap(),
            SizeRange { min: Some(8), max: None }
        );
        assert!(parse_size_range("a:b").is_err());
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = LatencyMtArgs::try_parse_from([
            "latency_mt", "-m", "2:64", "-i", "20", "-x", "5", "-s", "4", "-r", "3", "-b", "tasklets",
        ])
        .unwrap();
        let opts = args.options().unwrap();
        assert_eq!(opts.min_size, 2);
        assert_eq!(opts.max_size, 64);
        assert_eq!(opts.iterations, 20);
        assert_eq!(opts.skip, 5);
        assert_eq!(opts.sender_threads, 4);
        assert_eq!(opts.receiver_threads, 3);
        assert_eq!(args.backend, BackendKind::Tasklets);
        assert_eq!(opts.iterations_large, LatencyMtOptions::default().iterations_large);
    }

    #[test]
    fn test_config_file_then_flags() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "iterations: 50\nskip: 2\nsender_threads: 2\nmax_size: 256").unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let args =
            LatencyMtArgs::try_parse_from(["latency_mt", "--config", &path, "-x", "7"]).unwrap();
        let opts = args.options().unwrap();
        assert_eq!(opts.iterations, 50);
        assert_eq!(opts.skip, 7);
        assert_eq!(opts.sender_threads, 2);
        assert_eq!(opts.max_size, 256);
        assert_eq!(opts.receiver_threads, LatencyMtOptions::default().receiver_threads);
    }

    #[test]
    fn test_missing_config_file() {
        let args =
            BcastArgs::try_parse_from(["bcast", "-c", "/nonexistent/bcast.yaml"]).unwrap();
        assert!(matches!(args.options(), Err(Error::Io(_))));
    }

    #[test]
    fn test_configuration_errors() {
        assert!(Error::WorldSize(3).is_configuration());
        assert!(Error::ThreadLevel.is_configuration());
        assert!(Error::PeerMismatch(1).is_configuration());
        assert!(Error::TagOverflow { needed: 40000, max: 32767 }.is_configuration());
        assert!(!Error::EpochAborted.is_configuration());
        assert!(!Error::Validation { size: 1, iteration: 0 }.is_configuration());
        assert!(!Error::Allocation { rank: 1, worker: 0, bytes: 8 }.is_configuration());
    }

    #[test]
    fn test_bcast_args() {
        let args = BcastArgs::try_parse_from(["bcast", "-m", "16", "-f", "--local", "-n", "4"]).unwrap();
        let opts = args.options().unwrap();
        assert_eq!(opts.max_size, 16);
        assert!(opts.full);
        assert!(args.local);
        assert_eq!(args.ranks, 4);
    }
}
