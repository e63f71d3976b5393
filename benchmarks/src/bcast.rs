//! Broadcast latency across all ranks of a group.
//!
//! Every round times one broadcast from rank 0 and then synchronizes with a
//! barrier, so the next broadcast starts from a common point. Each rank
//! averages its own measured rounds; rank 0 collects min, max and mean.
use std::io;
use std::time::Instant;
use log::{info, warn};
use procgroup::{LocalWorld, ProcessGroup, ReduceOp};
use threading::OsThreads;
use crate::options::BcastOptions;
use crate::report::write_bcast;
use crate::{Error, Result};

const ROOT: procgroup::Rank = 0;

/// Broadcast latency of one message size, as seen across the ranks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BcastStats {
    pub size: usize,
    pub avg_us: f64,
    pub min_us: f64,
    pub max_us: f64,
    pub iterations: usize,
}

fn allocate(rank: procgroup::Rank, bytes: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(bytes)
        .map_err(|_| Error::Allocation { rank, worker: 0, bytes })?;
    buf.resize(bytes, 1);
    Ok(buf)
}

/// Run the broadcast test on this rank. Rank 0 gets one entry per message
/// size back, the other ranks an empty list.
pub fn bcast<G>(group: &G, options: &BcastOptions) -> Result<Vec<BcastStats>>
where
    G: ProcessGroup + ?Sized,
{
    let ranks = group.size();
    if ranks < 2 {
        return Err(Error::TooFewProcesses(ranks));
    }
    options.validate()?;

    let mut options = options.clone();
    let requested = options.max_size;
    if options.clamp_to_memory_limit() && group.rank() == ROOT {
        warn!(
            "max message size {} exceeds the memory limit, continuing with {} bytes",
            requested, options.max_size
        );
    }
    let schedule = options.schedule();
    let mut buffer = allocate(group.rank(), options.max_size.max(1))?;
    if group.rank() == ROOT {
        info!("broadcast test over {} ranks", ranks);
    }

    let mut stats = Vec::new();
    for (size, counts) in schedule.epochs() {
        let mut elapsed = 0.0;
        for round in 0..counts.total() {
            let start = Instant::now();
            group.broadcast(&mut buffer[..size], ROOT)?;
            let time = start.elapsed().as_secs_f64();
            if round >= counts.skip {
                elapsed += time;
            }
            group.barrier()?;
        }
        group.barrier()?;

        let latency = elapsed * 1.0e6 / counts.iterations as f64;
        let min = group.reduce(latency, ReduceOp::Min, ROOT)?;
        let max = group.reduce(latency, ReduceOp::Max, ROOT)?;
        let sum = group.reduce(latency, ReduceOp::Sum, ROOT)?;
        if let (Some(min_us), Some(max_us), Some(sum)) = (min, max, sum) {
            stats.push(BcastStats {
                size,
                avg_us: sum / ranks as f64,
                min_us,
                max_us,
                iterations: counts.iterations,
            });
        }
    }
    Ok(stats)
}

/// Run the broadcast test with `ranks` in-process ranks. Returns rank 0's
/// results.
pub fn bcast_local(options: &BcastOptions, ranks: usize) -> Result<Vec<BcastStats>> {
    if ranks < 2 {
        return Err(Error::TooFewProcesses(ranks));
    }
    let world = LocalWorld::<OsThreads>::new(ranks);
    let results: Vec<Result<Vec<BcastStats>>> = std::thread::scope(|s| {
        let handles: Vec<_> = world
            .groups()
            .into_iter()
            .map(|group| {
                let world = world.clone();
                s.spawn(move || {
                    let result = bcast(&group, options);
                    if result.is_err() {
                        world.shutdown();
                    }
                    result
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join().unwrap_or_else(|_| {
                    world.shutdown();
                    Err(threading::Error::Panicked("rank thread".into()).into())
                })
            })
            .collect()
    });

    let mut root = Vec::new();
    for (rank, result) in results.into_iter().enumerate() {
        let stats = result?;
        if rank == ROOT as usize {
            root = stats;
        }
    }
    Ok(root)
}

/// Print results to stdout with the header.
pub fn print_bcast(stats: &[BcastStats], full: bool) -> Result<()> {
    let mut out = io::stdout().lock();
    write_bcast(&mut out, stats, full)?;
    Ok(())
}
