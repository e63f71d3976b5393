//! Multi-threaded point-to-point latency benchmark.
//!
//! Rank 0 runs `sender_threads` workers and rank 1 runs `receiver_threads`
//! workers. For every message size the workers of each role meet in their
//! [`EpochCoordinator`], which issues one process group barrier per process,
//! and then split the `iterations + skip` ping-pong rounds between them by
//! `round % threads`. The sender worker owning round `skip` is the timer
//! holder: it starts the clock before that round, waits with the other
//! senders on a local rendezvous barrier once all rounds are done, then
//! reports the latency for the size.
//!
//! Based on the OSU microbenchmarks multi-threaded latency test.
use std::iter::StepBy;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use log::{debug, info};
use procgroup::{LocalWorld, ProcessGroup, Rank, Tag};
use threading::Backend;
use crate::buffers::{reply_fill, request_fill, PingPongBuffers};
use crate::epoch::{EpochCoordinator, Role};
use crate::options::LatencyMtOptions;
use crate::report::{LatencySample, Reporter};
use crate::sizes::SizeSchedule;
use crate::timer::IntervalTimer;
use crate::{Error, Result};

pub const SENDER_RANK: Rank = 0;
pub const RECEIVER_RANK: Rank = 1;

const REQUEST_TAG: Tag = 1;
const REPLY_TAG: Tag = 2;

/// How ping-pong rounds are tagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagScheme {
    /// Requests carry tag 1 and replies tag 2. Only sound when both roles
    /// run a single worker, so rounds cannot overtake each other.
    Fixed,
    /// Request and reply of round `i` both carry tag `i`.
    PerIteration,
}

impl TagScheme {
    pub fn new(sender_threads: usize, receiver_threads: usize) -> TagScheme {
        if sender_threads > 1 || receiver_threads > 1 {
            TagScheme::PerIteration
        } else {
            TagScheme::Fixed
        }
    }

    pub fn request(self, round: usize) -> Tag {
        match self {
            TagScheme::Fixed => REQUEST_TAG,
            TagScheme::PerIteration => round as Tag,
        }
    }

    pub fn reply(self, round: usize) -> Tag {
        match self {
            TagScheme::Fixed => REPLY_TAG,
            TagScheme::PerIteration => round as Tag,
        }
    }
}

/// Rounds owned by `worker` out of `total`.
pub fn partition(worker: usize, threads: usize, total: usize) -> StepBy<Range<usize>> {
    (worker..total).step_by(threads.max(1))
}

/// Worker whose partition contains the first measured round.
pub fn timer_holder(threads: usize, skip: usize) -> usize {
    skip % threads.max(1)
}

/// One-way latency in microseconds. Each sender only ran
/// `iterations / threads` of the measured round trips.
fn latency_us(elapsed: Duration, iterations: usize, threads: usize) -> f64 {
    elapsed.as_secs_f64() * 1.0e6 / (2.0 * iterations as f64 / threads as f64)
}

/// Everything the workers of one role share.
struct Context<B: Backend, G: ProcessGroup + ?Sized> {
    group: Arc<G>,
    options: LatencyMtOptions,
    schedule: SizeSchedule,
    tags: TagScheme,
    coordinator: EpochCoordinator<B>,
    timer: IntervalTimer,
    reporter: Arc<dyn Reporter>,
}

impl<B: Backend, G: ProcessGroup + ?Sized> Context<B, G> {
    fn allocate(&self, worker: usize) -> Result<PingPongBuffers> {
        let capacity = self.options.max_size.max(1);
        PingPongBuffers::allocate(capacity).map_err(|_| Error::Allocation {
            rank: self.group.rank(),
            worker,
            bytes: capacity.saturating_mul(2),
        })
    }
}

/// Aborts the coordinator unless disarmed, so a worker that errors out or
/// panics never leaves its siblings waiting for an arrival.
struct AbortGuard<'a, B: Backend> {
    coordinator: &'a EpochCoordinator<B>,
    armed: bool,
}

impl<B: Backend> Drop for AbortGuard<'_, B> {
    fn drop(&mut self) {
        if self.armed {
            self.coordinator.abort();
        }
    }
}

fn sender<B: Backend, G: ProcessGroup + ?Sized>(ctx: &Context<B, G>, worker: usize) -> Result<()> {
    let mut buffers = ctx.allocate(worker)?;
    for (size, counts) in ctx.schedule.epochs() {
        ctx.coordinator.arrive_and_wait(&*ctx.group, ctx.coordinator.threads())?;
        buffers.touch(size);

        let mut holder = false;
        let mut mismatch = None;
        for round in partition(worker, ctx.coordinator.threads(), counts.total()) {
            if round == counts.skip {
                ctx.timer.start();
                holder = true;
                debug!("sender {} holds the timer for size {}", worker, size);
            }
            if ctx.options.validate {
                buffers.fill_send(size, request_fill(round));
                buffers.reset_recv(size);
            }
            ctx.group
                .send(buffers.send_buf(size), RECEIVER_RANK, ctx.tags.request(round))?;
            ctx.group
                .receive(buffers.recv_buf(size), RECEIVER_RANK, ctx.tags.reply(round))?;
            if ctx.options.validate
                && mismatch.is_none()
                && !buffers.recv_matches(size, reply_fill(round))
            {
                mismatch = Some(round);
            }
        }

        ctx.coordinator.rendezvous()?;
        if holder {
            ctx.timer.stop();
            ctx.reporter.report(LatencySample {
                size,
                latency_us: latency_us(ctx.timer.elapsed(), counts.iterations, ctx.coordinator.threads()),
                worker,
            });
        }
        if let Some(iteration) = mismatch {
            return Err(Error::Validation { size, iteration });
        }
    }
    Ok(())
}

fn receiver<B: Backend, G: ProcessGroup + ?Sized>(ctx: &Context<B, G>, worker: usize) -> Result<()> {
    let mut buffers = ctx.allocate(worker)?;
    for (size, counts) in ctx.schedule.epochs() {
        ctx.coordinator.arrive_and_wait(&*ctx.group, ctx.coordinator.threads())?;
        buffers.touch(size);
        let mut mismatch = None;
        for round in partition(worker, ctx.coordinator.threads(), counts.total()) {
            if ctx.options.validate {
                buffers.reset_recv(size);
            }
            ctx.group
                .receive(buffers.recv_buf(size), SENDER_RANK, ctx.tags.request(round))?;
            if ctx.options.validate {
                if mismatch.is_none() && !buffers.recv_matches(size, request_fill(round)) {
                    mismatch = Some(round);
                }
                buffers.fill_send(size, reply_fill(round));
            }
            ctx.group
                .send(buffers.send_buf(size), SENDER_RANK, ctx.tags.reply(round))?;
        }
        if let Some(iteration) = mismatch {
            return Err(Error::Validation { size, iteration });
        }
    }
    Ok(())
}

fn run_worker<B: Backend, G: ProcessGroup + ?Sized>(ctx: &Context<B, G>, worker: usize) -> Result<()> {
    let mut guard = AbortGuard {
        coordinator: &ctx.coordinator,
        armed: true,
    };
    let result = match ctx.coordinator.role() {
        Role::Sender => sender(ctx, worker),
        Role::Receiver => receiver(ctx, worker),
    };
    guard.armed = result.is_err();
    result
}

/// Checks run before any worker starts. Every rank must call this: the
/// last step exchanges options with the peer.
pub fn validate_startup<G>(group: &G, options: &LatencyMtOptions) -> Result<()>
where
    G: ProcessGroup + ?Sized,
{
    if group.size() != 2 {
        return Err(Error::WorldSize(group.size()));
    }
    if !group.concurrent_callers() {
        return Err(Error::ThreadLevel);
    }
    options.validate()?;
    if TagScheme::new(options.sender_threads, options.receiver_threads) == TagScheme::PerIteration {
        let needed = options.schedule().max_total().saturating_sub(1);
        if needed > group.max_tag() as usize {
            return Err(Error::TagOverflow {
                needed,
                max: group.max_tag(),
            });
        }
    }
    check_peer_agreement(group, options)
}

/// Every rank broadcasts its options in turn and compares them with the
/// others, so all ranks reach the same verdict.
fn check_peer_agreement<G>(group: &G, options: &LatencyMtOptions) -> Result<()>
where
    G: ProcessGroup + ?Sized,
{
    let local = options.fingerprint();
    let mut fingerprints = Vec::with_capacity(group.size());
    for root in 0..group.size() as Rank {
        let mut bytes: Vec<u8> = if root == group.rank() {
            local.iter().flat_map(|v| v.to_le_bytes()).collect()
        } else {
            vec![0; local.len() * 8]
        };
        group.broadcast(&mut bytes, root)?;
        let mut fingerprint = [0u64; 10];
        for (value, chunk) in fingerprint.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            *value = u64::from_le_bytes(word);
        }
        fingerprints.push(fingerprint);
    }

    let reference = fingerprints[0];
    for (rank, other) in fingerprints.iter().enumerate().skip(1) {
        for (index, role) in [(0, Role::Sender), (1, Role::Receiver)] {
            if other[index] != reference[index] {
                return Err(Error::ThreadCountMismatch {
                    role,
                    expected: reference[index] as usize,
                    found: other[index] as usize,
                });
            }
        }
        if *other != reference {
            return Err(Error::PeerMismatch(rank as Rank));
        }
    }
    Ok(())
}

/// Spawn this rank's workers on backend `B` and wait for all of them.
fn run_role<B, G>(group: Arc<G>, options: &LatencyMtOptions, reporter: Arc<dyn Reporter>) -> Result<()>
where
    B: Backend,
    G: ProcessGroup + ?Sized + 'static,
{
    B::init_thread()?;
    let role = if group.rank() == SENDER_RANK {
        Role::Sender
    } else {
        Role::Receiver
    };
    let threads = options.threads(role);
    let schedule = options.schedule();
    info!(
        "rank {} running {} {} workers on {}",
        group.rank(),
        threads,
        role,
        B::NAME
    );
    if role == Role::Sender {
        if let Some((size, counts)) = schedule.epochs().next() {
            debug!(
                "first epoch: size {}, timer holder is worker {}",
                size,
                timer_holder(threads, counts.skip)
            );
        }
    }

    let ctx = Arc::new(Context::<B, G> {
        group,
        options: options.clone(),
        schedule,
        tags: TagScheme::new(options.sender_threads, options.receiver_threads),
        coordinator: EpochCoordinator::new(role, threads),
        timer: IntervalTimer::new(),
        reporter,
    });

    let mut handles = Vec::with_capacity(threads);
    let mut first_error = None;
    for id in 0..threads {
        let shared = ctx.clone();
        match B::spawn(format!("{}-{}", role, id), move || run_worker(&shared, id)) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                ctx.coordinator.abort();
                first_error = Some(Error::from(e));
                break;
            }
        }
    }

    for handle in handles {
        let outcome = B::join(handle).map_err(Error::from).and_then(|r| r);
        if let Err(e) = outcome {
            first_error = Some(root_cause(first_error, e));
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Errors that only say some other worker or rank failed first.
fn is_secondary(e: &Error) -> bool {
    matches!(e, Error::EpochAborted | Error::Group(procgroup::Error::Aborted))
}

/// Keep the first error unless it only reports a failure elsewhere.
fn root_cause(current: Option<Error>, next: Error) -> Error {
    match current {
        Some(e) if !is_secondary(&e) || is_secondary(&next) => e,
        _ => next,
    }
}

/// Run the benchmark on this rank: validate, print the header on the
/// sender, then drive the workers through every message size.
pub fn latency_mt<B, G>(group: Arc<G>, options: &LatencyMtOptions, reporter: Arc<dyn Reporter>) -> Result<()>
where
    B: Backend,
    G: ProcessGroup + ?Sized + 'static,
{
    validate_startup(&*group, options)?;
    if group.rank() == SENDER_RANK {
        reporter.begin(options.sender_threads, options.receiver_threads);
    }
    run_role::<B, G>(group, options, reporter)
}

/// Run both ranks inside this process, each on its own OS thread, over a
/// [`LocalWorld`]. A rank that fails shuts the world down so its peer
/// does not wait forever.
pub fn latency_mt_local<B: Backend>(options: &LatencyMtOptions, reporter: Arc<dyn Reporter>) -> Result<()> {
    let world = LocalWorld::<B>::new(2);
    let results: Vec<Result<()>> = std::thread::scope(|s| {
        let handles: Vec<_> = world
            .groups()
            .into_iter()
            .map(|group| {
                let reporter = reporter.clone();
                let world = world.clone();
                s.spawn(move || {
                    let result = latency_mt::<B, _>(Arc::new(group), options, reporter);
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
    let mut first_error = None;
    for result in results {
        if let Err(e) = result {
            first_error = Some(root_cause(first_error, e));
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_partition_is_bijection() {
        for threads in 1..=5 {
            for total in [0, 1, 4, 7, 110] {
                let mut seen = BTreeSet::new();
                let mut count = 0;
                for worker in 0..threads {
                    for round in partition(worker, threads, total) {
                        assert_eq!(round % threads, worker);
                        seen.insert(round);
                        count += 1;
                    }
                }
                assert_eq!(count, total);
                assert_eq!(seen, (0..total).collect());
            }
        }
    }

    #[test]
    fn test_partition_two_workers() {
        assert_eq!(partition(0, 2, 4).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(partition(1, 2, 4).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_timer_holder_owns_first_measured_round() {
        for threads in 1..=4 {
            for skip in 0..10 {
                let holder = timer_holder(threads, skip);
                assert!(partition(holder, threads, skip + 1).any(|round| round == skip));
            }
        }
    }

    #[test]
    fn test_tag_scheme() {
        assert_eq!(TagScheme::new(1, 1), TagScheme::Fixed);
        assert_eq!(TagScheme::new(2, 1), TagScheme::PerIteration);
        assert_eq!(TagScheme::new(1, 2), TagScheme::PerIteration);
        assert_eq!(TagScheme::Fixed.request(9), 1);
        assert_eq!(TagScheme::Fixed.reply(9), 2);
        assert_eq!(TagScheme::PerIteration.request(9), 9);
        assert_eq!(TagScheme::PerIteration.reply(9), 9);
    }

    #[test]
    fn test_root_cause_wins_over_aborts() {
        let e = root_cause(Some(Error::EpochAborted), Error::Validation { size: 4, iteration: 2 });
        assert!(matches!(e, Error::Validation { size: 4, iteration: 2 }));
        let e = root_cause(Some(Error::Validation { size: 4, iteration: 2 }), Error::EpochAborted);
        assert!(matches!(e, Error::Validation { .. }));
        let e = root_cause(None, Error::Group(procgroup::Error::Aborted));
        assert!(matches!(e, Error::Group(procgroup::Error::Aborted)));
        let e = root_cause(Some(Error::EpochAborted), Error::Group(procgroup::Error::Aborted));
        assert!(matches!(e, Error::EpochAborted));
    }

    #[test]
    fn test_latency_scales_with_threads() {
        let elapsed = Duration::from_micros(400);
        assert_eq!(latency_us(elapsed, 100, 1), 2.0);
        assert_eq!(latency_us(elapsed, 100, 2), 4.0);
    }
}
