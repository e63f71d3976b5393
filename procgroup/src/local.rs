//! Process group whose ranks live inside one process.
//!
//! Every rank is a [`LocalGroup`] handle onto a shared [`LocalWorld`].
//! Messages are buffered per `(source, destination, tag)` in FIFO order, so
//! a send never blocks and a receive blocks until a matching message shows
//! up. Blocking goes through the mutex and condition variable of the chosen
//! [`Backend`], which keeps tasklet workers from stalling their execution
//! context while they wait for a peer.
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use log::{debug, error};
use threading::Backend;
use crate::{Error, ProcessGroup, Rank, ReduceOp, Result, Tag};

struct PendingBroadcast {
    data: Vec<u8>,
    remaining: usize,
}

#[derive(Default)]
struct State {
    mailboxes: HashMap<(Rank, Rank, Tag), VecDeque<Vec<u8>>>,
    barrier_arrived: usize,
    barrier_generation: u64,
    broadcasts: HashMap<u64, PendingBroadcast>,
    reductions: HashMap<u64, Vec<f64>>,
    aborted: bool,
}

struct Shared<B: Backend> {
    size: usize,
    state: B::Mutex<State>,
    cond: B::Condvar,
    barrier_calls: Vec<AtomicUsize>,
    messages_sent: Vec<AtomicUsize>,
}

/// The shared side of an in-process group.
pub struct LocalWorld<B: Backend> {
    shared: Arc<Shared<B>>,
}

impl<B: Backend> Clone for LocalWorld<B> {
    fn clone(&self) -> Self {
        LocalWorld {
            shared: self.shared.clone(),
        }
    }
}

impl<B: Backend> LocalWorld<B> {
    pub fn new(size: usize) -> LocalWorld<B> {
        LocalWorld {
            shared: Arc::new(Shared {
                size,
                state: B::mutex(State::default()),
                cond: B::condvar(),
                barrier_calls: (0..size).map(|_| AtomicUsize::new(0)).collect(),
                messages_sent: (0..size).map(|_| AtomicUsize::new(0)).collect(),
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Handle for `rank`. Each rank should be handed out once.
    pub fn group(&self, rank: Rank) -> Result<LocalGroup<B>> {
        if rank < 0 || rank as usize >= self.shared.size {
            return Err(Error::InvalidRank(rank));
        }
        Ok(LocalGroup {
            rank,
            shared: self.shared.clone(),
            collectives: AtomicU64::new(0),
        })
    }

    /// One handle per rank, in rank order.
    pub fn groups(&self) -> Vec<LocalGroup<B>> {
        (0..self.shared.size)
            .map(|rank| LocalGroup {
                rank: rank as Rank,
                shared: self.shared.clone(),
                collectives: AtomicU64::new(0),
            })
            .collect()
    }

    /// Fail every blocked and future call on every rank with
    /// [`Error::Aborted`].
    pub fn shutdown(&self) {
        {
            let mut state = B::lock(&self.shared.state);
            state.aborted = true;
        }
        B::broadcast(&self.shared.cond);
        debug!("local group torn down");
    }

    /// Messages sent but not yet received, over all ranks.
    pub fn pending_messages(&self) -> usize {
        let state = B::lock(&self.shared.state);
        state.mailboxes.values().map(VecDeque::len).sum()
    }
}

/// One rank of a [`LocalWorld`].
pub struct LocalGroup<B: Backend> {
    rank: Rank,
    shared: Arc<Shared<B>>,
    collectives: AtomicU64,
}

impl<B: Backend> LocalGroup<B> {
    /// How many times this rank entered `barrier`.
    pub fn barrier_calls(&self) -> usize {
        self.shared.barrier_calls[self.rank as usize].load(Ordering::SeqCst)
    }

    /// How many point-to-point messages this rank has sent.
    pub fn messages_sent(&self) -> usize {
        self.shared.messages_sent[self.rank as usize].load(Ordering::SeqCst)
    }

    pub fn world(&self) -> LocalWorld<B> {
        LocalWorld {
            shared: self.shared.clone(),
        }
    }

    fn check_rank(&self, rank: Rank) -> Result<()> {
        if rank < 0 || rank as usize >= self.shared.size {
            Err(Error::InvalidRank(rank))
        } else {
            Ok(())
        }
    }

    fn next_collective(&self) -> u64 {
        self.collectives.fetch_add(1, Ordering::Relaxed)
    }
}

impl<B: Backend> ProcessGroup for LocalGroup<B> {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn concurrent_callers(&self) -> bool {
        true
    }

    fn send(&self, buf: &[u8], dest: Rank, tag: Tag) -> Result<()> {
        self.check_rank(dest)?;
        let mut state = B::lock(&self.shared.state);
        if state.aborted {
            return Err(Error::Aborted);
        }
        state
            .mailboxes
            .entry((self.rank, dest, tag))
            .or_default()
            .push_back(buf.to_vec());
        drop(state);
        self.shared.messages_sent[self.rank as usize].fetch_add(1, Ordering::SeqCst);
        B::broadcast(&self.shared.cond);
        Ok(())
    }

    fn receive(&self, buf: &mut [u8], source: Rank, tag: Tag) -> Result<()> {
        self.check_rank(source)?;
        let key = (source, self.rank, tag);
        let mut state = B::lock(&self.shared.state);
        loop {
            if state.aborted {
                return Err(Error::Aborted);
            }
            if let Some(message) = state.mailboxes.get_mut(&key).and_then(VecDeque::pop_front) {
                if state.mailboxes.get(&key).map_or(false, VecDeque::is_empty) {
                    state.mailboxes.remove(&key);
                }
                if message.len() > buf.len() {
                    return Err(Error::Truncated {
                        incoming: message.len(),
                        capacity: buf.len(),
                        tag,
                    });
                }
                buf[..message.len()].copy_from_slice(&message);
                return Ok(());
            }
            state = B::wait(&self.shared.cond, state);
        }
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier_calls[self.rank as usize].fetch_add(1, Ordering::SeqCst);
        let mut state = B::lock(&self.shared.state);
        if state.aborted {
            return Err(Error::Aborted);
        }
        let generation = state.barrier_generation;
        state.barrier_arrived += 1;
        if state.barrier_arrived == self.shared.size {
            state.barrier_arrived = 0;
            state.barrier_generation = state.barrier_generation.wrapping_add(1);
            drop(state);
            B::broadcast(&self.shared.cond);
            return Ok(());
        }
        while state.barrier_generation == generation {
            if state.aborted {
                return Err(Error::Aborted);
            }
            state = B::wait(&self.shared.cond, state);
        }
        Ok(())
    }

    fn broadcast(&self, buf: &mut [u8], root: Rank) -> Result<()> {
        self.check_rank(root)?;
        let seq = self.next_collective();
        let readers = self.shared.size - 1;
        if self.rank == root {
            if readers > 0 {
                let mut state = B::lock(&self.shared.state);
                state.broadcasts.insert(
                    seq,
                    PendingBroadcast {
                        data: buf.to_vec(),
                        remaining: readers,
                    },
                );
                drop(state);
                B::broadcast(&self.shared.cond);
            }
            return Ok(());
        }
        let mut state = B::lock(&self.shared.state);
        loop {
            if state.aborted {
                return Err(Error::Aborted);
            }
            if let Some(pending) = state.broadcasts.get_mut(&seq) {
                if pending.data.len() > buf.len() {
                    return Err(Error::Truncated {
                        incoming: pending.data.len(),
                        capacity: buf.len(),
                        tag: -1,
                    });
                }
                buf[..pending.data.len()].copy_from_slice(&pending.data);
                pending.remaining -= 1;
                if pending.remaining == 0 {
                    state.broadcasts.remove(&seq);
                }
                return Ok(());
            }
            state = B::wait(&self.shared.cond, state);
        }
    }

    fn reduce(&self, value: f64, op: ReduceOp, root: Rank) -> Result<Option<f64>> {
        self.check_rank(root)?;
        let seq = self.next_collective();
        let mut state = B::lock(&self.shared.state);
        state.reductions.entry(seq).or_default().push(value);
        B::broadcast(&self.shared.cond);
        if self.rank != root {
            return Ok(None);
        }
        loop {
            if state.aborted {
                return Err(Error::Aborted);
            }
            let complete = state
                .reductions
                .get(&seq)
                .map_or(false, |values| values.len() == self.shared.size);
            if complete {
                let values = state.reductions.remove(&seq).unwrap_or_default();
                let result = values.into_iter().reduce(|a, b| op.apply(a, b));
                return Ok(result);
            }
            state = B::wait(&self.shared.cond, state);
        }
    }

    fn abort(&self, code: i32) -> ! {
        error!("rank {} aborting local group with code {}", self.rank, code);
        self.world().shutdown();
        std::process::exit(code)
    }
}
