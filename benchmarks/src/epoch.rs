//! Epoch coordination between the workers of one role.
//!
//! Every worker of a role calls [`EpochCoordinator::arrive_and_wait`] at the
//! start of each message size. The last local arrival enters the
//! cross-process barrier on behalf of all of them, so each process issues
//! exactly one barrier per epoch no matter how many workers it runs. The
//! other workers sleep on the condition variable until that barrier has
//! returned.
//!
//! The coordinator also provides the local rendezvous the senders pass at
//! the end of an epoch. Both waits share one abort flag, so a failing
//! worker releases its siblings wherever they are parked.
use std::fmt;
use log::debug;
use procgroup::ProcessGroup;
use threading::Backend;
use crate::{Error, Result};

/// Side of the ping-pong a process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => write!(f, "sender"),
            Role::Receiver => write!(f, "receiver"),
        }
    }
}

/// How a worker left `arrive_and_wait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// This worker arrived last and ran the cross-process barrier
    Last,
    /// Woken after another worker ran the barrier
    Released,
}

struct EpochState {
    /// Workers that have not yet been counted for the current epoch start
    /// at one; the caller that finds it equal to the thread count is last.
    counter: usize,
    generation: u64,
    rendezvous_arrived: usize,
    rendezvous_generation: u64,
    aborted: bool,
}

pub struct EpochCoordinator<B: Backend> {
    role: Role,
    threads: usize,
    state: B::Mutex<EpochState>,
    cond: B::Condvar,
}

impl<B: Backend> EpochCoordinator<B> {
    pub fn new(role: Role, threads: usize) -> EpochCoordinator<B> {
        EpochCoordinator {
            role,
            threads,
            state: B::mutex(EpochState {
                counter: 1,
                generation: 0,
                rendezvous_arrived: 0,
                rendezvous_generation: 0,
                aborted: false,
            }),
            cond: B::condvar(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Block until all `total_threads` workers of this role have arrived
    /// and the process group barrier for the epoch has completed.
    ///
    /// `total_threads` must equal the count the coordinator was built for;
    /// a mismatch is rejected instead of waiting for arrivals that will
    /// never come.
    pub fn arrive_and_wait<G>(&self, group: &G, total_threads: usize) -> Result<Arrival>
    where
        G: ProcessGroup + ?Sized,
    {
        if total_threads != self.threads {
            return Err(Error::ThreadCountMismatch {
                role: self.role,
                expected: self.threads,
                found: total_threads,
            });
        }
        let mut state = B::lock(&self.state);
        if state.aborted {
            return Err(Error::EpochAborted);
        }
        debug_assert!(state.counter <= self.threads);

        if state.counter == self.threads {
            // The barrier runs with the lock held: nobody can count
            // themselves into the next epoch before this one is released.
            let outcome = group.barrier();
            state.counter = 1;
            state.generation = state.generation.wrapping_add(1);
            if outcome.is_err() {
                state.aborted = true;
            }
            let generation = state.generation;
            drop(state);
            B::broadcast(&self.cond);
            outcome?;
            debug!("{} epoch {} released", self.role, generation);
            return Ok(Arrival::Last);
        }

        state.counter += 1;
        let generation = state.generation;
        while state.generation == generation && !state.aborted {
            state = B::wait(&self.cond, state);
        }
        if state.generation == generation {
            Err(Error::EpochAborted)
        } else {
            Ok(Arrival::Released)
        }
    }

    /// Wait until every worker of this role has arrived, without any
    /// cross-process step. Exactly one worker per generation gets `true`.
    pub fn rendezvous(&self) -> Result<bool> {
        let mut state = B::lock(&self.state);
        if state.aborted {
            return Err(Error::EpochAborted);
        }
        state.rendezvous_arrived += 1;
        if state.rendezvous_arrived == self.threads {
            state.rendezvous_arrived = 0;
            state.rendezvous_generation = state.rendezvous_generation.wrapping_add(1);
            drop(state);
            B::broadcast(&self.cond);
            return Ok(true);
        }
        let generation = state.rendezvous_generation;
        while state.rendezvous_generation == generation && !state.aborted {
            state = B::wait(&self.cond, state);
        }
        if state.rendezvous_generation == generation {
            Err(Error::EpochAborted)
        } else {
            Ok(false)
        }
    }

    /// Release every current and future waiter with `EpochAborted`.
    pub fn abort(&self) {
        let mut state = B::lock(&self.state);
        if !state.aborted {
            debug!("{} epoch coordinator aborted", self.role);
        }
        state.aborted = true;
        drop(state);
        B::broadcast(&self.cond);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use procgroup::{Rank, ReduceOp, Tag};
    use serial_test::serial;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use threading::{OsThreads, Tasklets};

    /// Group of one that only counts barriers.
    #[derive(Default)]
    struct CountingGroup {
        barriers: AtomicUsize,
        fail: bool,
    }

    impl ProcessGroup for CountingGroup {
        fn rank(&self) -> Rank {
            0
        }

        fn size(&self) -> usize {
            1
        }

        fn concurrent_callers(&self) -> bool {
            true
        }

        fn send(&self, _buf: &[u8], _dest: Rank, _tag: Tag) -> procgroup::Result<()> {
            Ok(())
        }

        fn receive(&self, _buf: &mut [u8], _source: Rank, _tag: Tag) -> procgroup::Result<()> {
            Ok(())
        }

        fn barrier(&self) -> procgroup::Result<()> {
            self.barriers.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(procgroup::Error::Aborted)
            } else {
                Ok(())
            }
        }

        fn broadcast(&self, _buf: &mut [u8], _root: Rank) -> procgroup::Result<()> {
            Ok(())
        }

        fn reduce(&self, value: f64, _op: ReduceOp, _root: Rank) -> procgroup::Result<Option<f64>> {
            Ok(Some(value))
        }

        fn abort(&self, code: i32) -> ! {
            std::process::exit(code)
        }
    }

    /// Run `threads` workers through `epochs` epochs; returns barrier count
    /// and how many arrivals were `Last`.
    fn run_epochs<B: Backend>(threads: usize, epochs: usize) -> (usize, usize) {
        B::init_thread().unwrap();
        let group = Arc::new(CountingGroup::default());
        let coordinator = Arc::new(EpochCoordinator::<B>::new(Role::Sender, threads));
        let lasts = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let group = group.clone();
                let coordinator = coordinator.clone();
                let lasts = lasts.clone();
                B::spawn(format!("sender-{}", i), move || {
                    for _ in 0..epochs {
                        if coordinator.arrive_and_wait(&*group, threads).unwrap() == Arrival::Last {
                            lasts.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
                .unwrap()
            })
            .collect();
        for handle in handles {
            B::join(handle).unwrap();
        }
        (group.barriers.load(Ordering::SeqCst), lasts.load(Ordering::SeqCst))
    }

    #[test]
    fn test_one_barrier_per_epoch_threads() {
        for threads in [1, 2, 3, 8] {
            assert_eq!(run_epochs::<OsThreads>(threads, 25), (25, 25));
        }
    }

    #[test]
    #[serial]
    fn test_one_barrier_per_epoch_tasklets() {
        for threads in [1, 2, 5] {
            assert_eq!(run_epochs::<Tasklets>(threads, 25), (25, 25));
        }
    }

    #[test]
    fn test_thread_count_mismatch_rejected() {
        let group = CountingGroup::default();
        let coordinator = EpochCoordinator::<OsThreads>::new(Role::Receiver, 2);
        match coordinator.arrive_and_wait(&group, 3) {
            Err(Error::ThreadCountMismatch { role, expected, found }) => {
                assert_eq!(role, Role::Receiver);
                assert_eq!(expected, 2);
                assert_eq!(found, 3);
            }
            other => panic!("unexpected arrival: {:?}", other),
        }
        assert_eq!(group.barriers.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_abort_releases_waiters() {
        let group = Arc::new(CountingGroup::default());
        let coordinator = Arc::new(EpochCoordinator::<OsThreads>::new(Role::Sender, 3));
        let waiter = {
            let group = group.clone();
            let coordinator = coordinator.clone();
            OsThreads::spawn("sender-0".into(), move || coordinator.arrive_and_wait(&*group, 3))
                .unwrap()
        };
        // One of three workers never shows up.
        while counter(&coordinator) < 2 {
            std::thread::yield_now();
        }
        coordinator.abort();
        assert!(matches!(OsThreads::join(waiter).unwrap(), Err(Error::EpochAborted)));
        assert!(matches!(
            coordinator.arrive_and_wait(&*group, 3),
            Err(Error::EpochAborted)
        ));
        assert_eq!(group.barriers.load(Ordering::SeqCst), 0);
    }

    fn counter(coordinator: &EpochCoordinator<OsThreads>) -> usize {
        OsThreads::lock(&coordinator.state).counter
    }

    fn rendezvous_rounds<B: Backend>(threads: usize, rounds: usize) -> usize {
        B::init_thread().unwrap();
        let coordinator = Arc::new(EpochCoordinator::<B>::new(Role::Sender, threads));
        assert_eq!(coordinator.threads(), threads);
        assert_eq!(coordinator.role(), Role::Sender);
        let leaders = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let coordinator = coordinator.clone();
                let leaders = leaders.clone();
                B::spawn(format!("sender-{}", i), move || {
                    for _ in 0..rounds {
                        if coordinator.rendezvous().unwrap() {
                            leaders.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
                .unwrap()
            })
            .collect();
        for handle in handles {
            B::join(handle).unwrap();
        }
        leaders.load(Ordering::SeqCst)
    }

    #[test]
    fn test_rendezvous_one_leader_per_round() {
        for threads in [1, 2, 4] {
            assert_eq!(rendezvous_rounds::<OsThreads>(threads, 20), 20);
        }
    }

    #[test]
    #[serial]
    fn test_rendezvous_one_leader_per_round_tasklets() {
        assert_eq!(rendezvous_rounds::<Tasklets>(3, 20), 20);
    }

    #[test]
    fn test_abort_releases_rendezvous() {
        let coordinator = Arc::new(EpochCoordinator::<OsThreads>::new(Role::Sender, 2));
        let waiter = {
            let coordinator = coordinator.clone();
            OsThreads::spawn("sender-0".into(), move || coordinator.rendezvous()).unwrap()
        };
        while OsThreads::lock(&coordinator.state).rendezvous_arrived < 1 {
            std::thread::yield_now();
        }
        // The second sender failed before reaching the rendezvous.
        coordinator.abort();
        assert!(matches!(OsThreads::join(waiter).unwrap(), Err(Error::EpochAborted)));
        assert!(matches!(coordinator.rendezvous(), Err(Error::EpochAborted)));
    }

    #[test]
    fn test_failed_barrier_aborts_epoch() {
        let group = CountingGroup {
            fail: true,
            ..Default::default()
        };
        let coordinator = EpochCoordinator::<OsThreads>::new(Role::Sender, 1);
        assert!(matches!(
            coordinator.arrive_and_wait(&group, 1),
            Err(Error::Group(procgroup::Error::Aborted))
        ));
        assert!(matches!(
            coordinator.arrive_and_wait(&group, 1),
            Err(Error::EpochAborted)
        ));
    }
}
