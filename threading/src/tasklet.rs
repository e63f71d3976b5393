//! Cooperative backend: workers are `may` coroutines.
//!
//! The scheduler owns a fixed set of execution contexts (`may` worker
//! threads). Each context runs its own FIFO run queue that any context may
//! push to or steal from. A coroutine spawned from inside a context is
//! queued on that context; one spawned from a plain thread goes through the
//! shared injector queue.
//!
//! Blocking on a [`Tasklets`] mutex, condition variable or barrier parks
//! only the coroutine, so other tasklets on the same context keep running.
use std::sync::{Once, PoisonError};
use log::{info, warn};
use may::coroutine::{self, JoinHandle};
use may::sync::{Condvar, Mutex, MutexGuard};
use crate::{panic_message, Backend, Error, Result};

/// Number of execution contexts.
pub const WORKERS_ENV: &str = "TASKLET_WORKERS";
/// Coroutine stack size.
pub const STACK_SIZE_ENV: &str = "TASKLET_STACK_SIZE";

const DEFAULT_WORKERS: usize = 1;
const DEFAULT_STACK_SIZE: usize = 0x20000;

static SCHEDULER_INIT: Once = Once::new();

/// Workers are coroutines multiplexed over a fixed pool of contexts.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tasklets;

/// Parse a positive count from the environment, falling back to `default`.
fn positive_from_env(name: &str, value: Option<String>, default: usize) -> usize {
    match value {
        None => default,
        Some(raw) => match raw.trim().parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => {
                warn!("ignoring {}={:?}, using {}", name, raw, default);
                default
            }
        },
    }
}

pub(crate) fn workers_from_env(value: Option<String>) -> usize {
    positive_from_env(WORKERS_ENV, value, DEFAULT_WORKERS)
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
}

/// Counting barrier built from the coroutine-aware mutex and condvar.
pub struct TaskletBarrier {
    count: usize,
    state: Mutex<BarrierState>,
    cond: Condvar,
}

impl TaskletBarrier {
    fn new(count: usize) -> TaskletBarrier {
        TaskletBarrier {
            count,
            state: Mutex::new(BarrierState::default()),
            cond: Condvar::new(),
        }
    }

    fn wait(&self) -> bool {
        let mut state = Tasklets::lock(&self.state);
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived >= self.count {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.cond.notify_all();
            return true;
        }
        while state.generation == generation {
            state = Tasklets::wait(&self.cond, state);
        }
        false
    }
}

impl Backend for Tasklets {
    type Mutex<T: Send> = Mutex<T>;
    type Guard<'a, T: Send + 'a> = MutexGuard<'a, T>;
    type Condvar = Condvar;
    type Barrier = TaskletBarrier;
    type JoinHandle<T: Send + 'static> = JoinHandle<T>;

    const NAME: &'static str = "tasklets";

    fn init_thread() -> Result<()> {
        SCHEDULER_INIT.call_once(|| {
            let workers = workers_from_env(std::env::var(WORKERS_ENV).ok());
            let stack_size = positive_from_env(
                STACK_SIZE_ENV,
                std::env::var(STACK_SIZE_ENV).ok(),
                DEFAULT_STACK_SIZE,
            );
            may::config()
                .set_workers(workers)
                .set_stack_size(stack_size);
            info!(
                "tasklet scheduler: {} execution contexts, stack size {:#x}",
                workers, stack_size
            );
        });
        Ok(())
    }

    fn spawn<F, T>(name: String, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        Self::init_thread()?;
        // SAFETY: worker bodies keep their state in the closure and in
        // shared `Arc`s, never in OS thread-local storage, so migrating
        // between contexts at a yield point is sound.
        let handle = unsafe { coroutine::Builder::new().name(name).spawn(f)? };
        Ok(handle)
    }

    fn join<T: Send + 'static>(handle: JoinHandle<T>) -> Result<T> {
        handle
            .join()
            .map_err(|payload| Error::Panicked(panic_message(payload)))
    }

    fn mutex<T: Send>(value: T) -> Mutex<T> {
        Mutex::new(value)
    }

    fn lock<T: Send>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn condvar() -> Condvar {
        Condvar::new()
    }

    fn wait<'a, T: Send + 'a>(cond: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    fn broadcast(cond: &Condvar) {
        cond.notify_all();
    }

    fn barrier(count: usize) -> TaskletBarrier {
        TaskletBarrier::new(count)
    }

    fn barrier_wait(barrier: &TaskletBarrier) -> bool {
        barrier.wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_workers_from_env() {
        assert_eq!(workers_from_env(None), 1);
        assert_eq!(workers_from_env(Some("4".into())), 4);
        assert_eq!(workers_from_env(Some("0".into())), 1);
        assert_eq!(workers_from_env(Some("-2".into())), 1);
        assert_eq!(workers_from_env(Some("many".into())), 1);
    }

    #[test]
    #[serial]
    fn test_init_idempotent() {
        Tasklets::init_thread().unwrap();
        Tasklets::init_thread().unwrap();
        let handle = Tasklets::spawn("tasklet-0".into(), || 5).unwrap();
        assert_eq!(Tasklets::join(handle).unwrap(), 5);
    }

    #[test]
    #[serial]
    fn test_join_reports_panic() {
        Tasklets::init_thread().unwrap();
        let handle = Tasklets::spawn::<_, ()>("tasklet-0".into(), || panic!("tasklet boom")).unwrap();
        assert!(matches!(Tasklets::join(handle), Err(Error::Panicked(_))));
    }

    // More tasklets than execution contexts: a parked tasklet must let the
    // others run or the barrier would never fill.
    #[test]
    #[serial]
    fn test_barrier_with_more_tasks_than_contexts() {
        Tasklets::init_thread().unwrap();
        let barrier = Arc::new(Tasklets::barrier(8));
        let leaders = Arc::new(AtomicUsize::new(0));
        let passed = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let barrier = barrier.clone();
                let leaders = leaders.clone();
                let passed = passed.clone();
                Tasklets::spawn(format!("tasklet-{}", i), move || {
                    for _ in 0..5 {
                        if Tasklets::barrier_wait(&barrier) {
                            leaders.fetch_add(1, Ordering::SeqCst);
                        }
                        passed.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .unwrap()
            })
            .collect();
        for handle in handles {
            Tasklets::join(handle).unwrap();
        }
        assert_eq!(leaders.load(Ordering::SeqCst), 5);
        assert_eq!(passed.load(Ordering::SeqCst), 40);
    }

    #[test]
    #[serial]
    fn test_condvar_broadcast_wakes_tasklets() {
        Tasklets::init_thread().unwrap();
        let state = Arc::new((Tasklets::mutex(false), Tasklets::condvar()));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let state = state.clone();
                Tasklets::spawn(format!("waiter-{}", i), move || {
                    let (mutex, cond) = &*state;
                    let mut ready = Tasklets::lock(mutex);
                    while !*ready {
                        ready = Tasklets::wait(cond, ready);
                    }
                    i
                })
                .unwrap()
            })
            .collect();
        {
            let (mutex, cond) = &*state;
            *Tasklets::lock(mutex) = true;
            Tasklets::broadcast(cond);
        }
        let ids: Vec<usize> = handles
            .into_iter()
            .map(|h| Tasklets::join(h).unwrap())
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }
}
