//! Threading backends for the benchmark workers.
//!
//! A [`Backend`] bundles the primitives the epoch protocol needs: mutexes,
//! condition variables, counting barriers and thread create/join. Two
//! implementations exist and are interchangeable: [`OsThreads`] maps every
//! worker onto a preemptive OS thread, [`Tasklets`] multiplexes workers as
//! cooperative coroutines over a fixed set of scheduler threads.
//!
//! Both give the same blocking guarantees. A waiter on a condition variable
//! or barrier does not return until it has been released, and `join` only
//! returns once the task has terminated and its result has been stored.
use std::ops::DerefMut;
use thiserror::Error;

mod os;
pub use os::OsThreads;
mod tasklet;
pub use tasklet::{Tasklets, TaskletBarrier, STACK_SIZE_ENV, WORKERS_ENV};

#[derive(Debug, Error)]
pub enum Error {
    /// The backend could not create a new thread or task
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),

    /// A worker panicked before storing its result
    #[error("worker panicked: {0}")]
    Panicked(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Thread and synchronization primitives behind one interface.
///
/// All operations are associated functions: a backend is chosen as a type
/// parameter and carries no state of its own beyond what `init_thread`
/// configures process-wide.
pub trait Backend: Send + Sync + Sized + 'static {
    type Mutex<T: Send>: Send + Sync;
    type Guard<'a, T: Send + 'a>: DerefMut<Target = T>
    where
        Self: 'a;
    type Condvar: Send + Sync;
    type Barrier: Send + Sync;
    type JoinHandle<T: Send + 'static>;

    /// Short name used in logs and output headers.
    const NAME: &'static str;

    /// Prepare the backend. Idempotent at process scope; must be called
    /// before the first `spawn`.
    fn init_thread() -> Result<()>;

    /// Start `f` as a new worker. The worker's return value is handed back
    /// by `join`.
    fn spawn<F, T>(name: String, f: F) -> Result<Self::JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static;

    /// Block until the worker has fully terminated and return its result.
    fn join<T: Send + 'static>(handle: Self::JoinHandle<T>) -> Result<T>;

    fn mutex<T: Send>(value: T) -> Self::Mutex<T>;

    fn lock<T: Send>(mutex: &Self::Mutex<T>) -> Self::Guard<'_, T>;

    fn condvar() -> Self::Condvar;

    /// Atomically release `guard` and wait for a broadcast, then reacquire.
    /// Spurious wakeups are allowed; callers loop on their predicate.
    fn wait<'a, T: Send + 'a>(cond: &Self::Condvar, guard: Self::Guard<'a, T>) -> Self::Guard<'a, T>;

    /// Wake every waiter of `cond`.
    fn broadcast(cond: &Self::Condvar);

    /// Counting barrier for `count` participants.
    fn barrier(count: usize) -> Self::Barrier;

    /// Wait until `count` participants arrived. Exactly one of them gets
    /// `true` back per generation.
    fn barrier_wait(barrier: &Self::Barrier) -> bool;
}

/// Turn a panic payload into something printable.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
