//! Preemptive backend: one OS thread per worker.
use std::sync::{Barrier, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use log::debug;
use crate::{panic_message, Backend, Error, Result};

/// Workers run on dedicated OS threads and block in the kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsThreads;

impl Backend for OsThreads {
    type Mutex<T: Send> = Mutex<T>;
    type Guard<'a, T: Send + 'a> = MutexGuard<'a, T>;
    type Condvar = Condvar;
    type Barrier = Barrier;
    type JoinHandle<T: Send + 'static> = JoinHandle<T>;

    const NAME: &'static str = "threads";

    fn init_thread() -> Result<()> {
        Ok(())
    }

    fn spawn<F, T>(name: String, f: F) -> Result<JoinHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        debug!("spawning os thread {}", name);
        Ok(thread::Builder::new().name(name).spawn(f)?)
    }

    fn join<T: Send + 'static>(handle: JoinHandle<T>) -> Result<T> {
        handle
            .join()
            .map_err(|payload| Error::Panicked(panic_message(payload)))
    }

    fn mutex<T: Send>(value: T) -> Mutex<T> {
        Mutex::new(value)
    }

    // A panicking worker is reported through `join`; the protected state
    // itself stays consistent, so poisoning is ignored here.
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

    fn barrier(count: usize) -> Barrier {
        Barrier::new(count)
    }

    fn barrier_wait(barrier: &Barrier) -> bool {
        barrier.wait().is_leader()
    }
}
