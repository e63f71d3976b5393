//! Interval timer shared by the sender workers.
//!
//! Only the timer holder of an epoch writes the timer. It records the start
//! before its first measured exchange and the end after the sender
//! rendezvous barrier, then reads both. The barrier orders every other
//! sender's exchanges before the end mark; the release stores and acquire
//! loads make the marks visible to any worker that reads after that same
//! barrier, without a lock on the timing path.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub struct IntervalTimer {
    origin: Instant,
    start_ns: AtomicU64,
    end_ns: AtomicU64,
}

impl Default for IntervalTimer {
    fn default() -> Self {
        IntervalTimer::new()
    }
}

impl IntervalTimer {
    pub fn new() -> IntervalTimer {
        IntervalTimer {
            origin: Instant::now(),
            start_ns: AtomicU64::new(0),
            end_ns: AtomicU64::new(0),
        }
    }

    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    pub fn start(&self) {
        let now = self.now_ns();
        self.start_ns.store(now, Ordering::Release);
        self.end_ns.store(now, Ordering::Release);
    }

    pub fn stop(&self) {
        self.end_ns.store(self.now_ns(), Ordering::Release);
    }

    /// Time between the last `start` and `stop`.
    pub fn elapsed(&self) -> Duration {
        let start = self.start_ns.load(Ordering::Acquire);
        let end = self.end_ns.load(Ordering::Acquire);
        Duration::from_nanos(end.saturating_sub(start))
    }
}
