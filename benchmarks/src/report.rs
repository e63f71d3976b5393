//! Result output.
use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};
use crate::bcast::BcastStats;

pub(crate) const FIELD_WIDTH: usize = 20;
pub(crate) const FLOAT_PRECISION: usize = 2;

/// Latency of one message size, reported by that epoch's timer holder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySample {
    pub size: usize,
    /// One-way latency in microseconds
    pub latency_us: f64,
    /// Sender worker that measured the epoch
    pub worker: usize,
}

/// Receives latency results as they are measured, in increasing size order.
pub trait Reporter: Send + Sync {
    /// Called once on the sender process before the first epoch.
    fn begin(&self, _sender_threads: usize, _receiver_threads: usize) {}

    fn report(&self, sample: LatencySample);
}

/// Prints results to stdout in the usual OSU column layout.
pub struct StdoutReporter {
    backend: &'static str,
}

impl StdoutReporter {
    pub fn new(backend: &'static str) -> StdoutReporter {
        StdoutReporter { backend }
    }
}

pub(crate) fn format_row(size: usize, value: f64) -> String {
    format!(
        "{:<10}{:>width$.prec$}",
        size,
        value,
        width = FIELD_WIDTH,
        prec = FLOAT_PRECISION
    )
}

impl Reporter for StdoutReporter {
    fn begin(&self, sender_threads: usize, receiver_threads: usize) {
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "# Number of Sender threads: {}", sender_threads);
        let _ = writeln!(out, "# Number of Receiver threads: {}", receiver_threads);
        let _ = writeln!(out, "# Multi-threaded Latency Test ({})", self.backend);
        let _ = writeln!(out, "{:<10}{:>width$}", "# Size", "Latency (us)", width = FIELD_WIDTH);
        let _ = out.flush();
    }

    fn report(&self, sample: LatencySample) {
        let mut out = io::stdout().lock();
        let _ = writeln!(out, "{}", format_row(sample.size, sample.latency_us));
        let _ = out.flush();
    }
}

/// Keeps every sample in memory.
#[derive(Default)]
pub struct CollectingReporter {
    samples: Mutex<Vec<LatencySample>>,
    begun: Mutex<Option<(usize, usize)>>,
}

impl CollectingReporter {
    pub fn new() -> CollectingReporter {
        CollectingReporter::default()
    }

    pub fn samples(&self) -> Vec<LatencySample> {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Thread counts passed to `begin`, if it was called.
    pub fn begun(&self) -> Option<(usize, usize)> {
        *self.begun.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Reporter for CollectingReporter {
    fn begin(&self, sender_threads: usize, receiver_threads: usize) {
        *self.begun.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((sender_threads, receiver_threads));
    }

    fn report(&self, sample: LatencySample) {
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sample);
    }
}

/// Header and rows of the broadcast test.
pub(crate) fn write_bcast<W: Write>(out: &mut W, stats: &[BcastStats], full: bool) -> io::Result<()> {
    if full {
        writeln!(
            out,
            "{:<10}{:>w$}{:>w$}{:>w$}{:>12}",
            "# Size",
            "Avg Latency(us)",
            "Min Latency(us)",
            "Max Latency(us)",
            "Iterations",
            w = FIELD_WIDTH
        )?;
    } else {
        writeln!(out, "{:<10}{:>w$}", "# Size", "Avg Latency(us)", w = FIELD_WIDTH)?;
    }
    for s in stats {
        if full {
            writeln!(
                out,
                "{}{:>w$.p$}{:>w$.p$}{:>12}",
                format_row(s.size, s.avg_us),
                s.min_us,
                s.max_us,
                s.iterations,
                w = FIELD_WIDTH,
                p = FLOAT_PRECISION
            )?;
        } else {
            writeln!(out, "{}", format_row(s.size, s.avg_us))?;
        }
    }
    out.flush()
}
