//! Benchmark options, loadable from YAML.
use serde::Deserialize;
use crate::epoch::Role;
use crate::sizes::{IterationCounts, SizeSchedule};
use crate::{Error, Result};

/// Sizes strictly above this switch to the large iteration counts.
pub const LARGE_MESSAGE_SIZE: usize = 8192;
/// Upper bound for the worker count of either role.
pub const MAX_THREADS: usize = 128;

/// Both regimes need at least one measured round, and `iterations + skip`
/// must stay representable.
fn check_counts(small: IterationCounts, large: IterationCounts) -> Result<()> {
    if small.iterations == 0 || large.iterations == 0 {
        return Err(Error::InvalidOptions(
            "iterations and iterations_large must be at least 1".into(),
        ));
    }
    for (name, counts) in [("iterations + skip", small), ("iterations_large + skip_large", large)] {
        if counts.iterations.checked_add(counts.skip).is_none() {
            return Err(Error::InvalidOptions(format!("{} overflows", name)));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LatencyMtOptions {
    pub min_size: usize,
    pub max_size: usize,
    pub iterations: usize,
    pub skip: usize,
    pub iterations_large: usize,
    pub skip_large: usize,
    pub large_message_size: usize,
    pub sender_threads: usize,
    pub receiver_threads: usize,
    /// Check replies against the peer's fill pattern
    pub validate: bool,
}

impl Default for LatencyMtOptions {
    fn default() -> Self {
        LatencyMtOptions {
            min_size: 0,
            max_size: 1 << 22,
            iterations: 10000,
            skip: 100,
            iterations_large: 1000,
            skip_large: 10,
            large_message_size: LARGE_MESSAGE_SIZE,
            sender_threads: 1,
            receiver_threads: 2,
            validate: false,
        }
    }
}

impl LatencyMtOptions {
    pub fn schedule(&self) -> SizeSchedule {
        SizeSchedule {
            min_size: self.min_size,
            max_size: self.max_size,
            small: IterationCounts {
                iterations: self.iterations,
                skip: self.skip,
            },
            large: IterationCounts {
                iterations: self.iterations_large,
                skip: self.skip_large,
            },
            large_message_size: self.large_message_size,
        }
    }

    /// Worker count of `role`.
    pub fn threads(&self, role: Role) -> usize {
        match role {
            Role::Sender => self.sender_threads,
            Role::Receiver => self.receiver_threads,
        }
    }

    /// Checks that only need this process's options.
    pub fn validate(&self) -> Result<()> {
        let schedule = self.schedule();
        check_counts(schedule.small, schedule.large)?;
        for role in [Role::Sender, Role::Receiver] {
            let threads = self.threads(role);
            if threads == 0 || threads > MAX_THREADS {
                return Err(Error::InvalidOptions(format!(
                    "{} threads must be between 1 and {}, got {}",
                    role, MAX_THREADS, threads
                )));
            }
        }
        Ok(())
    }

    /// Flattened options, compared across processes before starting.
    pub(crate) fn fingerprint(&self) -> [u64; 10] {
        [
            self.sender_threads as u64,
            self.receiver_threads as u64,
            self.min_size as u64,
            self.max_size as u64,
            self.iterations as u64,
            self.skip as u64,
            self.iterations_large as u64,
            self.skip_large as u64,
            self.large_message_size as u64,
            self.validate as u64,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BcastOptions {
    pub min_size: usize,
    pub max_size: usize,
    pub iterations: usize,
    pub skip: usize,
    pub iterations_large: usize,
    pub skip_large: usize,
    pub large_message_size: usize,
    pub max_mem_limit: usize,
    /// Print min, max and iteration columns as well
    pub full: bool,
}

impl Default for BcastOptions {
    fn default() -> Self {
        BcastOptions {
            min_size: 1,
            max_size: 1 << 20,
            iterations: 1000,
            skip: 200,
            iterations_large: 100,
            skip_large: 10,
            large_message_size: LARGE_MESSAGE_SIZE,
            max_mem_limit: 1 << 30,
            full: false,
        }
    }
}

impl BcastOptions {
    pub fn schedule(&self) -> SizeSchedule {
        SizeSchedule {
            min_size: self.min_size,
            max_size: self.max_size,
            small: IterationCounts {
                iterations: self.iterations,
                skip: self.skip,
            },
            large: IterationCounts {
                iterations: self.iterations_large,
                skip: self.skip_large,
            },
            large_message_size: self.large_message_size,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let schedule = self.schedule();
        check_counts(schedule.small, schedule.large)
    }

    /// Lower `max_size` to the memory limit. Returns whether it changed.
    pub fn clamp_to_memory_limit(&mut self) -> bool {
        if self.max_size > self.max_mem_limit {
            self.max_size = self.max_mem_limit;
            true
        } else {
            false
        }
    }
}
