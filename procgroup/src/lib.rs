//! Process-group layer used by the benchmarks.
//!
//! The benchmarks only need blocking tagged point-to-point messages plus a
//! handful of collectives. [`ProcessGroup`] captures exactly that, so the
//! same benchmark code runs over MPI ([`MpiGroup`]) or over ranks living in
//! one process ([`LocalGroup`]).
use thiserror::Error;

mod local;
pub use local::{LocalGroup, LocalWorld};
mod mpi_group;
pub use mpi_group::{MpiGroup, ThreadLevel};

pub type Rank = i32;
pub type Tag = i32;

/// Largest tag every MPI implementation must accept.
pub const MIN_TAG_UB: Tag = 32767;

#[derive(Debug, Error)]
pub enum Error {
    /// The runtime was initialized twice in this process
    #[error("process group runtime already initialized")]
    AlreadyInitialized,

    /// Rank outside of the group
    #[error("rank {0} is not part of the group")]
    InvalidRank(Rank),

    /// Incoming message does not fit the receive buffer
    #[error("message of {incoming} bytes truncated to {capacity} bytes (tag {tag})")]
    Truncated {
        incoming: usize,
        capacity: usize,
        tag: Tag,
    },

    /// The group was torn down while waiting
    #[error("process group aborted")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Reduction operator for [`ProcessGroup::reduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Min,
    Max,
    Sum,
}

impl ReduceOp {
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            ReduceOp::Min => a.min(b),
            ReduceOp::Max => a.max(b),
            ReduceOp::Sum => a + b,
        }
    }
}

/// A group of cooperating processes.
///
/// Point-to-point operations are blocking and match on `(peer, tag)`.
/// Collectives must be entered by every rank of the group in the same
/// order.
pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> Rank;

    fn size(&self) -> usize;

    /// Whether several threads may call into the group at the same time.
    fn concurrent_callers(&self) -> bool;

    /// Largest tag usable for point-to-point messages.
    fn max_tag(&self) -> Tag {
        MIN_TAG_UB
    }

    fn send(&self, buf: &[u8], dest: Rank, tag: Tag) -> Result<()>;

    /// Receive exactly one message from `source` with `tag` into `buf`.
    fn receive(&self, buf: &mut [u8], source: Rank, tag: Tag) -> Result<()>;

    /// Returns only after every rank has entered the barrier.
    fn barrier(&self) -> Result<()>;

    /// Copy `buf` of `root` into `buf` of every other rank.
    fn broadcast(&self, buf: &mut [u8], root: Rank) -> Result<()>;

    /// Combine `value` from every rank with `op`. Only `root` gets
    /// `Some(result)`.
    fn reduce(&self, value: f64, op: ReduceOp, root: Rank) -> Result<Option<f64>>;

    /// Tear down the whole group. Does not return.
    fn abort(&self, code: i32) -> !;
}
