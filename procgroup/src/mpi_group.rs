//! MPI-backed process group (rsmpi).
use log::{debug, info};
use mpi::collective::SystemOperation;
use mpi::environment::Universe;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use mpi::Threading;
use crate::{Error, ProcessGroup, Rank, ReduceOp, Result, Tag};

/// Thread support level of the MPI library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThreadLevel {
    Single,
    Funneled,
    Serialized,
    Multiple,
}

impl From<Threading> for ThreadLevel {
    fn from(threading: Threading) -> ThreadLevel {
        match threading {
            Threading::Single => ThreadLevel::Single,
            Threading::Funneled => ThreadLevel::Funneled,
            Threading::Serialized => ThreadLevel::Serialized,
            Threading::Multiple => ThreadLevel::Multiple,
        }
    }
}

impl From<ThreadLevel> for Threading {
    fn from(level: ThreadLevel) -> Threading {
        match level {
            ThreadLevel::Single => Threading::Single,
            ThreadLevel::Funneled => Threading::Funneled,
            ThreadLevel::Serialized => Threading::Serialized,
            ThreadLevel::Multiple => Threading::Multiple,
        }
    }
}

/// `MPI_COMM_WORLD` of an initialized MPI environment.
///
/// Dropping the group finalizes MPI.
pub struct MpiGroup {
    // Declared before the universe so it is released before finalize.
    world: SimpleCommunicator,
    provided: ThreadLevel,
    _universe: Universe,
}

// SAFETY: the communicator is a handle into the MPI library. Concurrent use
// from several threads is only legal at `ThreadLevel::Multiple`, which the
// benchmarks check through `concurrent_callers` before sharing the group.
unsafe impl Send for MpiGroup {}
unsafe impl Sync for MpiGroup {}

impl MpiGroup {
    /// Initialize MPI requesting the `required` thread level. The level
    /// actually granted is available through [`MpiGroup::provided`].
    pub fn init(required: ThreadLevel) -> Result<MpiGroup> {
        let (universe, provided) =
            mpi::initialize_with_threading(required.into()).ok_or(Error::AlreadyInitialized)?;
        let world = universe.world();
        let provided = ThreadLevel::from(provided);
        info!(
            "mpi initialized: rank {} of {}, thread level {:?} (requested {:?})",
            world.rank(),
            world.size(),
            provided,
            required
        );
        Ok(MpiGroup {
            world,
            provided,
            _universe: universe,
        })
    }

    pub fn provided(&self) -> ThreadLevel {
        self.provided
    }

    fn check_rank(&self, rank: Rank) -> Result<()> {
        if rank < 0 || rank >= self.world.size() {
            Err(Error::InvalidRank(rank))
        } else {
            Ok(())
        }
    }
}

impl ProcessGroup for MpiGroup {
    fn rank(&self) -> Rank {
        self.world.rank()
    }

    fn size(&self) -> usize {
        self.world.size() as usize
    }

    fn concurrent_callers(&self) -> bool {
        self.provided == ThreadLevel::Multiple
    }

    fn send(&self, buf: &[u8], dest: Rank, tag: Tag) -> Result<()> {
        self.check_rank(dest)?;
        self.world.process_at_rank(dest).send_with_tag(buf, tag);
        Ok(())
    }

    fn receive(&self, buf: &mut [u8], source: Rank, tag: Tag) -> Result<()> {
        self.check_rank(source)?;
        // Truncation is fatal under the default MPI error handler.
        let _status = self
            .world
            .process_at_rank(source)
            .receive_into_with_tag(buf, tag);
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        self.world.barrier();
        Ok(())
    }

    fn broadcast(&self, buf: &mut [u8], root: Rank) -> Result<()> {
        self.check_rank(root)?;
        self.world.process_at_rank(root).broadcast_into(buf);
        Ok(())
    }

    fn reduce(&self, value: f64, op: ReduceOp, root: Rank) -> Result<Option<f64>> {
        self.check_rank(root)?;
        let op = match op {
            ReduceOp::Min => SystemOperation::min(),
            ReduceOp::Max => SystemOperation::max(),
            ReduceOp::Sum => SystemOperation::sum(),
        };
        let root_process = self.world.process_at_rank(root);
        if self.world.rank() == root {
            let mut result = 0.0f64;
            root_process.reduce_into_root(&value, &mut result, op);
            Ok(Some(result))
        } else {
            root_process.reduce_into(&value, op);
            Ok(None)
        }
    }

    fn abort(&self, code: i32) -> ! {
        debug!("aborting MPI_COMM_WORLD with code {}", code);
        self.world.abort(code)
    }
}
