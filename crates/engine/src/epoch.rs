//! Epoch bookkeeping for atomic viewpoint updates.
//!
//! A viewpoint update opens an *epoch* pinned to the input sequence counter
//! at request time. Cycles already admitted keep composing with the old
//! projection and old alpha/car buffers; the cycle carrying the epoch
//! sequence is the first to use the new ones. Buffers produced for the new
//! view are held here until the output counter catches up to the epoch
//! sequence; only then does the commit release them into the barrier, once
//! per cycle that was admitted speculatively while the update ran plus the
//! circulating reserve entry.

use smallvec::SmallVec;

use halo_core::prelude::PlaneHandle;

use crate::barrier::ComposeBatch;
use crate::units::JobId;
use crate::view::ViewPose;

/// Commands delivered to the remap and vehicle worker threads.
pub(crate) enum WorkerCommand {
    Reconfigure { pose: ViewPose, epoch: u64 },
    Terminate,
}

/// A viewpoint update that has been requested but not yet committed.
pub(crate) struct PendingEpoch {
    /// Input sequence pinned at request time; first cycle on the new view.
    pub last_update: u64,
    /// Alpha planes produced by the remap worker for this epoch.
    pub new_alpha: SmallVec<[PlaneHandle; 4]>,
    /// Car plane produced by the vehicle worker for this epoch.
    pub new_car: Option<PlaneHandle>,
    /// Previous generation, kept only so an aborted update can restore it.
    pub old_alpha: SmallVec<[PlaneHandle; 4]>,
    pub old_car: Option<PlaneHandle>,
}

impl PendingEpoch {
    /// Both workers have delivered their buffers.
    pub fn produced(&self, alpha_planes: usize) -> bool {
        self.new_alpha.len() == alpha_planes && self.new_car.is_some()
    }
}

/// The blend job currently owned by the hardware.
pub(crate) struct InFlight {
    pub job: JobId,
    pub sequence: u64,
    pub timestamp: u64,
    pub batch: ComposeBatch,
}

/// Everything the completion path mutates, behind one lock so epoch commit
/// and output recycling cannot interleave.
#[derive(Default)]
pub(crate) struct CommitState {
    pub pending: Option<PendingEpoch>,
    pub in_flight: Option<InFlight>,
    /// Output plane parked for the next completion's swap.
    pub spare_output: Option<PlaneHandle>,
    /// Buffers the commit-time flush resubmits. Emptied while an epoch is
    /// pending so old generations drain out of circulation.
    pub active_alpha: SmallVec<[PlaneHandle; 4]>,
    pub active_car: Option<PlaneHandle>,
}
