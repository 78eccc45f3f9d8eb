//! Trait seams for the hardware accelerators and asset producers the
//! pipeline drives.
//!
//! The engine never talks to a device directly. It dispatches dewarp work
//! through [`WarpUnit`], composition jobs through [`BlendUnit`], and obtains
//! remap tables, alpha masks and the vehicle overlay through [`MeshMapper`],
//! [`AlphaSource`] and [`VehicleRenderer`]. CPU reference implementations of
//! all five live in the `halo` facade crate.

use std::path::Path;

use glam::Mat4;
use smallvec::SmallVec;
use thiserror::Error;
use tracing::error;

use halo_core::prelude::{PlaneFormat, PlaneHandle, PlaneId};

/// Errors reported by an accelerator implementation.
#[derive(Debug, Error)]
pub enum UnitError {
    /// The device rejected the submission outright.
    #[error("device rejected job: {0}")]
    Device(String),
    /// The implementation does not support the requested operation.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    /// A submitted job ran and failed with a device status code.
    #[error("job failed with device status {0}")]
    JobFailed(i32),
}

/// One warp channel of the dewarp unit.
///
/// Camera lanes are indexed by capture order (0 = left, 1 = right, 2 = front,
/// 3 = rear); alpha lanes by alpha plane index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WarpLane {
    Camera(usize),
    Alpha(usize),
}

/// One sample of a remap table: a fractional source coordinate for an
/// integer destination pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshPoint {
    pub src: [f32; 2],
    pub dst: [u32; 2],
}

/// Complete remap table for one warp lane.
#[derive(Debug, Clone)]
pub struct WarpMap {
    pub lane: WarpLane,
    pub points: Vec<MeshPoint>,
}

/// Dewarp accelerator.
///
/// `warp` is synchronous: the destination chunk is fully written when it
/// returns. Remap tables are loaded per lane with `load_map` and stay in
/// effect until replaced.
pub trait WarpUnit: Send + Sync {
    /// Announce a plane's format and pool depth before any dispatch.
    ///
    /// Called once per pool during pipeline setup so the implementation can
    /// size its own descriptors.
    fn bind(&self, plane: PlaneId, format: PlaneFormat, depth: usize) -> Result<(), UnitError>;

    /// Install a remap table for `map.lane`, replacing the previous one.
    fn load_map(&self, map: WarpMap) -> Result<(), UnitError>;

    /// Warp `src` into `dst` using the lane's current remap table.
    fn warp(&self, lane: WarpLane, src: &PlaneHandle, dst: &PlaneHandle) -> Result<(), UnitError>;
}

/// Identifier assigned to each blend submission.
pub type JobId = u64;

/// One composition job for the blend unit.
#[derive(Debug, Clone)]
pub struct BlendJob {
    pub id: JobId,
    /// Output sequence number of the frame this job produces.
    pub sequence: u64,
    /// Source planes in layer order: physical camera pairs, alpha, car.
    pub sources: SmallVec<[PlaneHandle; 8]>,
    pub output: PlaneHandle,
}

/// One-shot completion callback handed to the blend unit with each job.
///
/// The unit must fire it exactly once, from whichever thread observes the
/// job finish. Dropping it unfired is reported as a lost job.
pub struct BlendDone {
    inner: Option<Box<dyn FnOnce(Result<(), UnitError>) + Send>>,
}

impl BlendDone {
    pub fn new(f: impl FnOnce(Result<(), UnitError>) + Send + 'static) -> Self {
        Self {
            inner: Some(Box::new(f)),
        }
    }

    /// Report the job outcome. Consumes the callback.
    pub fn complete(mut self, result: Result<(), UnitError>) {
        if let Some(f) = self.inner.take() {
            f(result);
        }
    }
}

impl Drop for BlendDone {
    fn drop(&mut self) {
        if self.inner.is_some() {
            error!("blend completion dropped without firing; job is lost");
        }
    }
}

impl std::fmt::Debug for BlendDone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlendDone")
            .field("fired", &self.inner.is_none())
            .finish()
    }
}

/// Composition accelerator.
///
/// Submission is asynchronous: `submit` queues the job and returns; the unit
/// fires `done` when the frame is written. The engine keeps at most one job
/// in flight, so implementations may also complete inline before `submit`
/// returns.
pub trait BlendUnit: Send + Sync {
    fn submit(&self, job: BlendJob, done: BlendDone) -> Result<(), UnitError>;
}

/// Produces remap tables for a viewpoint.
pub trait MeshMapper: Send + Sync {
    /// Project the surround mesh for `lane` under `view` into a remap table
    /// for a destination plane of `format`.
    fn remap(&self, view: &Mat4, lane: WarpLane, format: PlaneFormat)
    -> Result<WarpMap, UnitError>;
}

/// Renders the vehicle overlay for a viewpoint.
pub trait VehicleRenderer: Send + Sync {
    /// Draw the vehicle into `dst` as seen under `view`. `image` optionally
    /// selects an on-disk sprite to use instead of the built-in model.
    fn render(&self, view: &Mat4, image: Option<&Path>, dst: &PlaneHandle)
    -> Result<(), UnitError>;
}

/// Supplies raw (pre-warp) alpha masks.
pub trait AlphaSource: Send + Sync {
    /// Produce the raw mask for `lane` under `view`. The returned handle is
    /// only borrowed for the warm-up warp and dropped afterwards.
    fn mask(&self, lane: usize, view: &Mat4) -> Result<PlaneHandle, UnitError>;
}
