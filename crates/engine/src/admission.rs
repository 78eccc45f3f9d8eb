//! Buffer admission: collects per-camera submissions into complete cycles.
//!
//! A cycle is one frame from each of the four cameras. Buffers queue per
//! camera in arrival order; as soon as every camera has at least one queued
//! frame, the oldest frame of each is popped, the cycle claims the next
//! input sequence number, and the dispatch callback runs while the admission
//! lock is held so cycles reach the warp stage in sequence order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::trace;

use halo_core::prelude::{PlaneHandle, Resolution, SequenceCounters};

use crate::error::EngineError;

const CAMERAS: usize = 4;

/// One complete admitted cycle, ready for warp dispatch.
#[derive(Debug)]
pub(crate) struct AdmittedCycle {
    pub sequence: u64,
    /// Latest capture timestamp among the four frames.
    pub timestamp: u64,
    /// Raw camera frames in capture order.
    pub frames: SmallVec<[PlaneHandle; 4]>,
}

struct AdmissionState {
    pending: [VecDeque<(PlaneHandle, u64)>; CAMERAS],
}

impl AdmissionState {
    fn pop_cycle(&mut self, seq: &SequenceCounters) -> Option<AdmittedCycle> {
        if self.pending.iter().any(|q| q.is_empty()) {
            return None;
        }
        let mut frames = SmallVec::new();
        let mut timestamp = 0;
        for queue in &mut self.pending {
            let (frame, ts) = queue.pop_front()?;
            timestamp = timestamp.max(ts);
            frames.push(frame);
        }
        Some(AdmittedCycle {
            sequence: seq.next_input(),
            timestamp,
            frames,
        })
    }
}

/// Front gate of the pipeline.
///
/// While frozen (a viewpoint update is reprojecting the warp meshes),
/// buffers still queue but no cycle is released; `drain` flushes the
/// backlog once the freeze lifts.
pub(crate) struct AdmissionController {
    expected: Resolution,
    frozen: AtomicBool,
    state: Mutex<AdmissionState>,
}

impl AdmissionController {
    pub(crate) fn new(expected: Resolution) -> Self {
        Self {
            expected,
            frozen: AtomicBool::new(false),
            state: Mutex::new(AdmissionState {
                pending: std::array::from_fn(|_| VecDeque::new()),
            }),
        }
    }

    /// Queue one camera frame. Completed cycles are handed to `dispatch`
    /// under the admission lock, preserving sequence order across callers.
    pub(crate) fn submit(
        &self,
        camera: usize,
        frame: PlaneHandle,
        timestamp: u64,
        seq: &SequenceCounters,
        mut dispatch: impl FnMut(AdmittedCycle) -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        if camera >= CAMERAS {
            return Err(EngineError::InvalidCamera(camera));
        }
        let got = frame.format().resolution;
        if got != self.expected {
            return Err(EngineError::GeometryMismatch {
                expected: self.expected,
                got,
            });
        }
        let mut state = self.state.lock();
        state.pending[camera].push_back((frame, timestamp));
        trace!(camera, timestamp, "camera frame queued");
        if self.frozen.load(Ordering::Acquire) {
            return Ok(());
        }
        while let Some(cycle) = state.pop_cycle(seq) {
            dispatch(cycle)?;
        }
        Ok(())
    }

    /// Release cycles buffered while frozen.
    pub(crate) fn drain(
        &self,
        seq: &SequenceCounters,
        mut dispatch: impl FnMut(AdmittedCycle) -> Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if self.frozen.load(Ordering::Acquire) {
            return Ok(());
        }
        while let Some(cycle) = state.pop_cycle(seq) {
            dispatch(cycle)?;
        }
        Ok(())
    }

    pub(crate) fn set_frozen(&self, frozen: bool) {
        self.frozen.store(frozen, Ordering::Release);
    }

    /// Freeze while holding the admission lock, so no cycle is mid-dispatch
    /// when this returns and the input counter is stable afterwards.
    pub(crate) fn freeze_sync(&self) {
        let _state = self.state.lock();
        self.frozen.store(true, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn queued(&self, camera: usize) -> usize {
        self.state.lock().pending[camera].len()
    }
}
