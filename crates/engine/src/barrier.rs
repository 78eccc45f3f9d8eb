//! Readiness barrier gating compositor submission.
//!
//! Every plane the blend unit consumes has a slot here. Producers push
//! finished buffers into per-slot FIFO queues; when every slot holds at
//! least one buffer and no job is in flight, the barrier pops one buffer
//! per slot and hands the batch to the caller for submission. A slot whose
//! queue still holds entries after the pop stays marked ready, so a
//! backlogged producer immediately counts toward the next frame.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use halo_core::prelude::PlaneHandle;

use crate::config::AlphaLayout;
use crate::error::EngineError;

/// Maps plane roles to barrier slot indices for a given alpha layout.
///
/// Slots are laid out as: four logical cameras, then the alpha planes, then
/// car, then output. Logical camera slots are kept separate even though
/// pairs share a physical chunk; that lets the barrier cross-check that both
/// members of a pair arrived from the same dewarp generation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotMap {
    alpha_planes: usize,
}

impl SlotMap {
    pub(crate) fn new(layout: AlphaLayout) -> Self {
        Self {
            alpha_planes: layout.planes(),
        }
    }

    pub(crate) fn camera(&self, index: usize) -> usize {
        debug_assert!(index < 4);
        index
    }

    pub(crate) fn alpha(&self, lane: usize) -> usize {
        debug_assert!(lane < self.alpha_planes);
        4 + lane
    }

    pub(crate) fn car(&self) -> usize {
        4 + self.alpha_planes
    }

    pub(crate) fn output(&self) -> usize {
        5 + self.alpha_planes
    }

    pub(crate) fn count(&self) -> usize {
        6 + self.alpha_planes
    }

    pub(crate) fn alpha_planes(&self) -> usize {
        self.alpha_planes
    }
}

/// One buffer per slot, popped atomically once the barrier fires.
#[derive(Debug, Clone)]
pub(crate) struct ComposeBatch {
    /// Logical camera entries in capture order. Pairs reference the same
    /// physical chunk.
    pub cameras: SmallVec<[PlaneHandle; 4]>,
    pub alpha: SmallVec<[PlaneHandle; 4]>,
    pub car: PlaneHandle,
    pub output: PlaneHandle,
}

impl ComposeBatch {
    /// Source planes in blend layer order: one entry per physical camera
    /// pair, then alpha, then car.
    pub(crate) fn sources(&self) -> SmallVec<[PlaneHandle; 8]> {
        let mut sources = SmallVec::new();
        sources.push(self.cameras[0].clone());
        sources.push(self.cameras[2].clone());
        sources.extend(self.alpha.iter().cloned());
        sources.push(self.car.clone());
        sources
    }
}

struct BarrierState {
    queues: Vec<VecDeque<PlaneHandle>>,
    filled: Vec<bool>,
    /// Slots still waiting for their first buffer.
    remaining: usize,
    /// A popped batch has been handed out and not yet completed.
    busy: bool,
}

/// The barrier itself. All transitions happen under one internal lock;
/// callers submit the returned batch to the blend unit after the lock is
/// released.
pub(crate) struct Barrier {
    map: SlotMap,
    state: Mutex<BarrierState>,
    idle: Condvar,
}

impl Barrier {
    pub(crate) fn new(map: SlotMap) -> Self {
        let count = map.count();
        Self {
            map,
            state: Mutex::new(BarrierState {
                queues: (0..count).map(|_| VecDeque::new()).collect(),
                filled: vec![false; count],
                remaining: count,
                busy: false,
            }),
            idle: Condvar::new(),
        }
    }

    pub(crate) fn slots(&self) -> &SlotMap {
        &self.map
    }

    /// Queue a finished buffer into `slot`. Returns a batch when this push
    /// makes every slot ready and no job is in flight; the caller owns its
    /// submission.
    pub(crate) fn submit(
        &self,
        slot: usize,
        handle: PlaneHandle,
    ) -> Result<Option<ComposeBatch>, EngineError> {
        let mut state = self.state.lock();
        state.queues[slot].push_back(handle);
        if !state.filled[slot] {
            state.filled[slot] = true;
            state.remaining -= 1;
        }
        if state.remaining == 0 && !state.busy {
            let batch = self.take_batch(&mut state)?;
            state.busy = true;
            return Ok(Some(batch));
        }
        Ok(None)
    }

    /// Mark the in-flight job finished. Returns the next batch if the
    /// backlog already satisfies every slot.
    pub(crate) fn complete(&self) -> Result<Option<ComposeBatch>, EngineError> {
        let mut state = self.state.lock();
        debug_assert!(state.busy, "complete without a job in flight");
        state.busy = false;
        self.idle.notify_all();
        if state.remaining == 0 {
            let batch = self.take_batch(&mut state)?;
            state.busy = true;
            return Ok(Some(batch));
        }
        Ok(None)
    }

    /// Whether a popped batch is outstanding.
    pub(crate) fn is_busy(&self) -> bool {
        self.state.lock().busy
    }

    /// Number of entries queued in `slot`.
    pub(crate) fn queued(&self, slot: usize) -> usize {
        self.state.lock().queues[slot].len()
    }

    /// Trim a slot's queue from the back to at most `keep` entries.
    /// Dropped handles return to their pools.
    pub(crate) fn truncate(&self, slot: usize, keep: usize) {
        let mut state = self.state.lock();
        while state.queues[slot].len() > keep {
            state.queues[slot].pop_back();
        }
        if state.queues[slot].is_empty() && state.filled[slot] {
            state.filled[slot] = false;
            state.remaining += 1;
        }
    }

    /// Block until no job is in flight, up to `timeout`.
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.busy {
            if self.idle.wait_until(&mut state, deadline).timed_out() {
                return !state.busy;
            }
        }
        true
    }

    fn take_batch(&self, state: &mut BarrierState) -> Result<ComposeBatch, EngineError> {
        debug_assert_eq!(state.remaining, 0);
        let mut popped: SmallVec<[PlaneHandle; 10]> = SmallVec::new();
        for slot in 0..self.map.count() {
            let handle = state.queues[slot]
                .pop_front()
                .ok_or(EngineError::InvariantViolation("ready slot with empty queue"))?;
            if state.queues[slot].is_empty() {
                state.filled[slot] = false;
                state.remaining += 1;
            }
            popped.push(handle);
        }
        // Both members of a pair must come from the same dewarp generation;
        // a split pair means warp dispatch and admission got out of step.
        if !popped[0].shares_chunk(&popped[1]) || !popped[2].shares_chunk(&popped[3]) {
            return Err(EngineError::InvariantViolation(
                "camera pair split across chunk generations",
            ));
        }
        let mut drain = popped.into_iter();
        let cameras: SmallVec<[PlaneHandle; 4]> = drain.by_ref().take(4).collect();
        let alpha: SmallVec<[PlaneHandle; 4]> =
            drain.by_ref().take(self.map.alpha_planes()).collect();
        let car = drain
            .next()
            .ok_or(EngineError::InvariantViolation("missing car plane"))?;
        let output = drain
            .next()
            .ok_or(EngineError::InvariantViolation("missing output plane"))?;
        Ok(ComposeBatch {
            cameras,
            alpha,
            car,
            output,
        })
    }
}
