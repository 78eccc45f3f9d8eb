//! Warp dispatch: drives the dewarp unit for camera and alpha lanes.
//!
//! The stage owns the destination pools. The four logical cameras dewarp
//! into two physical planes (left/right share one, front/rear the other);
//! the first camera of a pair to dispatch in a cycle leases and clears the
//! pair's destination for that sequence, the second reuses it. Alpha planes
//! are leased per warm-up and always cleared.
//!
//! Remap tables from a pending viewpoint update are installed lazily: a map
//! staged for epoch `e` is loaded into the unit the first time its camera
//! dispatches a cycle with sequence >= `e`, which keeps earlier in-flight
//! cycles on the previous projection.

use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace};

use halo_core::prelude::{ChunkAllocator, PlaneHandle, PlaneId, PlanePool};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::units::{WarpLane, WarpMap, WarpUnit};

struct PendingMap {
    map: WarpMap,
    epoch: u64,
}

#[derive(Default)]
struct PairState {
    /// Sequence the current destination was cleared for, and the handle.
    current: Option<(u64, PlaneHandle)>,
}

pub(crate) struct WarpStage {
    unit: Arc<dyn WarpUnit>,
    camera_pools: [PlanePool; 2],
    alpha_pools: SmallVec<[PlanePool; 4]>,
    pairs: [Mutex<PairState>; 2],
    pending: Mutex<[Option<PendingMap>; 4]>,
}

impl WarpStage {
    pub(crate) fn new(
        unit: Arc<dyn WarpUnit>,
        allocator: &dyn ChunkAllocator,
        config: &EngineConfig,
    ) -> Result<Self, EngineError> {
        let depth = config.pool_depth;
        let camera_pools = [
            PlanePool::allocate(allocator, PlaneId::CameraLeft, config.camera_format, depth)?,
            PlanePool::allocate(allocator, PlaneId::CameraFront, config.camera_format, depth)?,
        ];
        let mut alpha_pools = SmallVec::new();
        for lane in 0..config.alpha_layout.planes() {
            let plane = PlaneId::alpha(lane)
                .ok_or(EngineError::InvariantViolation("alpha lane out of range"))?;
            alpha_pools.push(PlanePool::allocate(
                allocator,
                plane,
                config.alpha_format,
                depth,
            )?);
        }
        for pool in camera_pools.iter().chain(alpha_pools.iter()) {
            unit.bind(pool.plane(), pool.format(), pool.depth())?;
        }
        Ok(Self {
            unit,
            camera_pools,
            alpha_pools,
            pairs: [Mutex::default(), Mutex::default()],
            pending: Mutex::new([None, None, None, None]),
        })
    }

    /// Load a remap table into the unit immediately (initial warm-up).
    pub(crate) fn load_map(&self, map: WarpMap) -> Result<(), EngineError> {
        self.unit.load_map(map)?;
        Ok(())
    }

    /// Stage a remap table to take effect from `epoch` onward, replacing any
    /// table already staged for this camera.
    pub(crate) fn stage_map(&self, camera: usize, map: WarpMap, epoch: u64) {
        debug!(camera, epoch, points = map.points.len(), "remap table staged");
        self.pending.lock()[camera] = Some(PendingMap { map, epoch });
    }

    /// Discard all staged remap tables (aborted viewpoint update).
    pub(crate) fn discard_staged(&self) {
        *self.pending.lock() = [None, None, None, None];
    }

    /// Dewarp one camera frame for the cycle `sequence`. Returns the shared
    /// physical destination handle for the camera's pair.
    pub(crate) fn dispatch_camera(
        &self,
        camera: usize,
        src: &PlaneHandle,
        sequence: u64,
    ) -> Result<PlaneHandle, EngineError> {
        let pair = PlaneId::camera(camera)
            .and_then(|p| p.pair())
            .ok_or(EngineError::InvalidCamera(camera))?;
        {
            let mut pending = self.pending.lock();
            if let Some(staged) = &pending[camera]
                && sequence >= staged.epoch
            {
                let staged = pending[camera].take().ok_or(EngineError::InvariantViolation(
                    "staged map vanished under lock",
                ))?;
                self.unit.load_map(staged.map)?;
                debug!(camera, sequence, "remap table loaded");
            }
        }
        let dst = {
            let mut state = self.pairs[pair.index()].lock();
            match &state.current {
                Some((seq, handle)) if *seq == sequence => handle.clone(),
                _ => {
                    let handle = self.camera_pools[pair.index()].lease()?;
                    handle.fill(0);
                    state.current = Some((sequence, handle.clone()));
                    handle
                }
            }
        };
        trace!(camera, sequence, "camera warp dispatched");
        self.unit.warp(WarpLane::Camera(camera), src, &dst)?;
        Ok(dst)
    }

    /// Dewarp one alpha mask, optionally loading a fresh remap table first.
    pub(crate) fn dispatch_alpha(
        &self,
        lane: usize,
        src: &PlaneHandle,
        map: Option<WarpMap>,
    ) -> Result<PlaneHandle, EngineError> {
        let pool = self
            .alpha_pools
            .get(lane)
            .ok_or(EngineError::InvariantViolation("alpha lane out of range"))?;
        if let Some(map) = map {
            self.unit.load_map(map)?;
        }
        let dst = pool.lease()?;
        dst.fill(0);
        self.unit.warp(WarpLane::Alpha(lane), src, &dst)?;
        Ok(dst)
    }

    #[cfg(test)]
    pub(crate) fn staged(&self, camera: usize) -> bool {
        self.pending.lock()[camera].is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::UnitError;
    use halo_core::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingUnit {
        maps_loaded: AtomicUsize,
        warps: AtomicUsize,
    }

    impl WarpUnit for CountingUnit {
        fn bind(&self, _: PlaneId, _: PlaneFormat, _: usize) -> Result<(), UnitError> {
            Ok(())
        }

        fn load_map(&self, _: WarpMap) -> Result<(), UnitError> {
            self.maps_loaded.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn warp(&self, _: WarpLane, _: &PlaneHandle, dst: &PlaneHandle) -> Result<(), UnitError> {
            self.warps.fetch_add(1, Ordering::Relaxed);
            dst.fill(0xab);
            Ok(())
        }
    }

    fn source_pool() -> PlanePool {
        let config = EngineConfig::default();
        PlanePool::allocate(&HeapChunks, PlaneId::CameraLeft, config.camera_format, 8).unwrap()
    }

    fn stage() -> (Arc<CountingUnit>, WarpStage) {
        let unit = Arc::new(CountingUnit::default());
        let stage = WarpStage::new(unit.clone(), &HeapChunks, &EngineConfig::default()).unwrap();
        (unit, stage)
    }

    fn map_for(camera: usize) -> WarpMap {
        WarpMap {
            lane: WarpLane::Camera(camera),
            points: vec![],
        }
    }

    #[test]
    fn pair_members_share_one_destination_per_cycle() {
        let (_, stage) = stage();
        let src = source_pool().lease().unwrap();
        let left = stage.dispatch_camera(0, &src, 7).unwrap();
        let right = stage.dispatch_camera(1, &src, 7).unwrap();
        assert!(left.shares_chunk(&right));
        let front = stage.dispatch_camera(2, &src, 7).unwrap();
        assert!(!left.shares_chunk(&front));
        // A new sequence rotates to the other generation.
        let left_next = stage.dispatch_camera(0, &src, 8).unwrap();
        assert!(!left.shares_chunk(&left_next));
    }

    #[test]
    fn staged_map_waits_for_its_epoch() {
        let (unit, stage) = stage();
        let src = source_pool().lease().unwrap();
        stage.stage_map(0, map_for(0), 5);
        stage.dispatch_camera(0, &src, 4).unwrap();
        assert_eq!(unit.maps_loaded.load(Ordering::Relaxed), 0);
        assert!(stage.staged(0));
        stage.dispatch_camera(0, &src, 5).unwrap();
        assert_eq!(unit.maps_loaded.load(Ordering::Relaxed), 1);
        assert!(!stage.staged(0));
        // Consumed once; later cycles do not reload.
        stage.dispatch_camera(0, &src, 6).unwrap();
        assert_eq!(unit.maps_loaded.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn restaging_replaces_previous_map() {
        let (unit, stage) = stage();
        let src = source_pool().lease().unwrap();
        stage.stage_map(0, map_for(0), 5);
        stage.stage_map(0, map_for(0), 9);
        stage.dispatch_camera(0, &src, 6).unwrap();
        assert_eq!(unit.maps_loaded.load(Ordering::Relaxed), 0);
        stage.dispatch_camera(0, &src, 9).unwrap();
        assert_eq!(unit.maps_loaded.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn discard_staged_drops_all_tables() {
        let (unit, stage) = stage();
        let src = source_pool().lease().unwrap();
        for camera in 0..4 {
            stage.stage_map(camera, map_for(camera), 1);
        }
        stage.discard_staged();
        for camera in 0..4 {
            stage.dispatch_camera(camera, &src, 10).unwrap();
        }
        assert_eq!(unit.maps_loaded.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn alpha_dispatch_loads_map_and_clears() {
        let (unit, stage) = stage();
        let config = EngineConfig::default();
        let src_pool =
            PlanePool::allocate(&HeapChunks, PlaneId::AlphaLeft, config.alpha_format, 2).unwrap();
        let src = src_pool.lease().unwrap();
        let dst = stage
            .dispatch_alpha(
                0,
                &src,
                Some(WarpMap {
                    lane: WarpLane::Alpha(0),
                    points: vec![],
                }),
            )
            .unwrap();
        assert_eq!(unit.maps_loaded.load(Ordering::Relaxed), 1);
        dst.read(|data| assert!(data.iter().all(|b| *b == 0xab)));
        assert!(matches!(
            stage.dispatch_alpha(4, &src, None),
            Err(EngineError::InvariantViolation(_))
        ));
    }
}
