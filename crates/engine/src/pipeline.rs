//! Pipeline orchestration: wires admission, warp dispatch, the readiness
//! barrier and the compositor together, and owns the two worker threads
//! that reproject the scene when the viewpoint changes.
//!
//! Composed output planes are recycled with a spare swap: one plane rides
//! each blend job, one is parked, and every completion parks the finished
//! plane and queues the previously parked one for the next job. Alpha and
//! car planes circulate by resubmitting the consumed handles at completion,
//! except while a viewpoint update drains the old generation out.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use halo_core::prelude::{
    ChunkAllocator, EngineMetrics, HeapChunks, PlaneHandle, PlaneId, PlanePool, SequenceCounters,
};

use crate::admission::{AdmissionController, AdmittedCycle};
use crate::barrier::{Barrier, ComposeBatch, SlotMap};
use crate::compositor::CompositorStage;
use crate::config::EngineConfig;
use crate::epoch::{CommitState, InFlight, PendingEpoch, WorkerCommand};
use crate::error::EngineError;
use crate::units::{
    AlphaSource, BlendDone, BlendUnit, MeshMapper, UnitError, VehicleRenderer, WarpLane, WarpUnit,
};
use crate::view::ViewPose;
use crate::warp::WarpStage;

/// How long `close` waits for the last blend job to drain.
const CLOSE_DRAIN: Duration = Duration::from_secs(5);

/// A finished surround frame delivered to the sink.
#[derive(Debug, Clone)]
pub struct ComposedFrame {
    /// Output sequence number (0-based, gapless).
    pub sequence: u64,
    /// Capture timestamp of the newest camera frame in the cycle.
    pub timestamp: u64,
    pub output: PlaneHandle,
    /// Physical dewarp planes, populated only when the debug tap is on.
    pub taps: SmallVec<[PlaneHandle; 2]>,
}

/// Consumer of composed frames.
///
/// Callbacks run on whichever thread observes the blend completion; they
/// must not block for long or the pipeline backs up.
pub trait FrameSink: Send + Sync {
    fn on_frame_ready(&self, frame: ComposedFrame);

    fn on_compose_error(&self, sequence: u64, error: &EngineError) {
        let _ = (sequence, error);
    }
}

struct Shared {
    config: EngineConfig,
    counters: SequenceCounters,
    metrics: EngineMetrics,
    admission: AdmissionController,
    warp: WarpStage,
    barrier: Barrier,
    compositor: CompositorStage,
    commit: Mutex<CommitState>,
    car_pool: PlanePool,
    output_pool: PlanePool,
    mapper: Arc<dyn MeshMapper>,
    vehicle: Arc<dyn VehicleRenderer>,
    alpha_source: Arc<dyn AlphaSource>,
    sink: Arc<dyn FrameSink>,
    remap_tx: Sender<WorkerCommand>,
    vehicle_tx: Sender<WorkerCommand>,
    workers: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
    closing: AtomicBool,
    last_timestamp: AtomicU64,
}

impl Shared {
    /// Warp the four camera frames of an admitted cycle and feed the
    /// barrier. Runs under the admission lock so cycles stay in order.
    fn run_cycle(self: &Arc<Self>, cycle: AdmittedCycle) -> Result<(), EngineError> {
        self.metrics.cycle_admitted();
        self.last_timestamp
            .store(cycle.timestamp, Ordering::Relaxed);
        let map = *self.barrier.slots();
        // Warp all four cameras before feeding the barrier: a failed
        // dispatch must not leave a partial cycle queued, or every later
        // batch would pair one cycle's left/right chunk with the next
        // cycle's front/rear.
        let mut warped: SmallVec<[PlaneHandle; 4]> = SmallVec::new();
        for (camera, frame) in cycle.frames.iter().enumerate() {
            warped.push(self.warp.dispatch_camera(camera, frame, cycle.sequence)?);
        }
        for (camera, dst) in warped.into_iter().enumerate() {
            if let Some(batch) = self.barrier.submit(map.camera(camera), dst)? {
                self.launch(batch);
            }
        }
        Ok(())
    }

    /// Hand a popped batch to the blend unit. Completion may fire inline.
    fn launch(self: &Arc<Self>, batch: ComposeBatch) {
        let sequence = self.counters.output();
        let timestamp = self.last_timestamp.load(Ordering::Relaxed);
        {
            let mut commit = self.commit.lock();
            debug_assert!(commit.in_flight.is_none(), "two jobs in flight");
            commit.in_flight = Some(InFlight {
                job: 0,
                sequence,
                timestamp,
                batch: batch.clone(),
            });
        }
        let weak = Arc::downgrade(self);
        let done = BlendDone::new(move |result| {
            if let Some(shared) = Weak::upgrade(&weak) {
                shared.handle_completion(result);
            }
        });
        match self.compositor.submit(sequence, &batch, done) {
            Ok(id) => {
                let mut commit = self.commit.lock();
                if let Some(in_flight) = &mut commit.in_flight
                    && in_flight.sequence == sequence
                {
                    in_flight.job = id;
                }
            }
            Err(error) => {
                // The job never reached the unit; retire it here so the
                // output counter stays gapless.
                let fin = {
                    let mut commit = self.commit.lock();
                    match &commit.in_flight {
                        Some(in_flight) if in_flight.sequence == sequence => {
                            commit.in_flight.take()
                        }
                        _ => None,
                    }
                };
                if let Some(fin) = fin {
                    self.finish_job(fin, Err(error));
                }
            }
        }
    }

    fn handle_completion(self: &Arc<Self>, result: Result<(), UnitError>) {
        let fin = self.commit.lock().in_flight.take();
        let Some(fin) = fin else {
            warn!("blend completion with no job in flight");
            return;
        };
        self.finish_job(fin, result.map_err(EngineError::from));
    }

    /// Retire one blend job: deliver or report it, recycle its output via
    /// the spare swap, recirculate or drop its alpha/car planes, commit a
    /// pending viewpoint epoch when the output counter reaches it, and
    /// launch the next batch if the barrier is already satisfied.
    fn finish_job(self: &Arc<Self>, fin: InFlight, result: Result<(), EngineError>) {
        let seq_out = self.counters.advance_output();
        debug_assert_eq!(seq_out, fin.sequence + 1);
        match result {
            Ok(()) => {
                self.metrics.frame_composed();
                let taps = if self.config.debug_tap {
                    let mut taps = SmallVec::new();
                    taps.push(fin.batch.cameras[0].clone());
                    taps.push(fin.batch.cameras[2].clone());
                    taps
                } else {
                    SmallVec::new()
                };
                self.sink.on_frame_ready(ComposedFrame {
                    sequence: fin.sequence,
                    timestamp: fin.timestamp,
                    output: fin.batch.output.clone(),
                    taps,
                });
            }
            Err(error) => {
                self.metrics.compose_error();
                warn!(
                    sequence = fin.sequence,
                    code = error.code(),
                    error = %error,
                    "composition failed"
                );
                self.sink.on_compose_error(fin.sequence, &error);
            }
        }
        let map = *self.barrier.slots();
        let mut resubmits: SmallVec<[(usize, PlaneHandle); 8]> = SmallVec::new();
        {
            let mut commit = self.commit.lock();
            if let Some(spare) = commit.spare_output.take() {
                resubmits.push((map.output(), spare));
            }
            commit.spare_output = Some(fin.batch.output.clone());
            let epoch_reached = matches!(
                &commit.pending,
                Some(p) if seq_out >= p.last_update
            );
            let epoch_produced = matches!(
                &commit.pending,
                Some(p) if p.produced(map.alpha_planes())
            );
            if epoch_reached {
                // The old generation's last consumer is done; its planes
                // drop with `fin`. Commit now if both workers have
                // delivered, otherwise they will.
                if epoch_produced
                    && let Some(pending) = commit.pending.take()
                {
                    self.latch_and_flush(&mut commit, pending, &map, &mut resubmits);
                }
            } else {
                // Either no update is pending or cycles before the epoch
                // still compose on the old generation; keep it circulating.
                Self::recirculate(&fin.batch, &map, &mut resubmits);
            }
        }
        self.push_resubmits(resubmits);
        match self.barrier.complete() {
            Ok(Some(next)) => self.launch(next),
            Ok(None) => {}
            Err(error) => {
                self.metrics.compose_error();
                warn!(code = error.code(), error = %error, "barrier pop failed");
                self.sink.on_compose_error(seq_out, &error);
            }
        }
    }

    fn recirculate(
        batch: &ComposeBatch,
        map: &SlotMap,
        resubmits: &mut SmallVec<[(usize, PlaneHandle); 8]>,
    ) {
        for (lane, handle) in batch.alpha.iter().enumerate() {
            resubmits.push((map.alpha(lane), handle.clone()));
        }
        resubmits.push((map.car(), batch.car.clone()));
    }

    /// Make the epoch's buffers the active generation and seed the barrier
    /// with them: one entry per cycle admitted while the update was in
    /// progress, plus the circulating entry that replaces the old
    /// generation's.
    fn latch_and_flush(
        &self,
        commit: &mut CommitState,
        pending: PendingEpoch,
        map: &SlotMap,
        resubmits: &mut SmallVec<[(usize, PlaneHandle); 8]>,
    ) {
        let epoch = pending.last_update;
        commit.active_alpha = pending.new_alpha;
        commit.active_car = pending.new_car;
        let flushes = self.counters.input().saturating_sub(epoch);
        for _ in 0..=flushes {
            for (lane, handle) in commit.active_alpha.iter().enumerate() {
                resubmits.push((map.alpha(lane), handle.clone()));
            }
            if let Some(car) = &commit.active_car {
                resubmits.push((map.car(), car.clone()));
            }
        }
        self.metrics.epoch_commit();
        self.metrics.flushes(flushes);
        info!(epoch, flushes, "viewpoint epoch committed");
    }

    fn push_resubmits(self: &Arc<Self>, resubmits: SmallVec<[(usize, PlaneHandle); 8]>) {
        for (slot, handle) in resubmits {
            match self.barrier.submit(slot, handle) {
                Ok(None) => {}
                Ok(Some(batch)) => self.launch(batch),
                Err(error) => {
                    self.metrics.compose_error();
                    warn!(code = error.code(), error = %error, "barrier resubmission failed");
                }
            }
        }
    }

    /// Commit from a worker thread once both buffers are in, covering the
    /// case where the output counter caught up before the workers finished.
    fn commit_if_ready(self: &Arc<Self>) {
        let map = *self.barrier.slots();
        let mut resubmits: SmallVec<[(usize, PlaneHandle); 8]> = SmallVec::new();
        {
            let mut commit = self.commit.lock();
            let ready = matches!(
                &commit.pending,
                Some(p) if p.produced(map.alpha_planes()) && self.counters.output() >= p.last_update
            );
            if !ready {
                return;
            }
            if let Some(pending) = commit.pending.take() {
                self.latch_and_flush(&mut commit, pending, &map, &mut resubmits);
            }
        }
        self.push_resubmits(resubmits);
    }

    /// Unfreeze admission and release any cycles buffered during a freeze.
    fn thaw(self: &Arc<Self>) -> Result<(), EngineError> {
        self.admission.set_frozen(false);
        self.admission
            .drain(&self.counters, |cycle| self.run_cycle(cycle))
    }

    /// Remap worker body: reproject the camera meshes, warm the alpha
    /// planes up for the new view, then let buffered cycles through.
    fn apply_remap(self: &Arc<Self>, pose: &ViewPose, epoch: u64) -> Result<(), EngineError> {
        if !self.epoch_open(epoch) {
            return Ok(());
        }
        let view = pose.matrix();
        for camera in 0..4 {
            let table = self
                .mapper
                .remap(&view, WarpLane::Camera(camera), self.config.camera_format)?;
            self.warp.stage_map(camera, table, epoch);
        }
        let map = *self.barrier.slots();
        for lane in 0..map.alpha_planes() {
            let table = self
                .mapper
                .remap(&view, WarpLane::Alpha(lane), self.config.alpha_format)?;
            let src = self.alpha_source.mask(lane, &view)?;
            let dst = self.warp.dispatch_alpha(lane, &src, Some(table))?;
            // New-generation buffers stay out of the barrier until the
            // commit; cycles before the epoch must keep popping old entries.
            let mut commit = self.commit.lock();
            match &mut commit.pending {
                Some(p) if p.last_update == epoch => p.new_alpha.push(dst),
                _ => {
                    return Err(EngineError::InvariantViolation(
                        "viewpoint update vanished during remap",
                    ));
                }
            }
        }
        self.commit_if_ready();
        self.thaw()
    }

    /// Vehicle worker body: render the overlay for the new view.
    fn apply_vehicle(self: &Arc<Self>, pose: &ViewPose, epoch: u64) -> Result<(), EngineError> {
        if !self.epoch_open(epoch) {
            return Ok(());
        }
        let view = pose.matrix();
        let dst = self.car_pool.lease()?;
        self.vehicle
            .render(&view, pose.vehicle_image.as_deref(), &dst)?;
        {
            let mut commit = self.commit.lock();
            match &mut commit.pending {
                Some(p) if p.last_update == epoch => p.new_car = Some(dst),
                _ => {
                    return Err(EngineError::InvariantViolation(
                        "viewpoint update vanished during vehicle render",
                    ));
                }
            }
        }
        self.commit_if_ready();
        Ok(())
    }

    /// Whether the epoch is still the pending one (false after an abort by
    /// the other worker).
    fn epoch_open(&self, epoch: u64) -> bool {
        matches!(&self.commit.lock().pending, Some(p) if p.last_update == epoch)
    }

    /// Cancel a viewpoint update after a worker failure, restoring the
    /// previous generation so composition continues on the old view.
    fn abort_epoch(self: &Arc<Self>, epoch: u64, error: &EngineError) {
        self.warp.discard_staged();
        let map = *self.barrier.slots();
        let mut resubmits: SmallVec<[(usize, PlaneHandle); 8]> = SmallVec::new();
        let aborted = {
            let mut commit = self.commit.lock();
            let matches_epoch = matches!(
                &commit.pending,
                Some(p) if p.last_update == epoch
            );
            if matches_epoch && let Some(pending) = commit.pending.take() {
                commit.active_alpha = pending.old_alpha;
                commit.active_car = pending.old_car;
                // Top queues back up to the steady-state level: one entry
                // per unfed cycle plus one in reserve.
                let unfed = self
                    .counters
                    .input()
                    .saturating_sub(self.counters.output())
                    .saturating_sub(commit.in_flight.is_some() as u64);
                let supply = commit.in_flight.is_some() as u64;
                for (lane, handle) in commit.active_alpha.iter().enumerate() {
                    let slot = map.alpha(lane);
                    let have = supply + self.barrier.queued(slot) as u64;
                    for _ in 0..(unfed + 1).saturating_sub(have) {
                        resubmits.push((slot, handle.clone()));
                    }
                }
                if let Some(car) = &commit.active_car {
                    let have = supply + self.barrier.queued(map.car()) as u64;
                    for _ in 0..(unfed + 1).saturating_sub(have) {
                        resubmits.push((map.car(), car.clone()));
                    }
                }
                true
            } else {
                false
            }
        };
        if aborted {
            warn!(epoch, code = error.code(), error = %error, "viewpoint update aborted");
            self.sink.on_compose_error(epoch, error);
            self.push_resubmits(resubmits);
        }
        if let Err(error) = self.thaw() {
            warn!(error = %error, "admission drain failed after aborted update");
        }
    }

    /// Initial warm-up, run synchronously before the first cycle: load the
    /// initial remap tables, produce the first alpha/car generation, and
    /// seed the output slots.
    fn warm_up(self: &Arc<Self>) -> Result<(), EngineError> {
        let pose = self.config.initial_pose.clone();
        let view = pose.matrix();
        let map = *self.barrier.slots();
        for camera in 0..4 {
            let table = self
                .mapper
                .remap(&view, WarpLane::Camera(camera), self.config.camera_format)?;
            self.warp.load_map(table)?;
        }
        let mut commit = self.commit.lock();
        for lane in 0..map.alpha_planes() {
            let table = self
                .mapper
                .remap(&view, WarpLane::Alpha(lane), self.config.alpha_format)?;
            let src = self.alpha_source.mask(lane, &view)?;
            let dst = self.warp.dispatch_alpha(lane, &src, Some(table))?;
            commit.active_alpha.push(dst.clone());
            let _ = self.barrier.submit(map.alpha(lane), dst)?;
        }
        let car = self.car_pool.lease()?;
        self.vehicle.render(&view, pose.vehicle_image.as_deref(), &car)?;
        commit.active_car = Some(car.clone());
        let _ = self.barrier.submit(map.car(), car)?;
        let _ = self.barrier.submit(map.output(), self.output_pool.lease()?)?;
        commit.spare_output = Some(self.output_pool.lease()?);
        debug!("pipeline warm-up complete");
        Ok(())
    }

    fn close(self: &Arc<Self>) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some((remap, vehicle)) = self.workers.lock().take() {
            let _ = self.remap_tx.send(WorkerCommand::Terminate);
            let _ = self.vehicle_tx.send(WorkerCommand::Terminate);
            let _ = remap.join();
            let _ = vehicle.join();
        }
        if !self.barrier.wait_idle(CLOSE_DRAIN) {
            warn!("blend job still in flight at close");
        }
        info!(
            cycles = self.metrics.cycles_admitted(),
            frames = self.metrics.frames_composed(),
            "pipeline closed"
        );
    }
}

fn remap_worker(shared: Weak<Shared>, rx: Receiver<WorkerCommand>) {
    while let Ok(command) = rx.recv() {
        match command {
            WorkerCommand::Terminate => break,
            WorkerCommand::Reconfigure { pose, epoch } => {
                let Some(shared) = shared.upgrade() else { break };
                if let Err(error) = shared.apply_remap(&pose, epoch) {
                    shared.abort_epoch(epoch, &error);
                }
            }
        }
    }
}

fn vehicle_worker(shared: Weak<Shared>, rx: Receiver<WorkerCommand>) {
    while let Ok(command) = rx.recv() {
        match command {
            WorkerCommand::Terminate => break,
            WorkerCommand::Reconfigure { pose, epoch } => {
                let Some(shared) = shared.upgrade() else { break };
                if let Err(error) = shared.apply_vehicle(&pose, epoch) {
                    shared.abort_epoch(epoch, &error);
                }
            }
        }
    }
}

/// Assembles a [`Pipeline`] from its collaborators.
///
/// # Example
/// ```rust,ignore
/// let pipeline = PipelineBuilder::new(EngineConfig::default())
///     .with_warp_unit(warp)
///     .with_blend_unit(blend)
///     .with_mesh_mapper(mapper)
///     .with_vehicle_renderer(vehicle)
///     .with_alpha_source(alpha)
///     .with_sink(sink)
///     .start()?;
/// ```
pub struct PipelineBuilder {
    config: EngineConfig,
    allocator: Arc<dyn ChunkAllocator>,
    warp_unit: Option<Arc<dyn WarpUnit>>,
    blend_unit: Option<Arc<dyn BlendUnit>>,
    mapper: Option<Arc<dyn MeshMapper>>,
    vehicle: Option<Arc<dyn VehicleRenderer>>,
    alpha_source: Option<Arc<dyn AlphaSource>>,
    sink: Option<Arc<dyn FrameSink>>,
}

impl PipelineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            allocator: Arc::new(HeapChunks),
            warp_unit: None,
            blend_unit: None,
            mapper: None,
            vehicle: None,
            alpha_source: None,
            sink: None,
        }
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn ChunkAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_warp_unit(mut self, unit: Arc<dyn WarpUnit>) -> Self {
        self.warp_unit = Some(unit);
        self
    }

    pub fn with_blend_unit(mut self, unit: Arc<dyn BlendUnit>) -> Self {
        self.blend_unit = Some(unit);
        self
    }

    pub fn with_mesh_mapper(mut self, mapper: Arc<dyn MeshMapper>) -> Self {
        self.mapper = Some(mapper);
        self
    }

    pub fn with_vehicle_renderer(mut self, vehicle: Arc<dyn VehicleRenderer>) -> Self {
        self.vehicle = Some(vehicle);
        self
    }

    pub fn with_alpha_source(mut self, source: Arc<dyn AlphaSource>) -> Self {
        self.alpha_source = Some(source);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Allocate every pool, run the initial warm-up, and spawn the remap
    /// and vehicle workers. All allocation happens here; the running
    /// pipeline never allocates.
    pub fn start(self) -> Result<Pipeline, EngineError> {
        let config = self.config.sanitized();
        let warp_unit = self.warp_unit.ok_or(EngineError::Misconfigured("warp unit"))?;
        let blend_unit = self
            .blend_unit
            .ok_or(EngineError::Misconfigured("blend unit"))?;
        let mapper = self.mapper.ok_or(EngineError::Misconfigured("mesh mapper"))?;
        let vehicle = self
            .vehicle
            .ok_or(EngineError::Misconfigured("vehicle renderer"))?;
        let alpha_source = self
            .alpha_source
            .ok_or(EngineError::Misconfigured("alpha source"))?;
        let sink = self.sink.ok_or(EngineError::Misconfigured("frame sink"))?;

        let warp = WarpStage::new(warp_unit, self.allocator.as_ref(), &config)?;
        let car_pool = PlanePool::allocate(
            self.allocator.as_ref(),
            PlaneId::Car,
            config.car_format,
            config.pool_depth,
        )?;
        let output_pool = PlanePool::allocate(
            self.allocator.as_ref(),
            PlaneId::Output,
            config.output_format,
            config.pool_depth,
        )?;
        let (remap_tx, remap_rx) = channel();
        let (vehicle_tx, vehicle_rx) = channel();
        let admission = AdmissionController::new(config.camera_format.resolution);
        let barrier = Barrier::new(SlotMap::new(config.alpha_layout));
        let shared = Arc::new(Shared {
            counters: SequenceCounters::default(),
            metrics: EngineMetrics::default(),
            admission,
            warp,
            barrier,
            compositor: CompositorStage::new(blend_unit),
            commit: Mutex::new(CommitState::default()),
            car_pool,
            output_pool,
            mapper,
            vehicle,
            alpha_source,
            sink,
            remap_tx,
            vehicle_tx,
            workers: Mutex::new(None),
            closing: AtomicBool::new(false),
            last_timestamp: AtomicU64::new(0),
            config,
        });
        shared.warm_up()?;

        let weak = Arc::downgrade(&shared);
        let remap = std::thread::Builder::new()
            .name("halo-remap".into())
            .spawn(move || remap_worker(weak, remap_rx))?;
        let weak = Arc::downgrade(&shared);
        let vehicle_thread = match std::thread::Builder::new()
            .name("halo-vehicle".into())
            .spawn(move || vehicle_worker(weak, vehicle_rx))
        {
            Ok(handle) => handle,
            Err(error) => {
                let _ = shared.remap_tx.send(WorkerCommand::Terminate);
                let _ = remap.join();
                return Err(error.into());
            }
        };
        *shared.workers.lock() = Some((remap, vehicle_thread));
        info!(
            cameras = 4,
            alpha_planes = shared.config.alpha_layout.planes(),
            pool_depth = shared.config.pool_depth,
            "pipeline started"
        );
        Ok(Pipeline { shared })
    }
}

/// Handle to a running composition pipeline.
///
/// Clone-free by design: the pipeline closes when this handle is dropped
/// or [`close`](Pipeline::close) is called.
pub struct Pipeline {
    shared: Arc<Shared>,
}

impl Pipeline {
    pub fn builder(config: EngineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Submit one captured camera frame (camera 0..4).
    ///
    /// Admission completes a cycle once every camera has a queued frame;
    /// the cycle is warped and fed to the barrier before this returns.
    pub fn submit_camera_buffer(
        &self,
        camera: usize,
        frame: PlaneHandle,
        timestamp: u64,
    ) -> Result<(), EngineError> {
        if self.shared.closing.load(Ordering::SeqCst) {
            return Err(EngineError::Terminated);
        }
        let shared = &self.shared;
        shared
            .admission
            .submit(camera, frame, timestamp, &shared.counters, |cycle| {
                shared.run_cycle(cycle)
            })
    }

    /// Request a new viewpoint, applied atomically at the next admitted
    /// cycle boundary. Returns `UpdatePending` if a previous request has
    /// not committed yet.
    pub fn set_view(&self, pose: ViewPose) -> Result<(), EngineError> {
        let shared = &self.shared;
        if shared.closing.load(Ordering::SeqCst) {
            return Err(EngineError::Terminated);
        }
        shared.admission.freeze_sync();
        let last_update = shared.counters.input();
        {
            let mut commit = shared.commit.lock();
            if let Some(pending) = &commit.pending {
                // Only unfreeze if the pending epoch's remap already
                // finished; otherwise its worker still owns the freeze and
                // will thaw when it is done.
                let remap_done =
                    pending.new_alpha.len() == shared.barrier.slots().alpha_planes();
                drop(commit);
                if remap_done
                    && let Err(error) = shared.thaw()
                {
                    warn!(error = %error, "admission drain failed after rejected update");
                }
                return Err(EngineError::UpdatePending);
            }
            // Stop the old generation circulating: entries already queued
            // for pre-epoch cycles stay, the rest drain out. The handles
            // move into the pending epoch so an abort can restore them.
            let consumed =
                shared.counters.output() + commit.in_flight.is_some() as u64;
            let keep = last_update.saturating_sub(consumed) as usize;
            let map = *shared.barrier.slots();
            for lane in 0..map.alpha_planes() {
                shared.barrier.truncate(map.alpha(lane), keep);
            }
            shared.barrier.truncate(map.car(), keep);
            let old_alpha = std::mem::take(&mut commit.active_alpha);
            let old_car = commit.active_car.take();
            commit.pending = Some(PendingEpoch {
                last_update,
                new_alpha: SmallVec::new(),
                new_car: None,
                old_alpha,
                old_car,
            });
        }
        debug!(epoch = last_update, "viewpoint update opened");
        let remap_cmd = WorkerCommand::Reconfigure {
            pose: pose.clone(),
            epoch: last_update,
        };
        let vehicle_cmd = WorkerCommand::Reconfigure {
            pose,
            epoch: last_update,
        };
        if shared.remap_tx.send(remap_cmd).is_err() || shared.vehicle_tx.send(vehicle_cmd).is_err()
        {
            shared.abort_epoch(last_update, &EngineError::Terminated);
            return Err(EngineError::Terminated);
        }
        Ok(())
    }

    /// Whether a viewpoint update is still pending.
    pub fn update_pending(&self) -> bool {
        self.shared.commit.lock().pending.is_some()
    }

    /// Snapshot of the pipeline counters.
    pub fn metrics(&self) -> EngineMetrics {
        self.shared.metrics.clone()
    }

    /// `(input, output)` sequence counters: cycles admitted and frames
    /// completed.
    pub fn sequences(&self) -> (u64, u64) {
        (self.shared.counters.input(), self.shared.counters.output())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Stop the workers and wait for the in-flight job to drain.
    pub fn close(self) {
        self.shared.close();
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shared.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlphaLayout;
    use crate::units::{BlendJob, MeshPoint, WarpMap};
    use glam::Mat4;
    use halo_core::prelude::*;
    use parking_lot::Condvar;
    use std::path::Path;
    use std::time::Instant;

    struct CopyWarp;

    impl WarpUnit for CopyWarp {
        fn bind(&self, _: PlaneId, _: PlaneFormat, _: usize) -> Result<(), UnitError> {
            Ok(())
        }

        fn load_map(&self, _: WarpMap) -> Result<(), UnitError> {
            Ok(())
        }

        fn warp(&self, _: WarpLane, src: &PlaneHandle, dst: &PlaneHandle) -> Result<(), UnitError> {
            src.read(|s| {
                dst.write(|d| {
                    let n = s.len().min(d.len());
                    d[..n].copy_from_slice(&s[..n]);
                })
            });
            Ok(())
        }
    }

    struct InlineBlend;

    impl BlendUnit for InlineBlend {
        fn submit(&self, job: BlendJob, done: BlendDone) -> Result<(), UnitError> {
            job.output.fill(0x55);
            done.complete(Ok(()));
            Ok(())
        }
    }

    /// Mesh mapper whose remap calls can be held at a gate, keeping a
    /// viewpoint update pending for as long as a test needs.
    #[derive(Default)]
    struct GateMapper {
        held: Mutex<bool>,
        gate: Condvar,
    }

    impl GateMapper {
        fn hold(&self) {
            *self.held.lock() = true;
        }

        fn release(&self) {
            *self.held.lock() = false;
            self.gate.notify_all();
        }
    }

    impl MeshMapper for GateMapper {
        fn remap(
            &self,
            _: &Mat4,
            lane: WarpLane,
            _: PlaneFormat,
        ) -> Result<WarpMap, UnitError> {
            let mut held = self.held.lock();
            while *held {
                self.gate.wait(&mut held);
            }
            Ok(WarpMap {
                lane,
                points: vec![MeshPoint {
                    src: [0.0, 0.0],
                    dst: [0, 0],
                }],
            })
        }
    }

    struct FlatVehicle;

    impl VehicleRenderer for FlatVehicle {
        fn render(&self, _: &Mat4, _: Option<&Path>, dst: &PlaneHandle) -> Result<(), UnitError> {
            dst.fill(0x22);
            Ok(())
        }
    }

    struct ConstAlpha {
        pool: PlanePool,
    }

    impl ConstAlpha {
        fn new(config: &EngineConfig) -> Self {
            let pool =
                PlanePool::allocate(&HeapChunks, PlaneId::AlphaLeft, config.alpha_format, 8)
                    .unwrap();
            Self { pool }
        }
    }

    impl AlphaSource for ConstAlpha {
        fn mask(&self, _: usize, _: &Mat4) -> Result<PlaneHandle, UnitError> {
            let mask = self
                .pool
                .lease()
                .map_err(|e| UnitError::Device(e.to_string()))?;
            mask.fill(0x80);
            Ok(mask)
        }
    }

    #[derive(Default)]
    struct CollectSink {
        frames: Mutex<Vec<(u64, u64)>>,
        errors: Mutex<Vec<u64>>,
    }

    impl FrameSink for CollectSink {
        fn on_frame_ready(&self, frame: ComposedFrame) {
            frame.output.read(|data| assert_eq!(data[0], 0x55));
            self.frames.lock().push((frame.sequence, frame.timestamp));
        }

        fn on_compose_error(&self, sequence: u64, _: &EngineError) {
            self.errors.lock().push(sequence);
        }
    }

    struct Rig {
        pipeline: Pipeline,
        sink: Arc<CollectSink>,
        mapper: Arc<GateMapper>,
        source: PlanePool,
    }

    fn rig(config: EngineConfig) -> Rig {
        let sink = Arc::new(CollectSink::default());
        let mapper = Arc::new(GateMapper::default());
        let source =
            PlanePool::allocate(&HeapChunks, PlaneId::CameraLeft, config.camera_format, 16)
                .unwrap();
        let pipeline = PipelineBuilder::new(config.clone())
            .with_warp_unit(Arc::new(CopyWarp))
            .with_blend_unit(Arc::new(InlineBlend))
            .with_mesh_mapper(mapper.clone())
            .with_vehicle_renderer(Arc::new(FlatVehicle))
            .with_alpha_source(Arc::new(ConstAlpha::new(&config)))
            .with_sink(sink.clone())
            .start()
            .unwrap();
        Rig {
            pipeline,
            sink,
            mapper,
            source,
        }
    }

    fn small_config() -> EngineConfig {
        let res = Resolution::new(16, 8).unwrap();
        EngineConfig::default()
            .with_camera_format(PlaneFormat::new(FourCc::new(*b"UYVY"), res, 2))
            .with_alpha_format(PlaneFormat::new(FourCc::new(*b"AL08"), res, 1))
            .with_car_format(PlaneFormat::new(FourCc::new(*b"AR24"), res, 4))
            .with_output_format(PlaneFormat::new(FourCc::new(*b"AR24"), res, 4))
    }

    fn submit_cycle(rig: &Rig, timestamp: u64) {
        for camera in 0..4 {
            let frame = rig.source.lease().unwrap();
            rig.pipeline
                .submit_camera_buffer(camera, frame, timestamp)
                .unwrap();
        }
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for pipeline");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn one_cycle_composes_one_frame() {
        let rig = rig(small_config());
        submit_cycle(&rig, 42);
        let frames = rig.sink.frames.lock().clone();
        assert_eq!(frames, vec![(0, 42)]);
        assert_eq!(rig.pipeline.sequences(), (1, 1));
        let metrics = rig.pipeline.metrics();
        assert_eq!(metrics.cycles_admitted(), 1);
        assert_eq!(metrics.frames_composed(), 1);
        assert_eq!(metrics.compose_errors(), 0);
    }

    #[test]
    fn frames_are_delivered_in_sequence_order() {
        let rig = rig(small_config());
        for ts in 0..20 {
            submit_cycle(&rig, ts);
        }
        let frames = rig.sink.frames.lock().clone();
        let sequences: Vec<u64> = frames.iter().map(|(s, _)| *s).collect();
        assert_eq!(sequences, (0..20).collect::<Vec<u64>>());
    }

    #[test]
    fn per_camera_alpha_layout_composes() {
        let rig = rig(small_config().with_alpha_layout(AlphaLayout::PerCamera));
        submit_cycle(&rig, 1);
        assert_eq!(rig.sink.frames.lock().len(), 1);
    }

    #[test]
    fn rejects_invalid_camera_and_geometry() {
        let rig = rig(small_config());
        let frame = rig.source.lease().unwrap();
        let err = rig
            .pipeline
            .submit_camera_buffer(4, frame, 0)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidCamera(4)));
        let odd = PlanePool::allocate(
            &HeapChunks,
            PlaneId::CameraLeft,
            PlaneFormat::new(FourCc::new(*b"UYVY"), Resolution::new(2, 2).unwrap(), 2),
            1,
        )
        .unwrap();
        let err = rig
            .pipeline
            .submit_camera_buffer(0, odd.lease().unwrap(), 0)
            .unwrap_err();
        assert!(matches!(err, EngineError::GeometryMismatch { .. }));
    }

    #[test]
    fn second_view_update_is_rejected_while_pending() {
        let rig = rig(small_config());
        submit_cycle(&rig, 0);
        rig.mapper.hold();
        rig.pipeline.set_view(ViewPose::default()).unwrap();
        let err = rig.pipeline.set_view(ViewPose::default()).unwrap_err();
        assert!(matches!(err, EngineError::UpdatePending));
        rig.mapper.release();
        wait_until(|| !rig.pipeline.update_pending());
        rig.pipeline
            .set_view(ViewPose::new(glam::Vec3::ZERO, 2.0))
            .unwrap();
        wait_until(|| !rig.pipeline.update_pending());
        assert_eq!(rig.pipeline.metrics().epoch_commits(), 2);
    }

    #[test]
    fn idle_view_update_commits_and_composition_continues() {
        let rig = rig(small_config());
        for ts in 0..3 {
            submit_cycle(&rig, ts);
        }
        rig.pipeline
            .set_view(ViewPose::new(glam::Vec3::new(0.1, 0.2, 0.0), 1.5))
            .unwrap();
        wait_until(|| !rig.pipeline.update_pending());
        for ts in 3..6 {
            submit_cycle(&rig, ts);
        }
        wait_until(|| rig.sink.frames.lock().len() == 6);
        assert_eq!(rig.pipeline.metrics().epoch_commits(), 1);
        assert!(rig.sink.errors.lock().is_empty());
    }

    #[test]
    fn buffers_frames_submitted_during_a_held_update() {
        let rig = rig(small_config());
        rig.mapper.hold();
        rig.pipeline.set_view(ViewPose::default()).unwrap();
        // Cycles queue behind the freeze and flow once the update lands.
        submit_cycle(&rig, 7);
        submit_cycle(&rig, 8);
        assert_eq!(rig.pipeline.sequences().0, 0);
        rig.mapper.release();
        wait_until(|| rig.sink.frames.lock().len() == 2);
        assert_eq!(rig.pipeline.sequences(), (2, 2));
    }

    #[test]
    fn submit_after_close_is_terminated() {
        let rig = rig(small_config());
        let frame = rig.source.lease().unwrap();
        // Keep a second handle on the internals so the closed pipeline can
        // still be poked.
        let shared = rig.pipeline.shared.clone();
        rig.pipeline.close();
        let reopened = Pipeline { shared };
        let err = reopened.submit_camera_buffer(0, frame, 0).unwrap_err();
        assert!(matches!(err, EngineError::Terminated));
        assert!(matches!(
            reopened.set_view(ViewPose::default()),
            Err(EngineError::Terminated)
        ));
    }

    /// Warp unit that fails one front-camera dispatch, then copies.
    struct FaultOnceWarp {
        tripped: AtomicBool,
    }

    impl WarpUnit for FaultOnceWarp {
        fn bind(&self, _: PlaneId, _: PlaneFormat, _: usize) -> Result<(), UnitError> {
            Ok(())
        }

        fn load_map(&self, _: WarpMap) -> Result<(), UnitError> {
            Ok(())
        }

        fn warp(&self, lane: WarpLane, src: &PlaneHandle, dst: &PlaneHandle) -> Result<(), UnitError> {
            if matches!(lane, WarpLane::Camera(2)) && !self.tripped.swap(true, Ordering::SeqCst) {
                return Err(UnitError::Device("warp channel fault".into()));
            }
            src.read(|s| {
                dst.write(|d| {
                    let n = s.len().min(d.len());
                    d[..n].copy_from_slice(&s[..n]);
                })
            });
            Ok(())
        }
    }

    /// Blend unit that stamps the output with the first source byte, making
    /// each composed frame traceable to the camera cycle it came from.
    struct EchoBlend;

    impl BlendUnit for EchoBlend {
        fn submit(&self, job: BlendJob, done: BlendDone) -> Result<(), UnitError> {
            let marker = job.sources[0].read(|d| d[0]);
            job.output.fill(marker);
            done.complete(Ok(()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct MarkerSink {
        frames: Mutex<Vec<(u64, u8)>>,
    }

    impl FrameSink for MarkerSink {
        fn on_frame_ready(&self, frame: ComposedFrame) {
            let marker = frame.output.read(|d| d[0]);
            self.frames.lock().push((frame.sequence, marker));
        }
    }

    #[test]
    fn failed_camera_dispatch_does_not_skew_later_cycles() {
        let config = small_config();
        let sink = Arc::new(MarkerSink::default());
        let source =
            PlanePool::allocate(&HeapChunks, PlaneId::CameraLeft, config.camera_format, 16)
                .unwrap();
        let pipeline = PipelineBuilder::new(config.clone())
            .with_warp_unit(Arc::new(FaultOnceWarp {
                tripped: AtomicBool::new(false),
            }))
            .with_blend_unit(Arc::new(EchoBlend))
            .with_mesh_mapper(Arc::new(GateMapper::default()))
            .with_vehicle_renderer(Arc::new(FlatVehicle))
            .with_alpha_source(Arc::new(ConstAlpha::new(&config)))
            .with_sink(sink.clone())
            .start()
            .unwrap();
        let submit_marked = |marker: u8| {
            let mut last = Ok(());
            for camera in 0..4 {
                let frame = source.lease().unwrap();
                frame.fill(marker);
                last = pipeline.submit_camera_buffer(camera, frame, marker as u64);
            }
            last
        };
        // The cycle whose front camera fails must vanish without residue.
        let err = submit_marked(0x21).unwrap_err();
        assert!(matches!(err, EngineError::Unit(_)));
        submit_marked(0x22).unwrap();
        submit_marked(0x23).unwrap();
        assert_eq!(*sink.frames.lock(), vec![(0, 0x22), (1, 0x23)]);
    }

    #[test]
    fn driver_buffers_return_after_each_cycle() {
        let rig = rig(small_config());
        let depth = rig.source.depth();
        for ts in 0..50 {
            submit_cycle(&rig, ts);
            assert_eq!(rig.source.available(), depth);
        }
        assert_eq!(rig.source.recycled(), 200);
    }
}
