//! CPU reference implementations of the hardware units.
//!
//! These trade speed for having no device dependency: they are exact enough
//! to develop and test the pipeline against, and slow enough that nobody
//! will ship them by accident.

use std::collections::{HashMap, VecDeque};
use std::path::Path;

use glam::{Mat4, Vec3};
use parking_lot::Mutex;
use tracing::debug;

use halo_core::prelude::{
    ChunkAllocator, HeapChunks, PlaneFormat, PlaneHandle, PlaneId, PlanePool,
};
use halo_engine::prelude::{
    AlphaSource, BlendDone, BlendJob, BlendUnit, MeshMapper, MeshPoint, UnitError,
    VehicleRenderer, WarpLane, WarpMap, WarpUnit,
};

/// Nearest-neighbor software dewarp.
///
/// Keeps the last loaded remap table per lane. Without a table the source
/// is copied through unmodified.
#[derive(Default)]
pub struct SoftwareWarpUnit {
    maps: Mutex<HashMap<WarpLane, WarpMap>>,
}

impl SoftwareWarpUnit {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WarpUnit for SoftwareWarpUnit {
    fn bind(&self, plane: PlaneId, format: PlaneFormat, depth: usize) -> Result<(), UnitError> {
        debug!(?plane, %format.resolution, depth, "software warp bound");
        Ok(())
    }

    fn load_map(&self, map: WarpMap) -> Result<(), UnitError> {
        self.maps.lock().insert(map.lane, map);
        Ok(())
    }

    fn warp(&self, lane: WarpLane, src: &PlaneHandle, dst: &PlaneHandle) -> Result<(), UnitError> {
        let maps = self.maps.lock();
        let Some(map) = maps.get(&lane) else {
            src.read(|s| {
                dst.write(|d| {
                    let n = s.len().min(d.len());
                    d[..n].copy_from_slice(&s[..n]);
                })
            });
            return Ok(());
        };
        let src_format = src.format();
        let dst_format = dst.format();
        let bpp = src_format.bytes_per_pixel.min(dst_format.bytes_per_pixel);
        let sw = src_format.resolution.width.get() as i64;
        let sh = src_format.resolution.height.get() as i64;
        src.read(|s| {
            dst.write(|d| {
                for point in &map.points {
                    let sx = (point.src[0].round() as i64).clamp(0, sw - 1);
                    let sy = (point.src[1].round() as i64).clamp(0, sh - 1);
                    let from = (sy as usize * src_format.stride())
                        + sx as usize * src_format.bytes_per_pixel;
                    let to = (point.dst[1] as usize * dst_format.stride())
                        + point.dst[0] as usize * dst_format.bytes_per_pixel;
                    if from + bpp <= s.len() && to + bpp <= d.len() {
                        d[to..to + bpp].copy_from_slice(&s[from..from + bpp]);
                    }
                }
            })
        });
        Ok(())
    }
}

/// Sample a source plane to `len` bytes, wrapping when the formats differ.
fn sampled(source: &PlaneHandle, len: usize) -> Vec<u8> {
    source.read(|s| {
        if s.is_empty() {
            vec![0; len]
        } else {
            (0..len).map(|i| s[i % s.len()]).collect()
        }
    })
}

/// Alpha-over composition shared by the software blend units: average the
/// two physical camera planes, then blend the car overlay through each
/// alpha mask.
fn composite(job: &BlendJob) {
    let len = job.output.format().plane_bytes();
    let alpha_count = job.sources.len().saturating_sub(3);
    let base_a = sampled(&job.sources[0], len);
    let base_b = sampled(&job.sources[1], len);
    let car = sampled(&job.sources[2 + alpha_count], len);
    let mut out: Vec<u8> = base_a
        .iter()
        .zip(&base_b)
        .map(|(a, b)| ((*a as u16 + *b as u16) / 2) as u8)
        .collect();
    for lane in 0..alpha_count {
        let mask = sampled(&job.sources[2 + lane], len);
        for i in 0..len {
            let a = mask[i] as u16;
            out[i] = ((car[i] as u16 * a + out[i] as u16 * (255 - a)) / 255) as u8;
        }
    }
    job.output.write(|d| d.copy_from_slice(&out));
}

/// Software blend unit that composes and completes inline on the
/// submitting thread.
#[derive(Default)]
pub struct SoftwareBlendUnit;

impl SoftwareBlendUnit {
    pub fn new() -> Self {
        Self
    }
}

impl BlendUnit for SoftwareBlendUnit {
    fn submit(&self, job: BlendJob, done: BlendDone) -> Result<(), UnitError> {
        composite(&job);
        done.complete(Ok(()));
        Ok(())
    }
}

/// Software blend unit that holds every job until explicitly released,
/// for tests and simulations that need to control completion timing.
#[derive(Default)]
pub struct ManualBlendUnit {
    held: Mutex<VecDeque<(BlendJob, BlendDone)>>,
}

impl ManualBlendUnit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs submitted but not yet released.
    pub fn pending(&self) -> usize {
        self.held.lock().len()
    }

    /// Compose and complete the oldest held job. Returns false if none is
    /// held.
    pub fn release_next(&self) -> bool {
        let Some((job, done)) = self.held.lock().pop_front() else {
            return false;
        };
        composite(&job);
        done.complete(Ok(()));
        true
    }

    /// Fail the oldest held job without composing it.
    pub fn fail_next(&self, status: i32) -> bool {
        let Some((_job, done)) = self.held.lock().pop_front() else {
            return false;
        };
        done.complete(Err(UnitError::JobFailed(status)));
        true
    }
}

impl BlendUnit for ManualBlendUnit {
    fn submit(&self, job: BlendJob, done: BlendDone) -> Result<(), UnitError> {
        self.held.lock().push_back((job, done));
        Ok(())
    }
}

/// Remap tables from a regular destination grid projected through the
/// inverse view matrix.
pub struct GridMeshMapper {
    step: usize,
}

impl GridMeshMapper {
    /// `step` is the grid pitch in destination pixels.
    pub fn new(step: usize) -> Self {
        Self {
            step: step.max(1),
        }
    }
}

impl MeshMapper for GridMeshMapper {
    fn remap(
        &self,
        view: &Mat4,
        lane: WarpLane,
        format: PlaneFormat,
    ) -> Result<WarpMap, UnitError> {
        let inv = view.inverse();
        let w = format.resolution.width.get();
        let h = format.resolution.height.get();
        let mut points = Vec::new();
        for y in (0..h).step_by(self.step) {
            for x in (0..w).step_by(self.step) {
                let nx = x as f32 / (w.max(2) - 1) as f32 * 2.0 - 1.0;
                let ny = y as f32 / (h.max(2) - 1) as f32 * 2.0 - 1.0;
                let p = inv.transform_point3(Vec3::new(nx, ny, 0.0));
                let sx = (p.x * 0.5 + 0.5) * (w - 1) as f32;
                let sy = (p.y * 0.5 + 0.5) * (h - 1) as f32;
                points.push(MeshPoint {
                    src: [sx, sy],
                    dst: [x, y],
                });
            }
        }
        Ok(WarpMap { lane, points })
    }
}

/// Vehicle overlay rendered as a solid block, or loaded from a raw pixel
/// dump when the pose carries an image path.
pub struct FlatVehicleRenderer {
    color: u8,
}

impl FlatVehicleRenderer {
    pub fn new(color: u8) -> Self {
        Self { color }
    }
}

impl VehicleRenderer for FlatVehicleRenderer {
    fn render(&self, _: &Mat4, image: Option<&Path>, dst: &PlaneHandle) -> Result<(), UnitError> {
        if let Some(path) = image {
            let raw = std::fs::read(path)
                .map_err(|e| UnitError::Device(format!("vehicle image {path:?}: {e}")))?;
            dst.write(|d| {
                let n = raw.len().min(d.len());
                d[..n].copy_from_slice(&raw[..n]);
                d[n..].fill(0);
            });
            return Ok(());
        }
        dst.fill(self.color);
        Ok(())
    }
}

/// Alpha masks at a constant coverage value.
pub struct ConstAlphaSource {
    pool: PlanePool,
    value: u8,
}

impl ConstAlphaSource {
    /// Reserve the mask pool up front; masks are transient warm-up sources
    /// so double buffering is enough.
    pub fn new(format: PlaneFormat, value: u8) -> Result<Self, UnitError> {
        let pool = PlanePool::allocate(&HeapChunks, PlaneId::AlphaLeft, format, 2)
            .map_err(|e| UnitError::Device(e.to_string()))?;
        Ok(Self { pool, value })
    }

    /// Same, with a caller-supplied allocator.
    pub fn with_allocator(
        allocator: &dyn ChunkAllocator,
        format: PlaneFormat,
        value: u8,
    ) -> Result<Self, UnitError> {
        let pool = PlanePool::allocate(allocator, PlaneId::AlphaLeft, format, 2)
            .map_err(|e| UnitError::Device(e.to_string()))?;
        Ok(Self { pool, value })
    }
}

impl AlphaSource for ConstAlphaSource {
    fn mask(&self, _lane: usize, _view: &Mat4) -> Result<PlaneHandle, UnitError> {
        let mask = self
            .pool
            .lease()
            .map_err(|e| UnitError::Device(e.to_string()))?;
        mask.fill(self.value);
        Ok(mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halo_core::prelude::*;
    use smallvec::smallvec;

    fn fmt(bpp: usize) -> PlaneFormat {
        PlaneFormat::new(FourCc::new(*b"AR24"), Resolution::new(8, 8).unwrap(), bpp)
    }

    fn handle(plane: PlaneId, bpp: usize, fill: u8) -> PlaneHandle {
        let pool = PlanePool::allocate(&HeapChunks, plane, fmt(bpp), 1).unwrap();
        let h = pool.lease().unwrap();
        h.fill(fill);
        h
    }

    #[test]
    fn warp_without_map_copies() {
        let unit = SoftwareWarpUnit::new();
        let src = handle(PlaneId::CameraLeft, 2, 0x11);
        let dst = handle(PlaneId::CameraLeft, 2, 0x00);
        unit.warp(WarpLane::Camera(0), &src, &dst).unwrap();
        dst.read(|d| assert!(d.iter().all(|b| *b == 0x11)));
    }

    #[test]
    fn warp_with_identity_map_moves_pixels() {
        let unit = SoftwareWarpUnit::new();
        let map = WarpMap {
            lane: WarpLane::Camera(0),
            points: vec![MeshPoint {
                src: [0.0, 0.0],
                dst: [3, 3],
            }],
        };
        unit.load_map(map).unwrap();
        let src = handle(PlaneId::CameraLeft, 2, 0x7e);
        let dst = handle(PlaneId::CameraLeft, 2, 0x00);
        unit.warp(WarpLane::Camera(0), &src, &dst).unwrap();
        dst.read(|d| {
            let stride = fmt(2).stride();
            assert_eq!(d[3 * stride + 6], 0x7e);
            assert_eq!(d[0], 0x00);
        });
    }

    #[test]
    fn composite_is_full_car_at_opaque_alpha() {
        let job = BlendJob {
            id: 0,
            sequence: 0,
            sources: smallvec![
                handle(PlaneId::CameraLeft, 2, 100),
                handle(PlaneId::CameraFront, 2, 100),
                handle(PlaneId::AlphaLeft, 1, 255),
                handle(PlaneId::Car, 4, 200),
            ],
            output: handle(PlaneId::Output, 4, 0),
        };
        composite(&job);
        job.output.read(|d| assert!(d.iter().all(|b| *b == 200)));
    }

    #[test]
    fn composite_passes_cameras_through_at_zero_alpha() {
        let job = BlendJob {
            id: 0,
            sequence: 0,
            sources: smallvec![
                handle(PlaneId::CameraLeft, 2, 60),
                handle(PlaneId::CameraFront, 2, 80),
                handle(PlaneId::AlphaLeft, 1, 0),
                handle(PlaneId::Car, 4, 255),
            ],
            output: handle(PlaneId::Output, 4, 0),
        };
        composite(&job);
        job.output.read(|d| assert!(d.iter().all(|b| *b == 70)));
    }

    #[test]
    fn manual_blend_holds_until_released() {
        let unit = ManualBlendUnit::new();
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let observed = fired.clone();
        let job = BlendJob {
            id: 1,
            sequence: 0,
            sources: smallvec![
                handle(PlaneId::CameraLeft, 2, 1),
                handle(PlaneId::CameraFront, 2, 1),
                handle(PlaneId::AlphaLeft, 1, 1),
                handle(PlaneId::Car, 4, 1),
            ],
            output: handle(PlaneId::Output, 4, 0),
        };
        let done = BlendDone::new(move |result| {
            assert!(result.is_ok());
            observed.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        unit.submit(job, done).unwrap();
        assert_eq!(unit.pending(), 1);
        assert!(!fired.load(std::sync::atomic::Ordering::SeqCst));
        assert!(unit.release_next());
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!unit.release_next());
    }

    #[test]
    fn grid_mapper_identity_view_maps_straight() {
        let mapper = GridMeshMapper::new(4);
        let map = mapper
            .remap(&Mat4::IDENTITY, WarpLane::Camera(0), fmt(2))
            .unwrap();
        assert!(!map.points.is_empty());
        for point in &map.points {
            assert!((point.src[0] - point.dst[0] as f32).abs() < 0.51);
            assert!((point.src[1] - point.dst[1] as f32).abs() < 0.51);
        }
    }

    #[test]
    fn const_alpha_masks_are_filled() {
        let source = ConstAlphaSource::new(fmt(1), 0x80).unwrap();
        let mask = source.mask(0, &Mat4::IDENTITY).unwrap();
        mask.read(|d| assert!(d.iter().all(|b| *b == 0x80)));
    }
}
