use halo_core::prelude::{FourCc, PlaneFormat, Resolution};

use crate::view::ViewPose;

/// How alpha blend masks are laid out across the composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AlphaLayout {
    /// One mask shared by the whole composition.
    Single,
    /// One mask per camera seam.
    PerCamera,
}

impl AlphaLayout {
    /// Number of alpha planes this layout occupies.
    pub fn planes(&self) -> usize {
        match self {
            AlphaLayout::Single => 1,
            AlphaLayout::PerCamera => 4,
        }
    }
}

/// Static pipeline configuration, fixed at start.
///
/// Plane formats are per role; all four cameras share `camera_format`. Pool
/// depth applies to every buffer pool the engine owns (2 gives classic
/// double buffering).
///
/// # Example
/// ```rust
/// use halo_engine::config::{AlphaLayout, EngineConfig};
///
/// let config = EngineConfig::default().with_alpha_layout(AlphaLayout::PerCamera);
/// assert_eq!(config.alpha_layout.planes(), 4);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Format every submitted camera buffer must match, and the format of
    /// the physical dewarp destination planes.
    pub camera_format: PlaneFormat,
    pub alpha_format: PlaneFormat,
    pub car_format: PlaneFormat,
    pub output_format: PlaneFormat,
    pub alpha_layout: AlphaLayout,
    /// Slots per buffer pool.
    pub pool_depth: usize,
    /// Attach raw camera planes to each composed frame for inspection.
    pub debug_tap: bool,
    /// Viewpoint rendered until the first `set_view`.
    pub initial_pose: ViewPose,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let res = Resolution::new(1280, 800).expect("static resolution");
        let out = Resolution::new(1280, 720).expect("static resolution");
        Self {
            camera_format: PlaneFormat::new(FourCc::new(*b"UYVY"), res, 2),
            alpha_format: PlaneFormat::new(FourCc::new(*b"AL08"), out, 1),
            car_format: PlaneFormat::new(FourCc::new(*b"AR24"), out, 4),
            output_format: PlaneFormat::new(FourCc::new(*b"AR24"), out, 4),
            alpha_layout: AlphaLayout::Single,
            pool_depth: 2,
            debug_tap: false,
            initial_pose: ViewPose::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_camera_format(mut self, format: PlaneFormat) -> Self {
        self.camera_format = format;
        self
    }

    pub fn with_alpha_format(mut self, format: PlaneFormat) -> Self {
        self.alpha_format = format;
        self
    }

    pub fn with_car_format(mut self, format: PlaneFormat) -> Self {
        self.car_format = format;
        self
    }

    pub fn with_output_format(mut self, format: PlaneFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn with_alpha_layout(mut self, layout: AlphaLayout) -> Self {
        self.alpha_layout = layout;
        self
    }

    pub fn with_pool_depth(mut self, depth: usize) -> Self {
        self.pool_depth = depth;
        self
    }

    pub fn with_debug_tap(mut self, enabled: bool) -> Self {
        self.debug_tap = enabled;
        self
    }

    pub fn with_initial_pose(mut self, pose: ViewPose) -> Self {
        self.initial_pose = pose;
        self
    }

    /// Clamp values that would leave the pipeline unable to make progress.
    pub(crate) fn sanitized(mut self) -> Self {
        self.pool_depth = self.pool_depth.max(2);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_enforces_double_buffering() {
        let config = EngineConfig::default().with_pool_depth(0).sanitized();
        assert_eq!(config.pool_depth, 2);
    }

    #[test]
    fn alpha_layout_plane_counts() {
        assert_eq!(AlphaLayout::Single.planes(), 1);
        assert_eq!(AlphaLayout::PerCamera.planes(), 4);
    }
}
