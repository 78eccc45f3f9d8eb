use std::path::PathBuf;

use glam::{Mat4, Vec3};

/// Scale factors below this are clamped to keep the view matrix invertible.
const MIN_SCALE: f32 = 1.0e-3;

/// Requested viewpoint for the composed surround image.
///
/// Rotation is Euler angles in radians applied in x, y, z order; scale is a
/// uniform zoom. An optional vehicle sprite path selects the overlay image
/// rendered at the center of the scene.
///
/// # Example
/// ```rust
/// use halo_engine::view::ViewPose;
/// use glam::Vec3;
///
/// let pose = ViewPose::new(Vec3::new(0.3, 0.0, 0.0), 1.5);
/// let m = pose.matrix();
/// assert!(m.determinant() > 0.0);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ViewPose {
    pub rotation: Vec3,
    pub scale: f32,
    pub vehicle_image: Option<PathBuf>,
}

impl ViewPose {
    pub fn new(rotation: Vec3, scale: f32) -> Self {
        Self {
            rotation,
            scale,
            vehicle_image: None,
        }
    }

    pub fn with_vehicle_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.vehicle_image = Some(path.into());
        self
    }

    /// View matrix handed to the mesh mapper and vehicle renderer.
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale(Vec3::splat(self.scale.max(MIN_SCALE)))
            * Mat4::from_rotation_x(self.rotation.x)
            * Mat4::from_rotation_y(self.rotation.y)
            * Mat4::from_rotation_z(self.rotation.z)
    }
}

impl Default for ViewPose {
    /// Top-down view at unit zoom.
    fn default() -> Self {
        Self::new(Vec3::ZERO, 1.0)
    }
}
