//! Stepwise viewpoint animation.

use glam::Vec3;

use halo_engine::prelude::{EngineError, Pipeline, ViewPose};

/// Interpolates between two poses and feeds the steps to a pipeline.
///
/// Each call to [`drive`](ViewAnimator::drive) requests the next step when
/// the previous update has committed; updates are never stacked, so the
/// animation simply slows down if the pipeline is busy.
///
/// # Example
/// ```rust,ignore
/// let mut animator = ViewAnimator::new(ViewPose::default(), target, 30);
/// while animator.drive(&pipeline)? {
///     std::thread::sleep(frame_interval);
/// }
/// ```
pub struct ViewAnimator {
    from: ViewPose,
    to: ViewPose,
    steps: u32,
    taken: u32,
}

impl ViewAnimator {
    pub fn new(from: ViewPose, to: ViewPose, steps: u32) -> Self {
        Self {
            from,
            to,
            steps: steps.max(1),
            taken: 0,
        }
    }

    /// The next interpolated pose, or `None` once the target is reached.
    pub fn next_pose(&mut self) -> Option<ViewPose> {
        if self.taken >= self.steps {
            return None;
        }
        self.taken += 1;
        let t = self.taken as f32 / self.steps as f32;
        let rotation = Vec3::lerp(self.from.rotation, self.to.rotation, t);
        let scale = self.from.scale + (self.to.scale - self.from.scale) * t;
        let mut pose = ViewPose::new(rotation, scale);
        pose.vehicle_image = self.to.vehicle_image.clone();
        Some(pose)
    }

    /// Request the next step if the pipeline is ready for one. Returns
    /// `false` once the animation has finished.
    pub fn drive(&mut self, pipeline: &Pipeline) -> Result<bool, EngineError> {
        if self.taken >= self.steps {
            return Ok(false);
        }
        if pipeline.update_pending() {
            return Ok(true);
        }
        match self.next_pose() {
            Some(pose) => match pipeline.set_view(pose) {
                Ok(()) => Ok(true),
                // Lost a race with another updater; retry on the next call.
                Err(EngineError::UpdatePending) => {
                    self.taken -= 1;
                    Ok(true)
                }
                Err(error) => Err(error),
            },
            None => Ok(false),
        }
    }
}
