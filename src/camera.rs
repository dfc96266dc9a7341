// camera.rs -- Pinhole depth camera model.
//
// Handles:
// - Pixel <-> camera-space conversion at a given depth
// - Projection for the integration and compaction passes
// - The approximate brick frustum test used by compaction
//
// Frames arrive undistorted and registered; lens models live with the
// camera I/O layer, outside this crate. Depth is metric along the
// camera z axis (not ray length), so unprojection scales the normalized
// ray by z directly.

use glam::{IVec2, Mat4, Vec3, Vec4};

/// Pinhole intrinsics of the depth sensor.
#[derive(Debug, Clone, Copy)]
pub struct DepthIntrinsics {
    /// Focal length in pixels (x-axis).
    pub fx: f32,
    /// Focal length in pixels (y-axis).
    pub fy: f32,
    /// Principal point x (pixels).
    pub cx: f32,
    /// Principal point y (pixels).
    pub cy: f32,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
}

impl DepthIntrinsics {
    pub fn new(fx: f32, fy: f32, cx: f32, cy: f32, width: u32, height: u32) -> Self {
        DepthIntrinsics { fx, fy, cx, cy, width, height }
    }

    /// The intrinsic matrix K embedded in a 4x4.
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_cols(
            Vec4::new(self.fx, 0.0, 0.0, 0.0),
            Vec4::new(0.0, self.fy, 0.0, 0.0),
            Vec4::new(self.cx, self.cy, 1.0, 0.0),
            Vec4::W,
        )
    }

    /// K^-1 embedded in a 4x4.
    pub fn inverse_matrix(&self) -> Mat4 {
        Mat4::from_cols(
            Vec4::new(1.0 / self.fx, 0.0, 0.0, 0.0),
            Vec4::new(0.0, 1.0 / self.fy, 0.0, 0.0),
            Vec4::new(-self.cx / self.fx, -self.cy / self.fy, 1.0, 0.0),
            Vec4::W,
        )
    }

    /// Camera-space point of pixel `(u, v)` at depth `z` (meters).
    #[inline]
    pub fn unproject(&self, u: f32, v: f32, z: f32) -> Vec3 {
        Vec3::new(
            (u - self.cx) / self.fx * z,
            (v - self.cy) / self.fy * z,
            z,
        )
    }

    /// Project a camera-space point to continuous pixel coordinates.
    ///
    /// The caller checks `p.z > 0` first; projection through the camera
    /// plane is meaningless.
    #[inline]
    pub fn project(&self, p: Vec3) -> (f32, f32) {
        (
            p.x / p.z * self.fx + self.cx,
            p.y / p.z * self.fy + self.cy,
        )
    }

    /// Project and round to the nearest pixel, `None` if off-image or
    /// behind the camera.
    pub fn project_to_pixel(&self, p: Vec3) -> Option<IVec2> {
        if p.z <= 0.0 {
            return None;
        }
        let (u, v) = self.project(p);
        let px = (u + 0.5).floor() as i32;
        let py = (v + 0.5).floor() as i32;
        if px < 0 || py < 0 || px >= self.width as i32 || py >= self.height as i32 {
            return None;
        }
        Some(IVec2::new(px, py))
    }

    /// Approximate frustum test for a brick, by its center.
    ///
    /// Projects the brick center and accepts it when the center lies in
    /// front of the camera, within `max_depth` plus half the brick
    /// diagonal, and its projection falls inside the image expanded by
    /// the brick's projected radius. Conservative: may keep a brick that
    /// only grazes the frustum, never culls one that intersects it.
    pub fn brick_center_in_frustum(
        &self,
        center_cam: Vec3,
        brick_world_size: f32,
        max_depth: f32,
    ) -> bool {
        let half_diag = brick_world_size * 0.5 * 1.732_051;
        if center_cam.z <= -half_diag {
            return false;
        }
        if center_cam.z - half_diag > max_depth {
            return false;
        }
        let z = center_cam.z.max(1e-3);
        let radius_px = half_diag / z * self.fx.max(self.fy);
        let (u, v) = (
            center_cam.x / z * self.fx + self.cx,
            center_cam.y / z * self.fy + self.cy,
        );
        u >= -radius_px
            && v >= -radius_px
            && u < self.width as f32 + radius_px
            && v < self.height as f32 + radius_px
    }
}
