// integrate.rs -- Fuse one depth/color frame into the compacted bricks.
//
// One logical thread per voxel of each compacted brick. Each voxel is
// projected into the frame; a valid sample updates the voxel's signed
// distance, weight, and color as running averages. The signed distance
// is the projective difference `depth - z_cam`, clamped to the
// depth-dependent truncation band; samples more than one band behind
// the observed surface are occluded and skipped.

use glam::{Mat4, Vec3};

use crate::camera::DepthIntrinsics;
use crate::hash::HashTable;
use crate::image::Image;
use crate::params::HashParams;
use crate::voxel::{voxel_local, Voxel, BRICK_VOLUME};

/// Run the integration pass over the compacted entries.
pub fn integrate_pass(
    table: &HashTable,
    voxels: &mut [Voxel],
    compacted: &[u32],
    params: &HashParams,
    intr: &DepthIntrinsics,
    camera_from_world: &Mat4,
    depth: &Image<f32>,
    color: &Image<[u8; 4]>,
) {
    for &slot in compacted {
        let entry = table.entry(slot as usize);
        debug_assert!(entry.is_allocated());
        let base = entry.ptr as usize * BRICK_VOLUME;
        let brick_origin = entry.pos().as_vec3() * params.brick_world_size();

        for idx in 0..BRICK_VOLUME {
            let (x, y, z) = voxel_local(idx);
            let world = brick_origin
                + Vec3::new(x as f32, y as f32, z as f32) * params.voxel_size;
            let cam = camera_from_world.transform_point3(world);
            let Some(px) = intr.project_to_pixel(cam) else {
                continue;
            };

            let d = depth.get(px.x as usize, px.y as usize);
            if d <= 0.0 || d > params.max_integration_distance {
                continue;
            }

            let sdf = d - cam.z;
            let band = params.truncation_at(d);
            if sdf < -band {
                continue;
            }
            let sdf = sdf.clamp(-band, band);
            let sample = color.get(px.x as usize, px.y as usize);
            update_voxel(
                &mut voxels[base + idx],
                sdf,
                [sample[0], sample[1], sample[2]],
                params.integration_weight_sample,
                params.integration_weight_max,
            );
        }
    }
}

/// Blend one observation into a voxel: weighted running average of the
/// signed distance and each color channel, weight saturating at the cap.
pub fn update_voxel(v: &mut Voxel, sdf: f32, color: [u8; 3], w_sample: u32, w_max: u32) {
    let w_old = v.weight();
    let w_sum = w_old + w_sample;
    v.sdf = (v.sdf * w_old as f32 + sdf * w_sample as f32) / w_sum as f32;

    let old = v.color();
    let mut blended = [0u8; 3];
    for c in 0..3 {
        let acc = old[c] as u32 * w_old + color[c] as u32 * w_sample;
        blended[c] = ((acc + w_sum / 2) / w_sum) as u8;
    }
    v.set_color(blended);
    v.set_weight(w_sum.min(w_max));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_takes_sample() {
        let mut v = Voxel::EMPTY;
        update_voxel(&mut v, 0.015, [100, 150, 200], 10, 255);
        assert!((v.sdf - 0.015).abs() < 1e-6);
        assert_eq!(v.weight(), 10);
        assert_eq!(v.color(), [100, 150, 200]);
    }

    #[test]
    fn test_running_average() {
        let mut v = Voxel::EMPTY;
        update_voxel(&mut v, 0.02, [0, 0, 0], 10, 255);
        update_voxel(&mut v, -0.02, [255, 255, 255], 10, 255);
        assert!(v.sdf.abs() < 1e-6, "equal weights average to zero");
        assert_eq!(v.weight(), 20);
        // Rounded midpoint.
        assert_eq!(v.color(), [128, 128, 128]);
    }

    #[test]
    fn test_weight_saturates() {
        let mut v = Voxel::EMPTY;
        for _ in 0..40 {
            update_voxel(&mut v, 0.01, [10, 10, 10], 10, 255);
        }
        assert_eq!(v.weight(), 255);
    }

    #[test]
    fn test_heavily_weighted_voxel_moves_slowly() {
        let mut v = Voxel::new(0.0, 0, [0, 0, 0]);
        // Pin the old state at weight 200.
        for _ in 0..20 {
            update_voxel(&mut v, 0.0, [0, 0, 0], 10, 255);
        }
        let w_before = v.weight();
        update_voxel(&mut v, 0.02, [255, 0, 0], 10, 255);
        // 10/(200+10) of the way toward the sample.
        let expected = 0.02 * 10.0 / (w_before + 10) as f32;
        assert!((v.sdf - expected).abs() < 1e-6);
        assert!(v.color()[0] < 20);
    }
}
