// alloc.rs -- Allocator pass: ensure every brick touched by the depth
// frame has a hash entry and a heap brick.
//
// Per valid depth pixel, the pass builds a short world-space segment
// around the observed surface point (the truncation band along the
// pixel ray) and enumerates every brick the segment passes through with
// a 3D digital differential analyzer, inserting each one.
//
// Neighboring pixels request the same bricks redundantly, which is what
// makes the lossy bucket-mutex protocol acceptable: an insertion lost
// to contention is retried by the next pixel or the next frame.

use glam::{IVec3, Mat4, Vec3};

use crate::camera::DepthIntrinsics;
use crate::hash::HashTable;
use crate::heap::BrickHeap;
use crate::image::{BitMask, Image};
use crate::params::HashParams;

/// Depth samples closer than this are degenerate; the segment start is
/// clamped here so unprojection never collapses onto the camera origin.
const MIN_SEGMENT_DEPTH: f32 = 1e-3;

/// Run the allocator pass for one depth frame.
///
/// The caller resets the bucket mutexes first; frame dimensions are
/// checked by the orchestrator.
pub fn alloc_pass(
    table: &mut HashTable,
    heap: &mut BrickHeap,
    params: &HashParams,
    intr: &DepthIntrinsics,
    world_from_camera: &Mat4,
    depth: &Image<f32>,
    mask: Option<&BitMask>,
) {
    let inv_brick = 1.0 / params.brick_world_size();
    for v in 0..depth.height() {
        for u in 0..depth.width() {
            let d = depth.get(u, v);
            if d <= 0.0 || d > params.max_integration_distance {
                continue;
            }
            if let Some(m) = mask {
                if m.get(u, v) {
                    continue;
                }
            }

            let t = params.truncation_at(d);
            let z_min = (d - t).max(MIN_SEGMENT_DEPTH);
            let z_max = d + t;
            if z_max <= z_min {
                continue;
            }

            let start = world_from_camera
                .transform_point3(intr.unproject(u as f32, v as f32, z_min));
            let end = world_from_camera
                .transform_point3(intr.unproject(u as f32, v as f32, z_max));

            walk_bricks(start * inv_brick, end * inv_brick, |brick| {
                // All outcomes are soft; the table counts the failures.
                let _ = table.insert(brick, heap);
            });
        }
    }
}

/// Enumerate every grid cell a segment passes through (Amanatides-Woo).
///
/// Coordinates are in brick units: cell `(i, j, k)` covers
/// `[i, i+1) x [j, j+1) x [k, k+1)`. Visits the start cell first and
/// ends exactly at the end cell; each step crosses one cell face.
pub fn walk_bricks(start: Vec3, end: Vec3, mut visit: impl FnMut(IVec3)) {
    let mut cell = start.floor().as_ivec3();
    let end_cell = end.floor().as_ivec3();
    let dir = end - start;

    let step = IVec3::new(
        (dir.x > 0.0) as i32 - (dir.x < 0.0) as i32,
        (dir.y > 0.0) as i32 - (dir.y < 0.0) as i32,
        (dir.z > 0.0) as i32 - (dir.z < 0.0) as i32,
    );

    // Ray parameter advance per cell crossing, and parameter of the
    // first boundary crossing, per axis.
    let axis_setup = |dir_a: f32, start_a: f32, cell_a: i32, step_a: i32| -> (f32, f32) {
        if step_a == 0 {
            return (f32::INFINITY, f32::INFINITY);
        }
        let t_delta = 1.0 / dir_a.abs();
        let boundary = if step_a > 0 { cell_a as f32 + 1.0 } else { cell_a as f32 };
        ((boundary - start_a) / dir_a, t_delta)
    };
    let (mut tx, dx) = axis_setup(dir.x, start.x, cell.x, step.x);
    let (mut ty, dy) = axis_setup(dir.y, start.y, cell.y, step.y);
    let (mut tz, dz) = axis_setup(dir.z, start.z, cell.z, step.z);

    visit(cell);
    let steps = (end_cell - cell).abs();
    let total = (steps.x + steps.y + steps.z) as usize;
    for _ in 0..total {
        if tx <= ty && tx <= tz {
            cell.x += step.x;
            tx += dx;
        } else if ty <= tz {
            cell.y += step.y;
            ty += dy;
        } else {
            cell.z += step.z;
            tz += dz;
        }
        visit(cell);
    }
}
