// compact.rs -- Densify the occupied, in-frustum hash slots into a
// contiguous index array.
//
// Decision fill -> exclusive prefix sum -> scatter. Downstream passes
// then iterate `num_occupied` entries instead of every slot of the
// table. The scratch arrays cover all slots, head region and overflow
// tail alike, and are allocated once per session.

use glam::Mat4;

use crate::camera::DepthIntrinsics;
use crate::hash::HashTable;
use crate::params::HashParams;
use crate::scan::exclusive_prefix_sum;

/// Per-session scratch for the compaction pass.
pub struct CompactionScratch {
    pub decision: Vec<u32>,
    pub prefix: Vec<u32>,
    /// Slot indices of the compacted entries; only the first
    /// `num_occupied` elements are meaningful after a pass.
    pub compacted: Vec<u32>,
}

impl CompactionScratch {
    pub fn new(total_slots: usize) -> Self {
        CompactionScratch {
            decision: vec![0; total_slots],
            prefix: vec![0; total_slots],
            compacted: vec![0; total_slots],
        }
    }
}

/// Run the compaction pass. Returns `num_occupied`, the number of
/// allocated entries whose brick lies in the current view frustum.
pub fn compact_pass(
    table: &HashTable,
    params: &HashParams,
    intr: &DepthIntrinsics,
    camera_from_world: &Mat4,
    scratch: &mut CompactionScratch,
) -> u32 {
    let brick_ws = params.brick_world_size();
    for (i, e) in table.entries().iter().enumerate() {
        let keep = e.is_allocated() && {
            let center = (e.pos().as_vec3() + 0.5) * brick_ws;
            intr.brick_center_in_frustum(
                camera_from_world.transform_point3(center),
                brick_ws,
                params.max_integration_distance,
            )
        };
        scratch.decision[i] = keep as u32;
    }

    let total = exclusive_prefix_sum(&scratch.decision, &mut scratch.prefix);

    for i in 0..scratch.decision.len() {
        if scratch.decision[i] != 0 {
            scratch.compacted[scratch.prefix[i] as usize] = i as u32;
        }
    }
    total
}
