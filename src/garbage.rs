// garbage.rs -- Reclaim bricks the sensor no longer observes.
//
// Three sub-passes, separated by barriers on the device:
//   starve    every `starve_period` frames, decrement all weights so
//             bricks that stop being reinforced decay;
//   identify  flag bricks whose max weight reached zero or whose
//             surface is uniformly outside the truncation band;
//   free      return flagged bricks to the heap and clear their hash
//             entries. Runs under the bucket-mutex protocol because
//             unlinking overflow nodes rewrites chain links.

use crate::hash::HashTable;
use crate::heap::BrickHeap;
use crate::params::HashParams;
use crate::voxel::{Voxel, BRICK_VOLUME};

/// Decrement every voxel weight of the compacted bricks by one.
pub fn starve_pass(table: &HashTable, voxels: &mut [Voxel], compacted: &[u32]) {
    for &slot in compacted {
        let base = table.entry(slot as usize).ptr as usize * BRICK_VOLUME;
        for v in &mut voxels[base..base + BRICK_VOLUME] {
            let w = v.weight();
            v.set_weight(w.saturating_sub(1));
        }
    }
}

/// Flag bricks for deletion into `flags` (indexed by compacted
/// position; nonzero = delete).
///
/// The min-|sdf| reduction only considers observed voxels: an
/// unobserved voxel carries sdf 0.0, which would otherwise pin the
/// minimum to zero and keep half-observed bricks alive forever.
pub fn identify_pass(
    table: &HashTable,
    voxels: &[Voxel],
    compacted: &[u32],
    params: &HashParams,
    flags: &mut [u32],
) {
    for (ci, &slot) in compacted.iter().enumerate() {
        let base = table.entry(slot as usize).ptr as usize * BRICK_VOLUME;
        let mut max_weight = 0u32;
        let mut min_abs_sdf = f32::INFINITY;
        for v in &voxels[base..base + BRICK_VOLUME] {
            let w = v.weight();
            if w > max_weight {
                max_weight = w;
            }
            if w > 0 && v.sdf.abs() < min_abs_sdf {
                min_abs_sdf = v.sdf.abs();
            }
        }
        let starved = max_weight == 0;
        let off_surface = min_abs_sdf > params.gc_sdf_threshold * params.truncation;
        flags[ci] = (starved || off_surface) as u32;
    }
}

/// Free every flagged brick: heap slot back on the stack, hash entry
/// cleared with chain-preserving unlink. Caller resets the bucket
/// mutexes first.
pub fn free_pass(
    table: &mut HashTable,
    heap: &mut BrickHeap,
    compacted: &[u32],
    flags: &[u32],
) {
    for (ci, &slot) in compacted.iter().enumerate() {
        if flags[ci] == 0 {
            continue;
        }
        // An earlier removal in this pass may have promoted a chain
        // node into this slot; a slot that no longer holds its brick is
        // skipped and retried next frame.
        let e = table.entry(slot as usize);
        if !e.is_allocated() {
            continue;
        }
        let pos = e.pos();
        // A contended bucket defers this brick to the next frame.
        let _ = table.remove(pos, heap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::IVec3;

    fn setup() -> (HashParams, HashTable, BrickHeap, Vec<Voxel>) {
        let params = HashParams {
            num_buckets: 8,
            bucket_size: 2,
            num_overflow_slots: 4,
            num_bricks: 4,
            ..Default::default()
        };
        let table = HashTable::new(&params);
        let heap = BrickHeap::new(params.num_bricks);
        let voxels = vec![Voxel::EMPTY; params.voxel_count()];
        (params, table, heap, voxels)
    }

    /// Insert a brick and give every voxel the same weight and sdf.
    fn fill_brick(
        table: &mut HashTable,
        heap: &mut BrickHeap,
        voxels: &mut [Voxel],
        pos: IVec3,
        weight: u32,
        sdf: f32,
    ) -> u32 {
        let crate::hash::InsertOutcome::Inserted(brick) = table.insert(pos, heap) else {
            panic!("insert failed in test setup");
        };
        let base = brick as usize * BRICK_VOLUME;
        for v in &mut voxels[base..base + BRICK_VOLUME] {
            *v = Voxel::new(sdf, weight, [0, 0, 0]);
        }
        brick
    }

    #[test]
    fn test_starve_decrements_to_zero() {
        let (_, mut table, mut heap, mut voxels) = setup();
        fill_brick(&mut table, &mut heap, &mut voxels, IVec3::ZERO, 2, 0.0);
        let compacted = [table.find_slot(IVec3::ZERO).unwrap() as u32];

        starve_pass(&table, &mut voxels, &compacted);
        assert_eq!(voxels[0].weight(), 1);
        starve_pass(&table, &mut voxels, &compacted);
        assert_eq!(voxels[0].weight(), 0);
        // Floor at zero.
        starve_pass(&table, &mut voxels, &compacted);
        assert_eq!(voxels[0].weight(), 0);
    }

    #[test]
    fn test_identify_flags_starved_brick() {
        let (params, mut table, mut heap, mut voxels) = setup();
        fill_brick(&mut table, &mut heap, &mut voxels, IVec3::ZERO, 0, 0.0);
        fill_brick(&mut table, &mut heap, &mut voxels, IVec3::new(1, 0, 0), 5, 0.0);
        let compacted = [
            table.find_slot(IVec3::ZERO).unwrap() as u32,
            table.find_slot(IVec3::new(1, 0, 0)).unwrap() as u32,
        ];
        let mut flags = [0u32; 2];
        identify_pass(&table, &voxels, &compacted, &params, &mut flags);
        assert_eq!(flags, [1, 0]);
    }

    #[test]
    fn test_identify_flags_off_surface_brick() {
        let (params, mut table, mut heap, mut voxels) = setup();
        // Weighted, but every observed voxel far outside the band.
        let far = params.gc_sdf_threshold * params.truncation * 2.0;
        fill_brick(&mut table, &mut heap, &mut voxels, IVec3::ZERO, 5, far);
        let compacted = [table.find_slot(IVec3::ZERO).unwrap() as u32];
        let mut flags = [0u32];
        identify_pass(&table, &voxels, &compacted, &params, &mut flags);
        assert_eq!(flags, [1]);
    }

    #[test]
    fn test_identify_ignores_unobserved_voxels() {
        let (params, mut table, mut heap, mut voxels) = setup();
        let far = params.gc_sdf_threshold * params.truncation * 2.0;
        let brick = fill_brick(&mut table, &mut heap, &mut voxels, IVec3::ZERO, 5, far);
        // One unobserved voxel with sdf == 0 must not keep the brick.
        let base = brick as usize * BRICK_VOLUME;
        voxels[base + 7] = Voxel::EMPTY;
        let compacted = [table.find_slot(IVec3::ZERO).unwrap() as u32];
        let mut flags = [0u32];
        identify_pass(&table, &voxels, &compacted, &params, &mut flags);
        assert_eq!(flags, [1]);
    }

    #[test]
    fn test_free_returns_bricks_and_clears_entries() {
        let (_, mut table, mut heap, mut voxels) = setup();
        let before = heap.free_count();
        fill_brick(&mut table, &mut heap, &mut voxels, IVec3::ZERO, 0, 0.0);
        fill_brick(&mut table, &mut heap, &mut voxels, IVec3::new(1, 0, 0), 5, 0.0);
        let compacted = [
            table.find_slot(IVec3::ZERO).unwrap() as u32,
            table.find_slot(IVec3::new(1, 0, 0)).unwrap() as u32,
        ];
        let flags = [1u32, 0];
        table.reset_bucket_mutexes();
        free_pass(&mut table, &mut heap, &compacted, &flags);

        assert_eq!(table.find_slot(IVec3::ZERO), None);
        assert!(table.find_slot(IVec3::new(1, 0, 0)).is_some());
        assert_eq!(heap.free_count(), before - 1);
        table.check_consistency(&heap).unwrap();
    }
}
