// scene.rs -- The scene representation: owns the hash table, brick
// heap, and voxel pool, and sequences the per-frame pipeline.
//
// Frame flow: reset mutexes -> allocate -> compact -> integrate ->
// collect -> normalize reserved slots -> advance the frame counter.
// On the device each arrow is a barrier; here the pass functions run
// in order and the barrier is implicit.
//
// One `SceneRep` per reconstruction session, owned by the application.
// All storage is sized from `HashParams` at construction and never
// resized.

use glam::{IVec3, Mat4, Vec3};
use tracing::debug;

use crate::alloc::alloc_pass;
use crate::camera::DepthIntrinsics;
use crate::compact::{compact_pass, CompactionScratch};
use crate::error::{ConsistencyError, FusionError};
use crate::garbage::{free_pass, identify_pass, starve_pass};
use crate::hash::{HashStats, HashTable, HeapReport};
use crate::heap::BrickHeap;
use crate::image::{BitMask, Image};
use crate::integrate::integrate_pass;
use crate::params::HashParams;
use crate::voxel::{Voxel, BRICK_SIZE, BRICK_VOLUME};

/// Pipeline stages reported to a [`PassObserver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Alloc,
    Compact,
    Integrate,
    GarbageCollect,
}

/// Optional timing/profiling hook invoked around each pass.
///
/// Not part of the correctness contract; the default is no observer.
pub trait PassObserver {
    fn pass_started(&mut self, pass: Pass);
    fn pass_finished(&mut self, pass: Pass);
}

/// Counters surfaced by [`SceneRep::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneStats {
    /// Allocated entries in the current view frustum, as of the last
    /// compaction.
    pub num_occupied_bricks: u32,
    /// Bricks currently on the free stack.
    pub heap_free: u32,
    /// Overflow tail slots handed out since reset.
    pub overflow_used: u32,
    /// Soft-failure counters accumulated since reset.
    pub hash: HashStats,
}

/// Spatially-hashed TSDF volume with its per-frame fusion pipeline.
pub struct SceneRep {
    params: HashParams,
    intrinsics: DepthIntrinsics,
    table: HashTable,
    heap: BrickHeap,
    voxels: Vec<Voxel>,
    scratch: CompactionScratch,
    gc_flags: Vec<u32>,
    num_occupied: u32,
    world_from_camera: Mat4,
    camera_from_world: Mat4,
    frame: u32,
    observer: Option<Box<dyn PassObserver>>,
}

impl SceneRep {
    /// Allocate every store for the configured volume.
    pub fn new(params: HashParams, intrinsics: DepthIntrinsics) -> Result<Self, FusionError> {
        params.validate()?;
        let table = HashTable::new(&params);
        let heap = BrickHeap::new(params.num_bricks);
        let voxels = vec![Voxel::EMPTY; params.voxel_count()];
        let scratch = CompactionScratch::new(params.total_slots());
        let gc_flags = vec![0; params.total_slots()];
        Ok(SceneRep {
            params,
            intrinsics,
            table,
            heap,
            voxels,
            scratch,
            gc_flags,
            num_occupied: 0,
            world_from_camera: Mat4::IDENTITY,
            camera_from_world: Mat4::IDENTITY,
            frame: 0,
            observer: None,
        })
    }

    /// Install a profiling hook invoked around each pass.
    pub fn set_observer(&mut self, observer: Box<dyn PassObserver>) {
        self.observer = Some(observer);
    }

    /// Clear the reconstruction to its initial state: frame counter
    /// zero, identity pose, empty table, full free stack, zeroed
    /// voxels.
    pub fn reset(&mut self) {
        self.frame = 0;
        self.num_occupied = 0;
        self.world_from_camera = Mat4::IDENTITY;
        self.camera_from_world = Mat4::IDENTITY;
        self.table.reset();
        self.heap.reset();
        self.voxels.fill(Voxel::EMPTY);
    }

    /// Set the camera-to-world pose for subsequent passes.
    pub fn set_pose(&mut self, world_from_camera: Mat4) {
        self.world_from_camera = world_from_camera;
        self.camera_from_world = world_from_camera.inverse();
    }

    /// The current camera-to-world pose.
    pub fn pose(&self) -> Mat4 {
        self.world_from_camera
    }

    /// World-to-camera transform derived from the pose.
    pub fn pose_inverse(&self) -> Mat4 {
        self.camera_from_world
    }

    /// Re-run compaction for a new pose without ingesting a frame.
    pub fn set_pose_and_compact(&mut self, world_from_camera: Mat4) {
        self.set_pose(world_from_camera);
        self.run_compact();
    }

    /// Ingest one depth/color frame at the given pose.
    ///
    /// Rejects the call before any pass runs when the frame or mask
    /// dimensions disagree with the configured intrinsics. Soft device
    /// conditions (heap exhausted, overflow spent, contention) never
    /// fail the call; they are counted in [`SceneRep::stats`].
    pub fn integrate(
        &mut self,
        world_from_camera: Mat4,
        depth: &Image<f32>,
        color: &Image<[u8; 4]>,
        mask: Option<&BitMask>,
    ) -> Result<(), FusionError> {
        let expected = (self.intrinsics.width, self.intrinsics.height);
        let got = (depth.width() as u32, depth.height() as u32);
        if got != expected {
            return Err(FusionError::FrameSizeMismatch { expected, got });
        }
        let color_dims = (color.width() as u32, color.height() as u32);
        if color_dims != got {
            return Err(FusionError::ColorSizeMismatch { expected: got, got: color_dims });
        }
        if let Some(m) = mask {
            let mask_dims = (m.width() as u32, m.height() as u32);
            if mask_dims != got {
                return Err(FusionError::MaskSizeMismatch { expected: got, got: mask_dims });
            }
        }

        self.set_pose(world_from_camera);

        self.observe(Pass::Alloc, |s| {
            s.table.reset_bucket_mutexes();
            alloc_pass(
                &mut s.table,
                &mut s.heap,
                &s.params,
                &s.intrinsics,
                &s.world_from_camera,
                depth,
                mask,
            );
        });

        self.observe(Pass::Compact, |s| {
            s.run_compact();
        });

        self.observe(Pass::Integrate, |s| {
            integrate_pass(
                &s.table,
                &mut s.voxels,
                &s.scratch.compacted[..s.num_occupied as usize],
                &s.params,
                &s.intrinsics,
                &s.camera_from_world,
                depth,
                color,
            );
        });

        if self.params.garbage_collect {
            self.observe(Pass::GarbageCollect, |s| s.collect());
        }

        self.table.normalize_reserved();
        self.frame += 1;

        debug!(
            frame = self.frame,
            occupied = self.num_occupied,
            heap_free = self.heap.free_count(),
            "frame integrated"
        );
        Ok(())
    }

    fn run_compact(&mut self) {
        self.num_occupied = compact_pass(
            &self.table,
            &self.params,
            &self.intrinsics,
            &self.camera_from_world,
            &mut self.scratch,
        );
    }

    /// Garbage collection: starve on period, identify, then free under
    /// freshly-reset bucket mutexes.
    fn collect(&mut self) {
        let n = self.num_occupied as usize;
        if self.frame > 0 && self.frame % self.params.starve_period == 0 {
            starve_pass(&self.table, &mut self.voxels, &self.scratch.compacted[..n]);
        }
        identify_pass(
            &self.table,
            &self.voxels,
            &self.scratch.compacted[..n],
            &self.params,
            &mut self.gc_flags[..n],
        );
        self.table.reset_bucket_mutexes();
        free_pass(
            &mut self.table,
            &mut self.heap,
            &self.scratch.compacted[..n],
            &self.gc_flags[..n],
        );
    }

    fn observe(&mut self, pass: Pass, f: impl FnOnce(&mut Self)) {
        if let Some(mut obs) = self.observer.take() {
            obs.pass_started(pass);
            f(self);
            obs.pass_finished(pass);
            self.observer = Some(obs);
        } else {
            f(self);
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn params(&self) -> &HashParams {
        &self.params
    }

    pub fn intrinsics(&self) -> &DepthIntrinsics {
        &self.intrinsics
    }

    pub fn hash_table(&self) -> &HashTable {
        &self.table
    }

    pub fn heap(&self) -> &BrickHeap {
        &self.heap
    }

    pub fn voxels(&self) -> &[Voxel] {
        &self.voxels
    }

    /// Frames integrated since the last reset.
    pub fn frame_count(&self) -> u32 {
        self.frame
    }

    /// Allocated in-frustum entries as of the last compaction.
    pub fn num_occupied_bricks(&self) -> u32 {
        self.num_occupied
    }

    /// Slot indices produced by the last compaction.
    pub fn compacted_slots(&self) -> &[u32] {
        &self.scratch.compacted[..self.num_occupied as usize]
    }

    pub fn stats(&self) -> SceneStats {
        SceneStats {
            num_occupied_bricks: self.num_occupied,
            heap_free: self.heap.free_count(),
            overflow_used: self.table.overflow_used(),
            hash: self.table.stats(),
        }
    }

    /// The voxel containing a world-space point, if its brick is
    /// allocated.
    pub fn voxel_at(&self, world: Vec3) -> Option<Voxel> {
        let grid = (world / self.params.voxel_size).floor().as_ivec3();
        let b = BRICK_SIZE as i32;
        let brick = IVec3::new(
            grid.x.div_euclid(b),
            grid.y.div_euclid(b),
            grid.z.div_euclid(b),
        );
        let local = grid - brick * b;
        let ptr = self.table.lookup(brick)?;
        let idx = crate::voxel::voxel_index(local.x as usize, local.y as usize, local.z as usize);
        Some(self.voxels[ptr as usize * BRICK_VOLUME + idx])
    }

    /// Full disjointness and reachability check of the heap/table
    /// relationship. A violation is an implementation bug, never a
    /// consequence of input data.
    pub fn check_consistency(&self) -> Result<HeapReport, ConsistencyError> {
        self.table.check_consistency(&self.heap)
    }
}
