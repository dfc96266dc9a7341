// params.rs -- Reconstruction volume configuration.
//
// Geometry and threshold configuration for a fusion session. All device
// buffers are sized from these values at construction and never resized;
// `SceneRep` and `GpuSceneRep` take the struct by value and keep it
// immutable for their lifetime. The camera pose is not part of this
// struct: it is per-frame state owned by the orchestrator.

use crate::error::FusionError;
use crate::voxel::{BRICK_SIZE, BRICK_VOLUME};

/// Configuration of the hash table, brick heap, and integration
/// thresholds.
#[derive(Debug, Clone)]
pub struct HashParams {
    /// Number of hash buckets.
    pub num_buckets: u32,
    /// Contiguous head slots per bucket.
    pub bucket_size: u32,
    /// Capacity of the shared overflow tail region.
    pub num_overflow_slots: u32,
    /// Upper bound on overflow chain length per bucket.
    pub max_chain_length: u32,
    /// Bricks in the heap pool.
    pub num_bricks: u32,
    /// Voxel edge length in meters.
    pub voxel_size: f32,
    /// Depth samples beyond this distance are ignored (meters).
    pub max_integration_distance: f32,
    /// Base truncation band in meters.
    pub truncation: f32,
    /// Depth-proportional truncation growth: the band at depth `d` is
    /// `truncation * (1 + trunc_scale * d)`.
    pub trunc_scale: f32,
    /// Weight contributed by one depth sample.
    pub integration_weight_sample: u32,
    /// Saturation cap for accumulated voxel weight (at most 255).
    pub integration_weight_max: u32,
    /// Run the garbage collection pass each frame.
    pub garbage_collect: bool,
    /// Starve (decrement all weights) every this many frames.
    pub starve_period: u32,
    /// A brick is collected when its min |sdf| exceeds this fraction of
    /// the truncation band.
    pub gc_sdf_threshold: f32,
}

impl Default for HashParams {
    fn default() -> Self {
        HashParams {
            num_buckets: 65_536,
            bucket_size: 10,
            num_overflow_slots: 65_536,
            max_chain_length: 7,
            num_bricks: 65_536,
            voxel_size: 0.004,
            max_integration_distance: 4.0,
            truncation: 0.02,
            trunc_scale: 0.01,
            integration_weight_sample: 10,
            integration_weight_max: 255,
            garbage_collect: true,
            starve_period: 15,
            gc_sdf_threshold: 1.0,
        }
    }
}

impl HashParams {
    /// Reject configurations the pipeline cannot run on.
    pub fn validate(&self) -> Result<(), FusionError> {
        let fail = |msg: &str| Err(FusionError::InvalidParams(msg.to_string()));
        if self.num_buckets == 0 {
            return fail("num_buckets must be nonzero");
        }
        if self.bucket_size == 0 {
            return fail("bucket_size must be nonzero");
        }
        if self.num_bricks == 0 {
            return fail("num_bricks must be nonzero");
        }
        if self.max_chain_length == 0 {
            return fail("max_chain_length must be nonzero");
        }
        if !(self.voxel_size > 0.0) {
            return fail("voxel_size must be positive");
        }
        if !(self.truncation > 0.0) {
            return fail("truncation must be positive");
        }
        if !(self.max_integration_distance > 0.0) {
            return fail("max_integration_distance must be positive");
        }
        if self.trunc_scale < 0.0 {
            return fail("trunc_scale must be non-negative");
        }
        if self.integration_weight_sample == 0 {
            return fail("integration_weight_sample must be nonzero");
        }
        if self.integration_weight_max > 255 {
            return fail("integration_weight_max exceeds the packed 8-bit weight");
        }
        if self.integration_weight_max < self.integration_weight_sample {
            return fail("integration_weight_max below integration_weight_sample");
        }
        if self.garbage_collect && self.starve_period == 0 {
            return fail("starve_period must be nonzero when garbage collection is on");
        }
        Ok(())
    }

    /// Head slots in the table (`num_buckets * bucket_size`).
    pub fn head_slots(&self) -> usize {
        self.num_buckets as usize * self.bucket_size as usize
    }

    /// Head plus overflow slots; the length of the decision, prefix, and
    /// compaction arrays.
    pub fn total_slots(&self) -> usize {
        self.head_slots() + self.num_overflow_slots as usize
    }

    /// Total voxel count of the brick pool.
    pub fn voxel_count(&self) -> usize {
        self.num_bricks as usize * BRICK_VOLUME
    }

    /// World-space edge length of one brick in meters.
    pub fn brick_world_size(&self) -> f32 {
        BRICK_SIZE as f32 * self.voxel_size
    }

    /// Truncation band at the given depth.
    pub fn truncation_at(&self, depth: f32) -> f32 {
        self.truncation * (1.0 + self.trunc_scale * depth)
    }
}
