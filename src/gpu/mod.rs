// gpu/mod.rs -- wgpu device layer.
//
// Device mirror of the CPU pipeline. The CPU implementation in the
// parent crate is the authoritative reference; every kernel is
// validated against it in the subprocess-isolated GPU tests.
//
// Architecture: the GPU runs every per-frame pass (alloc, decision,
// scatter, integrate, collect, normalize); the CPU orchestrates between
// kernels and computes the prefix sum at the compaction boundary from a
// small decision-array readback.

pub mod buffers;
pub mod device;
pub mod scene;

pub use device::{GpuDevice, GpuError};
pub use scene::GpuSceneRep;
