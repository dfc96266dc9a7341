// voxhash: GPU voxel-hashed TSDF fusion.
// CPU reference implementation of the pipeline, mirrored by wgpu
// compute kernels under gpu/.
//
// Reference: Niessner, Zollhoefer, Izadi, Stamminger -- "Real-time 3D
// Reconstruction at Scale using Voxel Hashing" (SIGGRAPH Asia 2013)

pub mod alloc;
pub mod camera;
pub mod compact;
pub mod error;
pub mod garbage;
pub mod hash;
pub mod heap;
pub mod image;
pub mod integrate;
pub mod params;
pub mod scan;
pub mod scene;
pub mod voxel;

pub mod gpu;
