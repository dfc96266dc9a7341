// gpu/scene.rs -- GPU scene representation: compiles the kernel
// pipelines and sequences them per frame.
//
// Drop-in device mirror of scene.rs; the CPU `SceneRep` remains the
// authoritative semantics and the GPU tests compare against it.
//
// STAGE ALLOCATION
// ----------------
//   Stage               CPU or GPU   Notes
//   -----------------   ----------   ----------------------------------
//   Frame upload        GPU          depth/color textures, mask buffer
//   Mutex reset         GPU          clear_buffer
//   Alloc               GPU          alloc.wgsl, one thread per pixel
//   Decision fill       GPU          compact.wgsl
//   Prefix sum          CPU          scan.rs over a decision readback,
//                                    prefix re-uploaded
//   Scatter             GPU          compact.wgsl
//   Integrate / starve  GPU          integrate.wgsl, workgroup pair per
//                                    brick
//   GC identify/free    GPU          garbage.wgsl
//   Normalize reserved  GPU          garbage.wgsl, one thread per bucket
//
// The scan boundary is the one mandatory readback per frame; the
// decision array is num_slots u32s, small next to the frame upload.

use glam::Mat4;
use tracing::debug;

use crate::camera::DepthIntrinsics;
use crate::error::{ConsistencyError, FusionError};
use crate::hash::{check_snapshot, HashStats, HeapReport};
use crate::image::{BitMask, Image};
use crate::params::HashParams;
use crate::scan::exclusive_prefix_sum;
use crate::scene::SceneStats;
use crate::voxel::{HashEntry, Voxel};

use super::buffers::{
    GpuParams, GpuSceneBuffers, STAT_CONTENTION_LOST, STAT_HEAP_EXHAUSTED,
    STAT_OVERFLOW_EXHAUSTED,
};
use super::device::GpuDevice;

const PARAMS_WGSL: &str = include_str!("../shaders/params.wgsl");
const HASH_COMMON_WGSL: &str = include_str!("../shaders/hash_common.wgsl");
const ALLOC_WGSL: &str = include_str!("../shaders/alloc.wgsl");
const COMPACT_WGSL: &str = include_str!("../shaders/compact.wgsl");
const INTEGRATE_WGSL: &str = include_str!("../shaders/integrate.wgsl");
const GARBAGE_WGSL: &str = include_str!("../shaders/garbage.wgsl");

/// GPU-resident reconstruction with its per-frame fusion pipeline.
///
/// Create once with [`GpuSceneRep::new`]; call [`integrate`] each
/// frame. All pipelines are compiled and all buffers allocated at
/// construction time.
///
/// [`integrate`]: GpuSceneRep::integrate
pub struct GpuSceneRep {
    params: HashParams,
    intrinsics: DepthIntrinsics,
    buffers: GpuSceneBuffers,

    alloc_pipeline: wgpu::ComputePipeline,
    fill_decision_pipeline: wgpu::ComputePipeline,
    compact_scatter_pipeline: wgpu::ComputePipeline,
    integrate_pipeline: wgpu::ComputePipeline,
    starve_pipeline: wgpu::ComputePipeline,
    gc_identify_pipeline: wgpu::ComputePipeline,
    gc_free_pipeline: wgpu::ComputePipeline,
    normalize_pipeline: wgpu::ComputePipeline,

    hash_bg0: wgpu::BindGroup,
    read_bg0: wgpu::BindGroup,
    alloc_bg1: wgpu::BindGroup,
    compact_bg1: wgpu::BindGroup,
    integrate_bg1: wgpu::BindGroup,
    garbage_bg1: wgpu::BindGroup,

    prefix_scratch: Vec<u32>,
    world_from_camera: Mat4,
    camera_from_world: Mat4,
    frame: u32,
    num_occupied: u32,
}

impl GpuSceneRep {
    pub fn new(
        gpu: &GpuDevice,
        params: HashParams,
        intrinsics: DepthIntrinsics,
    ) -> Result<Self, FusionError> {
        params.validate()?;
        let buffers = GpuSceneBuffers::new(gpu, &params, &intrinsics);

        // --- Shader modules ---
        // params.wgsl is prepended to every module; the two mutating
        // modules also share hash_common.wgsl. Workgroup dimensions are
        // baked into the source (naga does not accept overrides in
        // @workgroup_size).
        let alloc_src = format!(
            "{PARAMS_WGSL}\n{HASH_COMMON_WGSL}\n{}",
            ALLOC_WGSL
                .replace("{{WG_X}}", &gpu.workgroup_size.x.to_string())
                .replace("{{WG_Y}}", &gpu.workgroup_size.y.to_string())
        );
        let compact_src = format!("{PARAMS_WGSL}\n{COMPACT_WGSL}");
        let integrate_src = format!("{PARAMS_WGSL}\n{INTEGRATE_WGSL}");
        let garbage_src = format!("{PARAMS_WGSL}\n{HASH_COMMON_WGSL}\n{GARBAGE_WGSL}");

        let module = |label: &str, src: String| {
            gpu.device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(label),
                    source: wgpu::ShaderSource::Wgsl(src.into()),
                })
        };
        let alloc_module = module("alloc.wgsl", alloc_src);
        let compact_module = module("compact.wgsl", compact_src);
        let integrate_module = module("integrate.wgsl", integrate_src);
        let garbage_module = module("garbage.wgsl", garbage_src);

        // --- Bind group layouts ---
        // group 0 "hash": params uniform plus the mutable table state,
        // shared by the alloc and garbage modules.
        let hash_bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("voxhash hash BGL"),
            entries: &[
                uniform_entry(0),
                storage_entry(1, false), // hash entries
                storage_entry(2, false), // bucket mutexes
                storage_entry(3, false), // heap
                storage_entry(4, false), // heap counter
                storage_entry(5, false), // stats
            ],
        });
        // group 0 "read": params uniform plus a read-only view of the
        // table, for the compact and integrate modules.
        let read_bgl = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("voxhash read BGL"),
            entries: &[uniform_entry(0), storage_entry(1, true)],
        });

        let alloc_bgl1 = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("voxhash alloc BGL1"),
            entries: &[
                texture_entry(0),
                storage_entry(1, true),  // mask words
                storage_entry(2, false), // overflow counter
            ],
        });
        let compact_bgl1 = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("voxhash compact BGL1"),
            entries: &[
                storage_entry(0, false), // decision
                storage_entry(1, true),  // prefix
                storage_entry(2, false), // compacted
            ],
        });
        let integrate_bgl1 = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("voxhash integrate BGL1"),
            entries: &[
                storage_entry(0, true),  // compacted
                storage_entry(1, false), // voxels
                texture_entry(2),        // depth
                texture_entry(3),        // color
            ],
        });
        let garbage_bgl1 = gpu.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("voxhash garbage BGL1"),
            entries: &[
                storage_entry(0, true),  // compacted
                storage_entry(1, false), // voxels
                storage_entry(2, false), // gc flags
            ],
        });

        // --- Pipelines ---
        let pipeline = |label: &str,
                        module: &wgpu::ShaderModule,
                        entry: &str,
                        bgls: &[&wgpu::BindGroupLayout]| {
            let layout = gpu
                .device
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(label),
                    bind_group_layouts: bgls,
                    push_constant_ranges: &[],
                });
            gpu.device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(label),
                    layout: Some(&layout),
                    module,
                    entry_point: entry,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    cache: None,
                })
        };

        let alloc_pipeline =
            pipeline("alloc_bricks", &alloc_module, "alloc_bricks", &[&hash_bgl, &alloc_bgl1]);
        let fill_decision_pipeline = pipeline(
            "fill_decision",
            &compact_module,
            "fill_decision",
            &[&read_bgl, &compact_bgl1],
        );
        let compact_scatter_pipeline = pipeline(
            "compact_scatter",
            &compact_module,
            "compact_scatter",
            &[&read_bgl, &compact_bgl1],
        );
        let integrate_pipeline = pipeline(
            "integrate_bricks",
            &integrate_module,
            "integrate_bricks",
            &[&read_bgl, &integrate_bgl1],
        );
        let starve_pipeline = pipeline(
            "starve_bricks",
            &integrate_module,
            "starve_bricks",
            &[&read_bgl, &integrate_bgl1],
        );
        let gc_identify_pipeline = pipeline(
            "gc_identify",
            &garbage_module,
            "gc_identify",
            &[&hash_bgl, &garbage_bgl1],
        );
        let gc_free_pipeline =
            pipeline("gc_free", &garbage_module, "gc_free", &[&hash_bgl, &garbage_bgl1]);
        let normalize_pipeline = pipeline(
            "normalize_reserved",
            &garbage_module,
            "normalize_reserved",
            &[&hash_bgl, &garbage_bgl1],
        );

        // --- Bind groups (buffers never resize, so these live for the
        // session) ---
        let hash_bg0 = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("voxhash hash BG0"),
            layout: &hash_bgl,
            entries: &[
                bind(0, &buffers.params_buf),
                bind(1, &buffers.hash_buf),
                bind(2, &buffers.mutex_buf),
                bind(3, &buffers.heap_buf),
                bind(4, &buffers.heap_counter_buf),
                bind(5, &buffers.stats_buf),
            ],
        });
        let read_bg0 = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("voxhash read BG0"),
            layout: &read_bgl,
            entries: &[bind(0, &buffers.params_buf), bind(1, &buffers.hash_buf)],
        });
        let alloc_bg1 = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("voxhash alloc BG1"),
            layout: &alloc_bgl1,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&buffers.depth_view),
                },
                bind(1, &buffers.mask_buf),
                bind(2, &buffers.overflow_counter_buf),
            ],
        });
        let compact_bg1 = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("voxhash compact BG1"),
            layout: &compact_bgl1,
            entries: &[
                bind(0, &buffers.decision_buf),
                bind(1, &buffers.prefix_buf),
                bind(2, &buffers.compacted_buf),
            ],
        });
        let integrate_bg1 = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("voxhash integrate BG1"),
            layout: &integrate_bgl1,
            entries: &[
                bind(0, &buffers.compacted_buf),
                bind(1, &buffers.voxel_buf),
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&buffers.depth_view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(&buffers.color_view),
                },
            ],
        });
        let garbage_bg1 = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("voxhash garbage BG1"),
            layout: &garbage_bgl1,
            entries: &[
                bind(0, &buffers.compacted_buf),
                bind(1, &buffers.voxel_buf),
                bind(2, &buffers.gc_flags_buf),
            ],
        });

        let prefix_scratch = vec![0u32; params.total_slots()];
        let scene = GpuSceneRep {
            params,
            intrinsics,
            buffers,
            alloc_pipeline,
            fill_decision_pipeline,
            compact_scatter_pipeline,
            integrate_pipeline,
            starve_pipeline,
            gc_identify_pipeline,
            gc_free_pipeline,
            normalize_pipeline,
            hash_bg0,
            read_bg0,
            alloc_bg1,
            compact_bg1,
            integrate_bg1,
            garbage_bg1,
            prefix_scratch,
            world_from_camera: Mat4::IDENTITY,
            camera_from_world: Mat4::IDENTITY,
            frame: 0,
            num_occupied: 0,
        };
        scene.buffers.reset(gpu);
        Ok(scene)
    }

    /// Clear the reconstruction to its initial state.
    pub fn reset(&mut self, gpu: &GpuDevice) {
        self.frame = 0;
        self.num_occupied = 0;
        self.world_from_camera = Mat4::IDENTITY;
        self.camera_from_world = Mat4::IDENTITY;
        self.buffers.reset(gpu);
    }

    pub fn set_pose(&mut self, world_from_camera: Mat4) {
        self.world_from_camera = world_from_camera;
        self.camera_from_world = world_from_camera.inverse();
    }

    pub fn pose(&self) -> Mat4 {
        self.world_from_camera
    }

    pub fn frame_count(&self) -> u32 {
        self.frame
    }

    pub fn num_occupied_bricks(&self) -> u32 {
        self.num_occupied
    }

    pub fn params(&self) -> &HashParams {
        &self.params
    }

    /// Ingest one depth/color frame at the given pose.
    pub fn integrate(
        &mut self,
        gpu: &GpuDevice,
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
        let starve = self.params.garbage_collect
            && self.frame > 0
            && self.frame % self.params.starve_period == 0;

        self.buffers
            .write_params(gpu, &self.gpu_params(0, starve, mask.is_some()));
        self.buffers.upload_depth(gpu, depth);
        self.buffers.upload_color(gpu, color);
        self.buffers.upload_mask(gpu, mask);

        // Alloc + decision fill in one submission.
        let total_slots = self.params.total_slots() as u32;
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("GpuSceneRep::alloc"),
            });
        self.buffers.clear_mutexes(&mut encoder);
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("alloc_bricks"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.alloc_pipeline);
            pass.set_bind_group(0, &self.hash_bg0, &[]);
            pass.set_bind_group(1, &self.alloc_bg1, &[]);
            let (dx, dy) = gpu.dispatch_2d(self.intrinsics.width, self.intrinsics.height);
            pass.dispatch_workgroups(dx, dy, 1);
        }
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("fill_decision"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.fill_decision_pipeline);
            pass.set_bind_group(0, &self.read_bg0, &[]);
            pass.set_bind_group(1, &self.compact_bg1, &[]);
            pass.dispatch_workgroups(gpu.dispatch_1d(total_slots), 1, 1);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));

        // Scan boundary: decision readback, host prefix sum, re-upload.
        let decision = self.buffers.read_decision(gpu);
        let total = exclusive_prefix_sum(&decision, &mut self.prefix_scratch);
        self.buffers.write_prefix(gpu, &self.prefix_scratch);
        self.num_occupied = total;
        self.buffers
            .write_params(gpu, &self.gpu_params(total, starve, mask.is_some()));

        // Scatter, integrate, collect, normalize in one submission.
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("GpuSceneRep::integrate"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("compact_scatter"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.compact_scatter_pipeline);
            pass.set_bind_group(0, &self.read_bg0, &[]);
            pass.set_bind_group(1, &self.compact_bg1, &[]);
            pass.dispatch_workgroups(gpu.dispatch_1d(total_slots), 1, 1);
        }
        if total > 0 {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("integrate_bricks"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.integrate_pipeline);
            pass.set_bind_group(0, &self.read_bg0, &[]);
            pass.set_bind_group(1, &self.integrate_bg1, &[]);
            // One workgroup pair (two z halves) per compacted brick.
            pass.dispatch_workgroups(total, 2, 1);
        }
        if self.params.garbage_collect && total > 0 {
            if starve {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("starve_bricks"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.starve_pipeline);
                pass.set_bind_group(0, &self.read_bg0, &[]);
                pass.set_bind_group(1, &self.integrate_bg1, &[]);
                pass.dispatch_workgroups(total, 2, 1);
            }
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("gc_identify"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.gc_identify_pipeline);
                pass.set_bind_group(0, &self.hash_bg0, &[]);
                pass.set_bind_group(1, &self.garbage_bg1, &[]);
                pass.dispatch_workgroups((total + 63) / 64, 1, 1);
            }
            self.buffers.clear_mutexes(&mut encoder);
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("gc_free"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.gc_free_pipeline);
                pass.set_bind_group(0, &self.hash_bg0, &[]);
                pass.set_bind_group(1, &self.garbage_bg1, &[]);
                pass.dispatch_workgroups((total + 63) / 64, 1, 1);
            }
        }
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("normalize_reserved"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.normalize_pipeline);
            pass.set_bind_group(0, &self.hash_bg0, &[]);
            pass.set_bind_group(1, &self.garbage_bg1, &[]);
            pass.dispatch_workgroups((self.params.num_buckets + 63) / 64, 1, 1);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));

        self.frame += 1;
        debug!(frame = self.frame, occupied = total, "gpu frame integrated");
        Ok(())
    }

    fn gpu_params(&self, num_occupied: u32, starve: bool, use_mask: bool) -> GpuParams {
        GpuParams {
            world_from_camera: self.world_from_camera.to_cols_array(),
            camera_from_world: self.camera_from_world.to_cols_array(),
            fx: self.intrinsics.fx,
            fy: self.intrinsics.fy,
            cx: self.intrinsics.cx,
            cy: self.intrinsics.cy,
            img_width: self.intrinsics.width,
            img_height: self.intrinsics.height,
            num_buckets: self.params.num_buckets,
            bucket_size: self.params.bucket_size,
            num_overflow_slots: self.params.num_overflow_slots,
            max_chain_length: self.params.max_chain_length,
            num_bricks: self.params.num_bricks,
            num_occupied,
            voxel_size: self.params.voxel_size,
            truncation: self.params.truncation,
            trunc_scale: self.params.trunc_scale,
            max_integration_distance: self.params.max_integration_distance,
            weight_sample: self.params.integration_weight_sample,
            weight_max: self.params.integration_weight_max,
            starve_frame: starve as u32,
            use_mask: use_mask as u32,
            gc_sdf_threshold: self.params.gc_sdf_threshold,
            _pad: [0; 3],
        }
    }

    // -----------------------------------------------------------------------
    // Readback (stats, snapshots, checker)
    // -----------------------------------------------------------------------

    /// Diagnostic counters, read back from the device.
    pub fn stats(&self, gpu: &GpuDevice) -> SceneStats {
        let words = self.buffers.read_stats(gpu);
        let (_, counter) = self.buffers.read_heap(gpu);
        SceneStats {
            num_occupied_bricks: self.num_occupied,
            heap_free: (counter + 1) as u32,
            overflow_used: self
                .buffers
                .read_overflow_counter(gpu)
                .min(self.params.num_overflow_slots),
            hash: HashStats {
                heap_exhausted: words[STAT_HEAP_EXHAUSTED],
                overflow_exhausted: words[STAT_OVERFLOW_EXHAUSTED],
                contention_lost: words[STAT_CONTENTION_LOST],
            },
        }
    }

    /// Download the hash table.
    pub fn download_entries(&self, gpu: &GpuDevice) -> Vec<HashEntry> {
        self.buffers.read_entries(gpu)
    }

    /// Download the voxel pool.
    pub fn download_voxels(&self, gpu: &GpuDevice) -> Vec<Voxel> {
        self.buffers.read_voxels(gpu)
    }

    /// Run the disjointness/reachability checker on a device snapshot.
    pub fn check_consistency(&self, gpu: &GpuDevice) -> Result<HeapReport, ConsistencyError> {
        let entries = self.buffers.read_entries(gpu);
        let (heap, counter) = self.buffers.read_heap(gpu);
        let free = &heap[..(counter + 1) as usize];
        check_snapshot(
            &entries,
            free,
            self.params.num_bricks,
            self.params.num_buckets,
            self.params.bucket_size,
        )
    }
}

fn bind(binding: u32, buffer: &wgpu::Buffer) -> wgpu::BindGroupEntry<'_> {
    wgpu::BindGroupEntry {
        binding,
        resource: buffer.as_entire_binding(),
    }
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn texture_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Texture {
            multisampled: false,
            view_dimension: wgpu::TextureViewDimension::D2,
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
        },
        count: None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::SceneRep;
    use glam::IVec3;

    // GPU integration tests run in a child process: dzn (the
    // D3D12-to-Vulkan layer on WSL2) SIGSEGVs in its own atexit handler
    // after any Vulkan device existed in the process. The inner tests
    // print GPU_TEST_OK before returning; the outer wrappers only check
    // for that token, not the child's exit status.

    fn run_gpu_test_in_subprocess(test_name: &str) -> String {
        let output = std::process::Command::new("cargo")
            .args([
                "test", "--lib", "--",
                test_name, "--exact", "--ignored", "--nocapture",
            ])
            .output()
            .unwrap_or_else(|e| panic!("failed to spawn subprocess for {test_name}: {e}"));
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        print!("{stdout}");
        eprint!("{stderr}");
        stdout + &stderr
    }

    fn test_params() -> HashParams {
        HashParams {
            num_buckets: 512,
            bucket_size: 4,
            num_overflow_slots: 256,
            max_chain_length: 6,
            num_bricks: 1024,
            voxel_size: 0.01,
            truncation: 0.04,
            max_integration_distance: 4.0,
            integration_weight_sample: 2,
            garbage_collect: true,
            starve_period: 1,
            ..Default::default()
        }
    }

    fn test_intrinsics() -> DepthIntrinsics {
        DepthIntrinsics::new(64.0, 64.0, 31.5, 23.5, 64, 48)
    }

    fn plane_depth(intr: &DepthIntrinsics, d: f32) -> Image<f32> {
        Image::filled(intr.width as usize, intr.height as usize, d)
    }

    fn gray_color(intr: &DepthIntrinsics) -> Image<[u8; 4]> {
        Image::filled(intr.width as usize, intr.height as usize, [90, 120, 150, 255])
    }

    // ---- Inner tests --------------------------------------------------------

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_gpu_matches_cpu_single_frame() {
        let params = test_params();
        let intr = test_intrinsics();
        let depth = plane_depth(&intr, 1.0);
        let color = gray_color(&intr);

        let mut cpu = SceneRep::new(params.clone(), intr).unwrap();
        cpu.integrate(Mat4::IDENTITY, &depth, &color, None).unwrap();

        let gpu = GpuDevice::new().expect("need Vulkan GPU");
        let mut scene = GpuSceneRep::new(&gpu, params.clone(), intr).unwrap();
        scene
            .integrate(&gpu, Mat4::IDENTITY, &depth, &color, None)
            .unwrap();

        assert_eq!(
            scene.num_occupied_bricks(),
            cpu.num_occupied_bricks(),
            "occupied count differs"
        );
        scene.check_consistency(&gpu).unwrap();

        // Same brick set.
        let gpu_entries = scene.download_entries(&gpu);
        let mut gpu_bricks: Vec<IVec3> = gpu_entries
            .iter()
            .filter(|e| e.is_allocated())
            .map(|e| e.pos())
            .collect();
        let mut cpu_bricks: Vec<IVec3> = cpu
            .hash_table()
            .entries()
            .iter()
            .filter(|e| e.is_allocated())
            .map(|e| e.pos())
            .collect();
        let key = |p: &IVec3| (p.z, p.y, p.x);
        gpu_bricks.sort_by_key(key);
        cpu_bricks.sort_by_key(key);
        assert_eq!(gpu_bricks, cpu_bricks, "allocated brick sets differ");

        // Same fused values, voxel for voxel.
        let gpu_voxels = scene.download_voxels(&gpu);
        let cpu_voxels = cpu.voxels();
        for e in gpu_entries.iter().filter(|e| e.is_allocated()) {
            let cpu_ptr = cpu.hash_table().lookup(e.pos()).unwrap() as usize;
            let gpu_base = e.ptr as usize * crate::voxel::BRICK_VOLUME;
            let cpu_base = cpu_ptr * crate::voxel::BRICK_VOLUME;
            for i in 0..crate::voxel::BRICK_VOLUME {
                let g = gpu_voxels[gpu_base + i];
                let c = cpu_voxels[cpu_base + i];
                assert_eq!(g.weight(), c.weight(), "weight diverges at {:?}/{i}", e.pos());
                assert!(
                    (g.sdf - c.sdf).abs() < 1e-4,
                    "sdf diverges at {:?}/{i}: gpu={} cpu={}",
                    e.pos(), g.sdf, c.sdf
                );
                assert_eq!(g.color(), c.color(), "color diverges at {:?}/{i}", e.pos());
            }
        }

        println!("GPU_TEST_OK");
        drop(scene);
        drop(gpu);
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_gpu_empty_frame_is_noop() {
        let params = test_params();
        let intr = test_intrinsics();
        let depth = plane_depth(&intr, 0.0);
        let color = gray_color(&intr);

        let gpu = GpuDevice::new().expect("need Vulkan GPU");
        let mut scene = GpuSceneRep::new(&gpu, params.clone(), intr).unwrap();
        scene
            .integrate(&gpu, Mat4::IDENTITY, &depth, &color, None)
            .unwrap();

        let stats = scene.stats(&gpu);
        assert_eq!(stats.num_occupied_bricks, 0);
        assert_eq!(stats.heap_free, params.num_bricks);
        assert_eq!(stats.overflow_used, 0);
        scene.check_consistency(&gpu).unwrap();

        println!("GPU_TEST_OK");
        drop(scene);
        drop(gpu);
    }

    #[test]
    #[ignore = "GPU integration: run via outer subprocess wrapper"]
    fn inner_gpu_garbage_collection_reclaims() {
        let params = test_params(); // starve_period 1, weight_sample 2
        let intr = test_intrinsics();
        let surface = plane_depth(&intr, 1.0);
        let invalid = plane_depth(&intr, 0.0);
        let color = gray_color(&intr);

        let gpu = GpuDevice::new().expect("need Vulkan GPU");
        let mut scene = GpuSceneRep::new(&gpu, params.clone(), intr).unwrap();
        scene
            .integrate(&gpu, Mat4::IDENTITY, &surface, &color, None)
            .unwrap();
        assert!(scene.num_occupied_bricks() > 0);

        // Starve every frame; a few invalid frames zero the weights and
        // the collector frees everything.
        for _ in 0..4 {
            scene
                .integrate(&gpu, Mat4::IDENTITY, &invalid, &color, None)
                .unwrap();
        }
        let stats = scene.stats(&gpu);
        assert_eq!(stats.num_occupied_bricks, 0, "all bricks collected");
        assert_eq!(stats.heap_free, params.num_bricks, "heap fully restored");
        scene.check_consistency(&gpu).unwrap();

        println!("GPU_TEST_OK");
        drop(scene);
        drop(gpu);
    }

    // ---- Outer wrappers -----------------------------------------------------

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_gpu_matches_cpu_single_frame() {
        let out = run_gpu_test_in_subprocess(
            "gpu::scene::tests::inner_gpu_matches_cpu_single_frame",
        );
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_gpu_empty_frame_is_noop() {
        let out =
            run_gpu_test_in_subprocess("gpu::scene::tests::inner_gpu_empty_frame_is_noop");
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }

    #[test]
    #[ignore = "requires a real Vulkan GPU"]
    fn test_gpu_garbage_collection_reclaims() {
        let out = run_gpu_test_in_subprocess(
            "gpu::scene::tests::inner_gpu_garbage_collection_reclaims",
        );
        assert!(out.contains("GPU_TEST_OK"), "inner test failed:\n{out}");
    }
}
