// gpu/device.rs -- wgpu device abstraction.
//
// Responsibilities:
//   - Enumerate Vulkan adapters and select the first non-CPU one.
//   - Request device limits sized for the configured volume: the voxel
//     pool is by far the largest binding and routinely exceeds wgpu's
//     default 128 MiB storage-binding cap.
//   - Dispatch helpers for the three kernel shapes used by the
//     pipeline: per-pixel (2D), per-slot/per-bucket (1D), per-voxel
//     (one workgroup pair per brick).
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` uses power preference heuristics
// that may grab llvmpipe/softpipe on WSL2 (where the software renderer
// appears as a valid Vulkan device). We enumerate explicitly and prefer
// real hardware, falling back to whatever exists.

use std::fmt;

use tracing::info;

use crate::params::HashParams;
use crate::voxel::{HashEntry, Voxel, BRICK_VOLUME};

/// Workgroup shape for the per-pixel allocation kernel.
///
/// Both dimensions are baked into the shader source at pipeline
/// creation. 16x8 = 128 invocations: four 32-wide warps, two 64-wide
/// wavefronts, and a cache-line-aligned x extent for row-major frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl Default for WorkgroupSize {
    fn default() -> Self {
        WorkgroupSize { x: 16, y: 8 }
    }
}

/// Threads per workgroup for the 1D slot/bucket kernels. Must match the
/// `@workgroup_size` of the WGSL entry points.
pub const LINEAR_WORKGROUP: u32 = 256;

/// Cached adapter information for logging and debugging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}, {:?})", self.name, self.backend, self.device_type)
    }
}

/// The core GPU context: adapter, device, queue.
///
/// Create one per process with [`GpuDevice::for_volume`] and keep it for
/// the lifetime of the reconstruction; device creation is expensive.
///
/// # Field drop order
/// Rust drops struct fields in declaration order. `_instance` is
/// declared last so the `wgpu::Instance` outlives `device` and `queue`;
/// dzn (the D3D12-to-Vulkan layer on WSL2) crashes when the Vulkan
/// instance dies while device-level objects still reference it.
pub struct GpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_info: AdapterInfo,
    pub workgroup_size: WorkgroupSize,
    _instance: wgpu::Instance,
}

impl GpuDevice {
    /// Create a device able to host the volume described by `params`.
    ///
    /// # Errors
    /// Returns `Err` if no suitable adapter is found or the adapter
    /// cannot satisfy the required buffer sizes.
    pub fn for_volume(params: &HashParams) -> Result<Self, GpuError> {
        pollster::block_on(Self::init_async(required_limits(params)))
    }

    /// Create a device with wgpu's default limits; enough for test-sized
    /// volumes.
    pub fn new() -> Result<Self, GpuError> {
        pollster::block_on(Self::init_async(wgpu::Limits::default()))
    }

    async fn init_async(limits: wgpu::Limits) -> Result<Self, GpuError> {
        // Vulkan only; ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER lets wgpu
        // enumerate dzn on WSL2, which is compute-complete despite its
        // non-conformance warning.
        let flags = if cfg!(debug_assertions) {
            wgpu::InstanceFlags::VALIDATION
                | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        } else {
            wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
        };

        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::VULKAN,
            flags,
            ..Default::default()
        });

        let all_adapters: Vec<wgpu::Adapter> = instance
            .enumerate_adapters(wgpu::Backends::VULKAN)
            .into_iter()
            .collect();
        if all_adapters.is_empty() {
            return Err(GpuError::NoSuitableAdapter);
        }
        for a in &all_adapters {
            let i = a.get_info();
            info!(name = %i.name, backend = ?i.backend, device_type = ?i.device_type,
                "vulkan adapter");
        }

        // Prefer real hardware; take anything as a last resort.
        let adapter = all_adapters
            .into_iter()
            .find(|a| {
                matches!(
                    a.get_info().device_type,
                    wgpu::DeviceType::DiscreteGpu
                        | wgpu::DeviceType::IntegratedGpu
                        | wgpu::DeviceType::VirtualGpu
                        | wgpu::DeviceType::Other
                )
            })
            .or_else(|| {
                instance
                    .enumerate_adapters(wgpu::Backends::VULKAN)
                    .into_iter()
                    .next()
            })
            .ok_or(GpuError::NoSuitableAdapter)?;

        let raw_info = adapter.get_info();
        let adapter_info = AdapterInfo {
            name: raw_info.name.clone(),
            vendor: raw_info.vendor,
            device: raw_info.device,
            device_type: raw_info.device_type,
            backend: raw_info.backend,
        };

        let (device, queue): (wgpu::Device, wgpu::Queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("voxhash"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits,
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
            .map_err(GpuError::DeviceRequest)?;

        info!(adapter = %adapter_info, "gpu device ready");

        Ok(GpuDevice {
            device,
            queue,
            adapter_info,
            workgroup_size: WorkgroupSize::default(),
            _instance: instance,
        })
    }

    /// Workgroup counts covering an image with the 2D workgroup size.
    ///
    /// Ceiling division; the shader guards out-of-bounds global ids.
    pub fn dispatch_2d(&self, img_w: u32, img_h: u32) -> (u32, u32) {
        let dx = (img_w + self.workgroup_size.x - 1) / self.workgroup_size.x;
        let dy = (img_h + self.workgroup_size.y - 1) / self.workgroup_size.y;
        (dx, dy)
    }

    /// Workgroup count covering `n` elements with [`LINEAR_WORKGROUP`]
    /// threads per group.
    pub fn dispatch_1d(&self, n: u32) -> u32 {
        (n + LINEAR_WORKGROUP - 1) / LINEAR_WORKGROUP
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuDevice {{ adapter: {} }}", self.adapter_info)
    }
}

/// Device limits sized for the configured volume. The voxel pool and
/// hash table dominate; everything else fits inside the defaults.
fn required_limits(params: &HashParams) -> wgpu::Limits {
    let voxel_bytes = (params.num_bricks as u64 * BRICK_VOLUME as u64)
        * std::mem::size_of::<Voxel>() as u64;
    let hash_bytes = params.total_slots() as u64 * std::mem::size_of::<HashEntry>() as u64;
    let defaults = wgpu::Limits::default();
    let binding = voxel_bytes
        .max(hash_bytes)
        .max(defaults.max_storage_buffer_binding_size as u64);
    wgpu::Limits {
        max_storage_buffer_binding_size: binding.min(u32::MAX as u64) as u32,
        max_buffer_size: binding.max(defaults.max_buffer_size),
        ..defaults
    }
}

// ============================================================
// Error type
// ============================================================

/// Errors from GPU device initialization.
#[derive(Debug)]
pub enum GpuError {
    /// No Vulkan adapter found. On WSL2: check that `vulkaninfo` lists
    /// a real GPU.
    NoSuitableAdapter,
    /// wgpu device request failed (driver issue, unsupported limits).
    DeviceRequest(wgpu::RequestDeviceError),
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuError::NoSuitableAdapter => write!(
                f,
                "no suitable Vulkan adapter found (only CPU/software renderers visible)"
            ),
            GpuError::DeviceRequest(e) => write!(f, "device request failed: {e}"),
        }
    }
}

impl std::error::Error for GpuError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GpuError::DeviceRequest(e) => Some(e),
            _ => None,
        }
    }
}

// ============================================================
// Tests
// ============================================================
