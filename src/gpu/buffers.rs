// gpu/buffers.rs -- Device-resident state of the reconstruction and
// the CPU<->GPU transfer paths.
//
// Every buffer is sized from `HashParams` at construction and never
// resized. Frame uploads go through a staging buffer with rows padded
// to wgpu's 256-byte `bytes_per_row` alignment; readbacks use a
// MAP_READ staging buffer with a blocking map (poll + channel), which
// is fine for the per-frame decision array (small) and for tests.
//
// `reset` rewrites the table to FREE entries and the heap to its
// initial descending stack; plain zero state (voxels, counters, stats,
// scratch) is cleared with `clear_buffer` in one encoder.

use wgpu::util::DeviceExt;

use crate::camera::DepthIntrinsics;
use crate::image::{BitMask, Image};
use crate::params::HashParams;
use crate::voxel::{HashEntry, Voxel, BRICK_VOLUME};

use super::device::GpuDevice;

const COPY_ALIGNMENT: u32 = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

/// Uniform block shared by every kernel; field order matches
/// `struct Params` in shaders/params.wgsl.
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuParams {
    pub world_from_camera: [f32; 16],
    pub camera_from_world: [f32; 16],
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
    pub img_width: u32,
    pub img_height: u32,
    pub num_buckets: u32,
    pub bucket_size: u32,
    pub num_overflow_slots: u32,
    pub max_chain_length: u32,
    pub num_bricks: u32,
    pub num_occupied: u32,
    pub voxel_size: f32,
    pub truncation: f32,
    pub trunc_scale: f32,
    pub max_integration_distance: f32,
    pub weight_sample: u32,
    pub weight_max: u32,
    pub starve_frame: u32,
    pub use_mask: u32,
    pub gc_sdf_threshold: f32,
    pub _pad: [u32; 3],
}

/// Indices into the stats buffer; must match hash_common.wgsl.
pub const STAT_HEAP_EXHAUSTED: usize = 0;
pub const STAT_OVERFLOW_EXHAUSTED: usize = 1;
pub const STAT_CONTENTION_LOST: usize = 2;
pub const STAT_COUNT: usize = 3;

/// All device buffers of one reconstruction session.
pub struct GpuSceneBuffers {
    pub params_buf: wgpu::Buffer,
    pub hash_buf: wgpu::Buffer,
    pub mutex_buf: wgpu::Buffer,
    pub heap_buf: wgpu::Buffer,
    pub heap_counter_buf: wgpu::Buffer,
    pub overflow_counter_buf: wgpu::Buffer,
    pub stats_buf: wgpu::Buffer,
    pub decision_buf: wgpu::Buffer,
    pub prefix_buf: wgpu::Buffer,
    pub compacted_buf: wgpu::Buffer,
    pub gc_flags_buf: wgpu::Buffer,
    pub voxel_buf: wgpu::Buffer,
    pub depth_tex: wgpu::Texture,
    pub depth_view: wgpu::TextureView,
    pub color_tex: wgpu::Texture,
    pub color_view: wgpu::TextureView,
    pub mask_buf: wgpu::Buffer,
    total_slots: usize,
    num_bricks: u32,
    img_w: u32,
    img_h: u32,
}

impl GpuSceneBuffers {
    pub fn new(gpu: &GpuDevice, params: &HashParams, intr: &DepthIntrinsics) -> Self {
        let total_slots = params.total_slots();
        let storage = |label: &str, size: u64, extra: wgpu::BufferUsages| {
            gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::STORAGE | extra,
                mapped_at_creation: false,
            })
        };
        let rw = wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC;

        let params_buf = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("voxhash params"),
            size: std::mem::size_of::<GpuParams>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let entry_size = std::mem::size_of::<HashEntry>() as u64;
        let hash_buf = storage("voxhash hash", total_slots as u64 * entry_size, rw);
        let mutex_buf = storage(
            "voxhash bucket mutex",
            params.num_buckets as u64 * 4,
            wgpu::BufferUsages::COPY_DST,
        );
        let heap_buf = storage("voxhash heap", params.num_bricks as u64 * 4, rw);
        let heap_counter_buf = storage("voxhash heap counter", 4, rw);
        let overflow_counter_buf = storage("voxhash overflow counter", 4, rw);
        let stats_buf = storage("voxhash stats", (STAT_COUNT * 4) as u64, rw);
        let decision_buf = storage(
            "voxhash decision",
            total_slots as u64 * 4,
            wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
        );
        let prefix_buf = storage(
            "voxhash prefix",
            total_slots as u64 * 4,
            wgpu::BufferUsages::COPY_DST,
        );
        let compacted_buf = storage("voxhash compacted", total_slots as u64 * 4, rw);
        let gc_flags_buf = storage(
            "voxhash gc flags",
            total_slots as u64 * 4,
            wgpu::BufferUsages::COPY_DST,
        );
        let voxel_buf = storage(
            "voxhash voxels",
            params.voxel_count() as u64 * std::mem::size_of::<Voxel>() as u64,
            rw,
        );

        let frame_tex = |label: &str, format: wgpu::TextureFormat| {
            gpu.device.create_texture(&wgpu::TextureDescriptor {
                label: Some(label),
                size: wgpu::Extent3d {
                    width: intr.width,
                    height: intr.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            })
        };
        let depth_tex = frame_tex("voxhash depth", wgpu::TextureFormat::R32Float);
        let depth_view = depth_tex.create_view(&wgpu::TextureViewDescriptor::default());
        let color_tex = frame_tex("voxhash color", wgpu::TextureFormat::Rgba8Unorm);
        let color_view = color_tex.create_view(&wgpu::TextureViewDescriptor::default());

        let mask_words = (intr.width as u64 * intr.height as u64 + 31) / 32;
        let mask_buf = storage("voxhash mask", mask_words.max(1) * 4, wgpu::BufferUsages::COPY_DST);

        GpuSceneBuffers {
            params_buf,
            hash_buf,
            mutex_buf,
            heap_buf,
            heap_counter_buf,
            overflow_counter_buf,
            stats_buf,
            decision_buf,
            prefix_buf,
            compacted_buf,
            gc_flags_buf,
            voxel_buf,
            depth_tex,
            depth_view,
            color_tex,
            color_view,
            mask_buf,
            total_slots,
            num_bricks: params.num_bricks,
            img_w: intr.width,
            img_h: intr.height,
        }
    }

    /// Rewrite every store to its initial state.
    pub fn reset(&self, gpu: &GpuDevice) {
        let entries = vec![HashEntry::FREE; self.total_slots];
        gpu.queue
            .write_buffer(&self.hash_buf, 0, bytemuck::cast_slice(&entries));

        let heap: Vec<u32> = (0..self.num_bricks).map(|i| self.num_bricks - 1 - i).collect();
        gpu.queue
            .write_buffer(&self.heap_buf, 0, bytemuck::cast_slice(&heap));
        gpu.queue.write_buffer(
            &self.heap_counter_buf,
            0,
            bytemuck::bytes_of(&(self.num_bricks as i32 - 1)),
        );

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("GpuSceneBuffers::reset"),
            });
        for buf in [
            &self.mutex_buf,
            &self.overflow_counter_buf,
            &self.stats_buf,
            &self.decision_buf,
            &self.prefix_buf,
            &self.compacted_buf,
            &self.gc_flags_buf,
            &self.voxel_buf,
        ] {
            encoder.clear_buffer(buf, 0, None);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));
    }

    pub fn write_params(&self, gpu: &GpuDevice, params: &GpuParams) {
        gpu.queue
            .write_buffer(&self.params_buf, 0, bytemuck::bytes_of(params));
    }

    /// Upload the depth frame, compacting rows to wgpu's 256-byte
    /// `bytes_per_row` alignment.
    pub fn upload_depth(&self, gpu: &GpuDevice, depth: &Image<f32>) {
        self.upload_frame(gpu, &self.depth_tex, depth.as_slice(), depth.stride(), 4);
    }

    pub fn upload_color(&self, gpu: &GpuDevice, color: &Image<[u8; 4]>) {
        self.upload_frame(gpu, &self.color_tex, color.as_slice(), color.stride(), 4);
    }

    fn upload_frame<T: bytemuck::Pod>(
        &self,
        gpu: &GpuDevice,
        tex: &wgpu::Texture,
        data: &[T],
        stride: usize,
        bytes_per_pixel: u32,
    ) {
        let row_bytes = self.img_w * bytes_per_pixel;
        let aligned = align_to(row_bytes, COPY_ALIGNMENT);
        let mut staging = vec![0u8; (aligned * self.img_h) as usize];
        let src = bytemuck::cast_slice::<T, u8>(data);
        let src_stride = stride * bytes_per_pixel as usize;
        for y in 0..self.img_h as usize {
            let src_start = y * src_stride;
            let dst_start = y * aligned as usize;
            staging[dst_start..dst_start + row_bytes as usize]
                .copy_from_slice(&src[src_start..src_start + row_bytes as usize]);
        }

        let staging_buf = gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("voxhash frame staging"),
                contents: &staging,
                usage: wgpu::BufferUsages::COPY_SRC,
            });

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("voxhash frame upload"),
            });
        encoder.copy_buffer_to_texture(
            wgpu::ImageCopyBuffer {
                buffer: &staging_buf,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(aligned),
                    rows_per_image: Some(self.img_h),
                },
            },
            wgpu::ImageCopyTexture {
                texture: tex,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::Extent3d {
                width: self.img_w,
                height: self.img_h,
                depth_or_array_layers: 1,
            },
        );
        gpu.queue.submit(std::iter::once(encoder.finish()));
    }

    /// Upload the ignore mask; `None` clears it (and the caller sets
    /// `use_mask = 0`).
    pub fn upload_mask(&self, gpu: &GpuDevice, mask: Option<&BitMask>) {
        match mask {
            Some(m) => gpu
                .queue
                .write_buffer(&self.mask_buf, 0, bytemuck::cast_slice(m.words())),
            None => {
                let mut encoder = gpu
                    .device
                    .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                        label: Some("voxhash mask clear"),
                    });
                encoder.clear_buffer(&self.mask_buf, 0, None);
                gpu.queue.submit(std::iter::once(encoder.finish()));
            }
        }
    }

    pub fn clear_mutexes(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.clear_buffer(&self.mutex_buf, 0, None);
    }

    pub fn write_prefix(&self, gpu: &GpuDevice, prefix: &[u32]) {
        gpu.queue
            .write_buffer(&self.prefix_buf, 0, bytemuck::cast_slice(prefix));
    }

    // -----------------------------------------------------------------------
    // Readback (pass boundary + tests)
    // -----------------------------------------------------------------------

    pub fn read_decision(&self, gpu: &GpuDevice) -> Vec<u32> {
        let bytes = read_buffer(gpu, &self.decision_buf, self.total_slots as u64 * 4);
        bytemuck::cast_slice(&bytes).to_vec()
    }

    pub fn read_entries(&self, gpu: &GpuDevice) -> Vec<HashEntry> {
        let bytes = read_buffer(
            gpu,
            &self.hash_buf,
            self.total_slots as u64 * std::mem::size_of::<HashEntry>() as u64,
        );
        bytemuck::cast_slice(&bytes).to_vec()
    }

    pub fn read_heap(&self, gpu: &GpuDevice) -> (Vec<u32>, i32) {
        let bytes = read_buffer(gpu, &self.heap_buf, self.num_bricks as u64 * 4);
        let heap = bytemuck::cast_slice(&bytes).to_vec();
        let counter_bytes = read_buffer(gpu, &self.heap_counter_buf, 4);
        let counter = i32::from_le_bytes(counter_bytes[0..4].try_into().unwrap());
        (heap, counter)
    }

    pub fn read_stats(&self, gpu: &GpuDevice) -> [u32; STAT_COUNT] {
        let bytes = read_buffer(gpu, &self.stats_buf, (STAT_COUNT * 4) as u64);
        let words: &[u32] = bytemuck::cast_slice(&bytes);
        [words[0], words[1], words[2]]
    }

    pub fn read_overflow_counter(&self, gpu: &GpuDevice) -> u32 {
        let bytes = read_buffer(gpu, &self.overflow_counter_buf, 4);
        u32::from_le_bytes(bytes[0..4].try_into().unwrap())
    }

    pub fn read_voxels(&self, gpu: &GpuDevice) -> Vec<Voxel> {
        let bytes = read_buffer(
            gpu,
            &self.voxel_buf,
            self.num_bricks as u64 * BRICK_VOLUME as u64 * std::mem::size_of::<Voxel>() as u64,
        );
        bytemuck::cast_slice(&bytes).to_vec()
    }
}

/// Round `value` up to the next multiple of `alignment`.
#[inline]
pub(crate) fn align_to(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) / alignment * alignment
}

/// Blocking readback of the first `bytes` of `src`.
///
/// Stalls the GPU timeline; used at the scan boundary (small) and in
/// tests, never elsewhere on the hot path.
pub fn read_buffer(gpu: &GpuDevice, src: &wgpu::Buffer, bytes: u64) -> Vec<u8> {
    let staging = gpu.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("voxhash readback"),
        size: bytes,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let mut encoder = gpu
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("voxhash readback"),
        });
    encoder.copy_buffer_to_buffer(src, 0, &staging, 0, bytes);
    gpu.queue.submit(std::iter::once(encoder.finish()));

    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |r| {
        tx.send(r).expect("readback channel closed");
    });
    gpu.device.poll(wgpu::Maintain::Wait);
    rx.recv()
        .expect("readback map callback never fired")
        .expect("readback map failed");

    let mapped = slice.get_mapped_range();
    let out = mapped.to_vec();
    drop(mapped);
    staging.unmap();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(0, 256), 0);
        assert_eq!(align_to(1, 256), 256);
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(2560, 256), 2560);
        assert_eq!(align_to(2561, 256), 2816);
    }

    #[test]
    fn test_gpu_params_matches_wgsl_size() {
        // struct Params in params.wgsl is 224 bytes; a drift here makes
        // every kernel read garbage.
        assert_eq!(std::mem::size_of::<GpuParams>(), 224);
    }
}
