// gpu/kernels.rs — compiled compute pipelines and their parameter blocks.
//
// WORKGROUP SIZE:
// naga cannot use an override expression inside @workgroup_size, so the
// shader source carries {{WG_X}} / {{WG_Y}} placeholders replaced with the
// device's configured workgroup size before compilation. Block-granular
// kernels (beta partials, GMM accumulation: one thread per 32x32 tile) use
// a fixed 8x8 workgroup instead and are dispatched over the block grid.
//
// BINDINGS:
// Binding numbers are unique per shader module, so entry points of one
// module can share globals (the image plane, the shared params). Each
// kernel carries its own bind-group layout listing exactly the bindings
// its entry point statically uses; the edge-cue builder is split into a
// row-major and a transposed entry point to stay within the baseline
// limit of eight storage buffers per stage.

use wgpu::util::DeviceExt;

use crate::gpu::device::GpuDevice;

/// Workgroup edge of the block-granular kernels, matching their fixed
/// @workgroup_size(8, 8) in the shader source.
const BLOCK_KERNEL_WG: u32 = 8;

// ---------------------------------------------------------------------------
// Parameter blocks (uniforms)
// ---------------------------------------------------------------------------
//
// Layouts mirror the WGSL structs field for field; every field is 4 bytes
// so Rust's #[repr(C)] and WGSL's uniform layout agree, with explicit pads
// keeping struct sizes 16-byte aligned.

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DownscaleParams {
    pub src_w: u32,
    pub src_h: u32,
    pub src_pitch: u32,
    pub dst_w: u32,
    pub dst_h: u32,
    pub dst_pitch: u32,
    pub _pad0: u32,
    pub _pad1: u32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CopyParams {
    pub width: u32,
    pub height: u32,
    pub src_pitch: u32,
    pub dst_pitch: u32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ThresholdParams {
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub struct UpsampleParams {
    pub coarse_w: u32,
    pub coarse_h: u32,
    pub coarse_pitch: u32,
    pub full_w: u32,
    pub full_h: u32,
    pub full_pitch: u32,
    pub _pad0: u32,
    pub _pad1: u32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BetaParams {
    pub width: u32,
    pub height: u32,
    pub img_pitch: u32,
    pub blocks_x: u32,
    pub blocks_y: u32,
    pub eight: u32,
    pub _pad0: u32,
    pub _pad1: u32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub struct EdgeParams {
    pub width: u32,
    pub height: u32,
    pub img_pitch: u32,
    pub plane_pitch: u32,
    pub t_pitch: u32,
    pub eight: u32,
    pub beta: f32,
    pub strength: f32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GmmTermParams {
    pub width: u32,
    pub height: u32,
    pub img_pitch: u32,
    pub trimap_pitch: u32,
    pub term_pitch: u32,
    pub k: u32,
    pub scale: f32,
    pub lock: i32,
    pub clamp_at: i32,
    pub _pad0: u32,
    pub _pad1: u32,
    pub _pad2: u32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub struct HistTermParams {
    pub width: u32,
    pub height: u32,
    pub img_pitch: u32,
    pub trimap_pitch: u32,
    pub term_pitch: u32,
    pub _pad0: u32,
    pub fg_total: f32,
    pub bg_total: f32,
    pub scale: f32,
    pub lock: i32,
    pub clamp_at: i32,
    pub _pad1: u32,
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GmmAccumParams {
    pub width: u32,
    pub height: u32,
    pub img_pitch: u32,
    pub alpha_pitch: u32,
    pub blocks_x: u32,
    pub blocks_y: u32,
    pub k: u32,
    /// 0 = seed by luma split, 1 = assign to nearest mean.
    pub mode: u32,
    /// Component rgb means (xyz), foreground class first; w of each
    /// class's first slot carries the luma split threshold for mode 0.
    pub means: [[f32; 4]; 8],
}

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
pub struct HistAccumParams {
    pub width: u32,
    pub height: u32,
    pub img_pitch: u32,
    pub alpha_pitch: u32,
}

/// One-shot uniform buffer for a dispatch's parameter block.
pub fn uniform_buffer<T: bytemuck::Pod>(gpu: &GpuDevice, label: &str, params: &T) -> wgpu::Buffer {
    gpu.device
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::bytes_of(params),
            usage: wgpu::BufferUsages::UNIFORM,
        })
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

/// A compiled entry point plus the bind-group layout it expects: storage
/// buffers at the listed module binding numbers, the uniform block last.
pub struct Kernel {
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    storage_bindings: &'static [u32],
    uniform_binding: u32,
    label: &'static str,
}

impl Kernel {
    fn create(
        device: &wgpu::Device,
        module: &wgpu::ShaderModule,
        entry: &'static str,
        storage_bindings: &'static [u32],
        uniform_binding: u32,
    ) -> Self {
        let mut entries: Vec<wgpu::BindGroupLayoutEntry> = storage_bindings
            .iter()
            .map(|&binding| wgpu::BindGroupLayoutEntry {
                binding,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: false },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: uniform_binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(entry),
            entries: &entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(entry),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(entry),
            layout: Some(&pipeline_layout),
            module,
            entry_point: entry,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            cache: None,
        });
        Kernel {
            pipeline,
            layout,
            storage_bindings,
            uniform_binding,
            label: entry,
        }
    }

    /// Bind group for one dispatch. `buffers` pairs positionally with the
    /// kernel's storage binding list; `params` is the uniform block.
    pub fn bind(
        &self,
        gpu: &GpuDevice,
        buffers: &[&wgpu::Buffer],
        params: &wgpu::Buffer,
    ) -> wgpu::BindGroup {
        assert_eq!(
            buffers.len(),
            self.storage_bindings.len(),
            "{}: storage buffer count",
            self.label
        );
        let mut entries: Vec<wgpu::BindGroupEntry> = self
            .storage_bindings
            .iter()
            .zip(buffers)
            .map(|(&binding, buffer)| wgpu::BindGroupEntry {
                binding,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        entries.push(wgpu::BindGroupEntry {
            binding: self.uniform_binding,
            resource: params.as_entire_binding(),
        });
        gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(self.label),
            layout: &self.layout,
            entries: &entries,
        })
    }

    /// Record one dispatch into the encoder.
    pub fn dispatch(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        bind_group: &wgpu::BindGroup,
        groups: (u32, u32),
    ) {
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(self.label),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.dispatch_workgroups(groups.0, groups.1, 1);
    }
}

/// Workgroup counts covering a block grid for the fixed-8x8 kernels.
pub fn block_dispatch(blocks_x: u32, blocks_y: u32) -> (u32, u32) {
    (
        (blocks_x + BLOCK_KERNEL_WG - 1) / BLOCK_KERNEL_WG,
        (blocks_y + BLOCK_KERNEL_WG - 1) / BLOCK_KERNEL_WG,
    )
}

// ---------------------------------------------------------------------------
// KernelSet
// ---------------------------------------------------------------------------

/// Every pipeline the engine dispatches, compiled once per device at the
/// device's configured workgroup size.
pub struct KernelSet {
    pub downscale_rgba: Kernel,
    pub downscale_trimap: Kernel,
    pub copy_plane: Kernel,
    pub threshold_raw: Kernel,
    pub upsample_nearest: Kernel,
    pub beta_partials: Kernel,
    pub edge_planes: Kernel,
    pub edge_horizontal: Kernel,
    pub data_term_gmm: Kernel,
    pub data_term_hist: Kernel,
    pub gmm_accumulate: Kernel,
    pub hist_accumulate: Kernel,
}

impl KernelSet {
    pub fn create(gpu: &GpuDevice) -> Self {
        let d = &gpu.device;
        let downscale = compile(gpu, "downscale", include_str!("../shaders/downscale.wgsl"));
        let mask = compile(gpu, "mask", include_str!("../shaders/mask.wgsl"));
        let edgecues = compile(gpu, "edgecues", include_str!("../shaders/edgecues.wgsl"));
        let dataterm = compile(gpu, "dataterm", include_str!("../shaders/dataterm.wgsl"));
        let model = compile(gpu, "model", include_str!("../shaders/model.wgsl"));

        KernelSet {
            downscale_rgba: Kernel::create(d, &downscale, "downscale_rgba", &[0, 1], 2),
            downscale_trimap: Kernel::create(d, &downscale, "downscale_trimap", &[0, 1], 2),
            copy_plane: Kernel::create(d, &mask, "copy_plane", &[0, 1], 2),
            threshold_raw: Kernel::create(d, &mask, "threshold_raw", &[0], 3),
            upsample_nearest: Kernel::create(d, &mask, "upsample_nearest", &[0, 1], 4),
            beta_partials: Kernel::create(d, &edgecues, "beta_partials", &[0, 1], 2),
            edge_planes: Kernel::create(d, &edgecues, "edge_planes", &[0, 3, 4, 5, 6, 7, 8], 9),
            edge_horizontal: Kernel::create(d, &edgecues, "edge_horizontal", &[0, 10, 11], 9),
            data_term_gmm: Kernel::create(d, &dataterm, "data_term_gmm", &[0, 1, 2, 3], 4),
            data_term_hist: Kernel::create(d, &dataterm, "data_term_hist", &[0, 1, 2, 5], 6),
            gmm_accumulate: Kernel::create(d, &model, "gmm_accumulate", &[0, 1, 2], 3),
            hist_accumulate: Kernel::create(d, &model, "hist_accumulate", &[0, 1, 4], 5),
        }
    }
}

fn compile(gpu: &GpuDevice, label: &str, source: &str) -> wgpu::ShaderModule {
    let source = source
        .replace("{{WG_X}}", &gpu.workgroup_size.x.to_string())
        .replace("{{WG_Y}}", &gpu.workgroup_size.y.to_string());
    gpu.device
        .create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
