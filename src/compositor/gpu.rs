use std::collections::HashMap;
use std::sync::{
    OnceLock,
    atomic::{AtomicBool, Ordering},
    mpsc,
};

use anyhow::{Context, anyhow, bail};
use bytemuck::{Pod, Zeroable};
use image::RgbaImage;
use wgpu::util::DeviceExt;

use super::{DrawItem, Frame, LayerDraw, RenderBackend};
use crate::layer::{DisplayParams, LayerType, LayerVisibility, ResourceHandle};
use crate::registering::Matrix3;
use crate::texture::{AuxTextureId, AuxTextures, AuxiliaryDataTexture};

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const STACK_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba16Float;

struct Pipelines {
    layer_bgl: wgpu::BindGroupLayout,
    normalize_bgl: wgpu::BindGroupLayout,
    over: wgpu::RenderPipeline,
    accumulate: wgpu::RenderPipeline,
    max: wgpu::RenderPipeline,
    normalize: wgpu::RenderPipeline,
    linear: wgpu::Sampler,
    nearest: wgpu::Sampler,
}

struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipelines: Pipelines,
    adapter_name: String,
}

static GPU_CONTEXT: OnceLock<Option<GpuContext>> = OnceLock::new();
static GPU_FALLBACK_REPORTED: AtomicBool = AtomicBool::new(false);

pub fn is_available() -> bool {
    gpu_context().is_some()
}

/// Logs once per process that rendering fell back to the CPU.
pub fn report_fallback_once() {
    if !GPU_FALLBACK_REPORTED.swap(true, Ordering::Relaxed) {
        tracing::warn!("no usable GPU adapter; rendering on the CPU");
    }
}

fn gpu_context() -> Option<&'static GpuContext> {
    GPU_CONTEXT.get_or_init(init_gpu_context).as_ref()
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
/// Mirrors `LayerUniforms` in the WGSL prelude.
struct LayerUniforms {
    transform: [[f32; 4]; 3],
    /// Canvas width/height, output width/height.
    canvas: [f32; 4],
    /// Lens center x/y, radius.
    lens: [f32; 4],
    /// Contrast, saturation, gamma, brightness.
    look: [f32; 4],
    /// Opacity.
    extra: [f32; 4],
    /// Kind, visibility, channel, has_lens.
    info: [u32; 4],
}

fn kind_code(kind: LayerType) -> u32 {
    match kind {
        LayerType::Image => 0,
        LayerType::Elemental => 1,
        LayerType::ColorSegmentation => 2,
        LayerType::Selection => 3,
    }
}

fn visibility_code(visibility: LayerVisibility) -> u32 {
    match visibility {
        LayerVisibility::Invisible => 0,
        LayerVisibility::Visible => 1,
        LayerVisibility::InsideLens => 2,
        LayerVisibility::OutsideLens => 3,
    }
}

fn uniforms(
    frame: &Frame<'_>,
    transform: &Matrix3,
    params: &DisplayParams,
    kind: LayerType,
    channel: usize,
) -> LayerUniforms {
    let (lens, has_lens) = match &frame.lens {
        Some(l) => ([l.center.x as f32, l.center.y as f32, l.radius as f32, 0.0], 1),
        None => ([0.0; 4], 0),
    };
    LayerUniforms {
        transform: transform.to_padded_columns(),
        canvas: [
            frame.canvas.width as f32,
            frame.canvas.height as f32,
            frame.output.width as f32,
            frame.output.height as f32,
        ],
        lens,
        look: [params.contrast, params.saturation, params.gamma, params.brightness],
        extra: [params.opacity, 0.0, 0.0, 0.0],
        info: [
            kind_code(kind),
            visibility_code(params.visibility),
            channel as u32,
            has_lens,
        ],
    }
}

struct GpuTexture {
    _texture: wgpu::Texture,
    view: wgpu::TextureView,
    interpolated: bool,
}

struct AuxUpload {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    revision: u64,
}

/// wgpu render pipelines over the same [`Frame`] the CPU renderer draws.
pub struct GpuRenderer {
    ctx: &'static GpuContext,
    textures: HashMap<ResourceHandle, GpuTexture>,
    aux: HashMap<AuxTextureId, AuxUpload>,
    placeholder: wgpu::TextureView,
    next_handle: u64,
}

impl GpuRenderer {
    /// `None` when no adapter or device could be acquired.
    pub fn new() -> Option<Self> {
        let ctx = gpu_context()?;
        let placeholder = create_texture(
            &ctx.device,
            "xrf_placeholder",
            1,
            1,
            TARGET_FORMAT,
            wgpu::TextureUsages::TEXTURE_BINDING,
        )
        .create_view(&wgpu::TextureViewDescriptor::default());
        tracing::info!(adapter = %ctx.adapter_name, "gpu renderer ready");
        Some(Self {
            ctx,
            textures: HashMap::new(),
            aux: HashMap::new(),
            placeholder,
            next_handle: 0,
        })
    }

    /// Re-uploads lookup tables whose revision moved since the last frame.
    fn sync_aux(&mut self, aux: &AuxTextures) {
        let ctx = self.ctx;
        for (id, data) in aux.iter() {
            let reusable = self
                .aux
                .get(&id)
                .is_some_and(|up| up.texture.width() == data.width() && up.texture.height() == data.height());
            if !reusable {
                let texture = create_texture(
                    &ctx.device,
                    "xrf_aux",
                    data.width(),
                    data.height(),
                    TARGET_FORMAT,
                    wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                );
                let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
                write_aux(&ctx.queue, &texture, data);
                self.aux.insert(
                    id,
                    AuxUpload {
                        texture,
                        view,
                        revision: data.revision(),
                    },
                );
                continue;
            }
            if let Some(up) = self.aux.get_mut(&id)
                && up.revision != data.revision()
            {
                write_aux(&ctx.queue, &up.texture, data);
                up.revision = data.revision();
                tracing::trace!(?id, revision = data.revision(), "aux texture uploaded");
            }
        }
    }

    fn aux_view(&self, id: AuxTextureId) -> &wgpu::TextureView {
        self.aux.get(&id).map(|a| &a.view).unwrap_or(&self.placeholder)
    }

    fn layer_bind_group(&self, frame: &Frame<'_>, draw: &LayerDraw) -> Option<wgpu::BindGroup> {
        let Some(tex) = self.textures.get(&draw.handle) else {
            tracing::warn!(layer = %draw.id, handle = draw.handle.0, "draw references a released texture");
            return None;
        };
        let aux_view = match (draw.kind, draw.auxiliary) {
            (LayerType::Elemental, _) => self.aux_view(AuxTextureId::Elemental),
            (LayerType::ColorSegmentation, _) => self.aux_view(AuxTextureId::ColorSegmentation),
            (LayerType::Selection, Some(binding)) => self.aux_view(binding.texture),
            _ => &self.placeholder,
        };
        let sampler = if tex.interpolated && draw.interpolated {
            &self.ctx.pipelines.linear
        } else {
            &self.ctx.pipelines.nearest
        };
        let channel = draw.auxiliary.map_or(0, |b| b.channel);
        let buffer = self.uniform_buffer(&uniforms(frame, &draw.transform, &draw.params, draw.kind, channel));
        Some(self.ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("xrf_layer_bg"),
            layout: &self.ctx.pipelines.layer_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&tex.view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::TextureView(aux_view),
                },
            ],
        }))
    }

    fn uniform_buffer(&self, u: &LayerUniforms) -> wgpu::Buffer {
        self.ctx.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("xrf_layer_uniforms"),
            contents: bytemuck::bytes_of(u),
            usage: wgpu::BufferUsages::UNIFORM,
        })
    }

    /// Accumulate and max passes into fresh stack targets, then the
    /// normalize pass blended onto `target`.
    fn draw_stack(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        frame: &Frame<'_>,
        layers: &[LayerDraw],
        params: &DisplayParams,
        target: &wgpu::TextureView,
    ) {
        let ctx = self.ctx;
        let (w, h) = (frame.output.width, frame.output.height);
        let usage = wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING;
        let accum = create_texture(&ctx.device, "xrf_accum", w, h, STACK_FORMAT, usage)
            .create_view(&wgpu::TextureViewDescriptor::default());
        let max = create_texture(&ctx.device, "xrf_max", w, h, STACK_FORMAT, usage)
            .create_view(&wgpu::TextureViewDescriptor::default());

        let groups: Vec<wgpu::BindGroup> = layers
            .iter()
            .filter_map(|d| self.layer_bind_group(frame, d))
            .collect();
        run_pass(encoder, "xrf_accumulate", &accum, true, &ctx.pipelines.accumulate, &groups);
        run_pass(encoder, "xrf_max", &max, true, &ctx.pipelines.max, &groups);

        let buffer = self.uniform_buffer(&uniforms(frame, &Matrix3::IDENTITY, params, LayerType::Elemental, 0));
        let normalize = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("xrf_normalize_bg"),
            layout: &ctx.pipelines.normalize_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&accum),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&max),
                },
            ],
        });
        run_pass(encoder, "xrf_normalize", target, false, &ctx.pipelines.normalize, &[normalize]);
    }
}

impl RenderBackend for GpuRenderer {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn upload(&mut self, image: &RgbaImage, interpolated: bool) -> anyhow::Result<ResourceHandle> {
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 {
            bail!("cannot upload an empty image");
        }
        let limit = self.ctx.device.limits().max_texture_dimension_2d;
        if w > limit || h > limit {
            bail!("image {w}x{h} exceeds the GPU texture limit of {limit}");
        }
        let texture = create_texture(
            &self.ctx.device,
            "xrf_layer",
            w,
            h,
            TARGET_FORMAT,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        );
        write_rgba(&self.ctx.queue, &texture, image.as_raw(), w, h);
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        self.next_handle += 1;
        let handle = ResourceHandle(self.next_handle);
        self.textures.insert(
            handle,
            GpuTexture {
                _texture: texture,
                view,
                interpolated,
            },
        );
        Ok(handle)
    }

    fn release(&mut self, handle: ResourceHandle) {
        self.textures.remove(&handle);
    }

    fn resident_count(&self) -> usize {
        self.textures.len()
    }

    fn render(&mut self, frame: &Frame<'_>) -> anyhow::Result<RgbaImage> {
        self.sync_aux(frame.aux);
        let ctx = self.ctx;
        let (w, h) = (frame.output.width, frame.output.height);
        let target = create_texture(
            &ctx.device,
            "xrf_output",
            w,
            h,
            TARGET_FORMAT,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        );
        let target_view = target.create_view(&wgpu::TextureViewDescriptor::default());

        let mut encoder = ctx.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("xrf_render"),
        });
        run_pass(&mut encoder, "xrf_clear", &target_view, true, &ctx.pipelines.over, &[]);
        for item in &frame.items {
            match item {
                DrawItem::Layer(draw) => {
                    if let Some(group) = self.layer_bind_group(frame, draw) {
                        run_pass(&mut encoder, "xrf_layer", &target_view, false, &ctx.pipelines.over, &[group]);
                    }
                }
                DrawItem::ElementalStack { layers, params } => {
                    self.draw_stack(&mut encoder, frame, layers, params, &target_view)
                }
            }
        }
        read_back(ctx, encoder, &target, w, h)
    }
}

fn create_texture(
    device: &wgpu::Device,
    label: &str,
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
    usage: wgpu::TextureUsages,
) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some(label),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage,
        view_formats: &[],
    })
}

fn write_rgba(queue: &wgpu::Queue, texture: &wgpu::Texture, data: &[u8], width: u32, height: u32) {
    queue.write_texture(
        texture.as_image_copy(),
        data,
        wgpu::TexelCopyBufferLayout {
            offset: 0,
            bytes_per_row: Some(width * 4),
            rows_per_image: Some(height),
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
}

fn write_aux(queue: &wgpu::Queue, texture: &wgpu::Texture, data: &AuxiliaryDataTexture) {
    write_rgba(queue, texture, data.data(), data.width(), data.height());
}

fn run_pass(
    encoder: &mut wgpu::CommandEncoder,
    label: &str,
    view: &wgpu::TextureView,
    clear: bool,
    pipeline: &wgpu::RenderPipeline,
    groups: &[wgpu::BindGroup],
) {
    let load = if clear {
        wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT)
    } else {
        wgpu::LoadOp::Load
    };
    let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
        label: Some(label),
        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
            view,
            resolve_target: None,
            ops: wgpu::Operations {
                load,
                store: wgpu::StoreOp::Store,
            },
        })],
        depth_stencil_attachment: None,
        timestamp_writes: None,
        occlusion_query_set: None,
    });
    pass.set_pipeline(pipeline);
    for group in groups {
        pass.set_bind_group(0, group, &[]);
        pass.draw(0..6, 0..1);
    }
}

fn read_back(
    ctx: &GpuContext,
    mut encoder: wgpu::CommandEncoder,
    texture: &wgpu::Texture,
    width: u32,
    height: u32,
) -> anyhow::Result<RgbaImage> {
    let unpadded_bytes_per_row = width * 4;
    let padded_bytes_per_row = unpadded_bytes_per_row.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
        * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    let readback = ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("xrf_readback"),
        size: padded_bytes_per_row as u64 * height as u64,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    });
    encoder.copy_texture_to_buffer(
        texture.as_image_copy(),
        wgpu::TexelCopyBufferInfo {
            buffer: &readback,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(padded_bytes_per_row),
                rows_per_image: Some(height),
            },
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
    ctx.queue.submit([encoder.finish()]);

    let slice = readback.slice(..);
    let (tx, rx) = mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    let _ = ctx.device.poll(wgpu::Maintain::wait());
    rx.recv()
        .context("readback callback dropped")?
        .context("failed to map readback buffer")?;

    let mapped = slice.get_mapped_range();
    let unpadded = unpadded_bytes_per_row as usize;
    let padded = padded_bytes_per_row as usize;
    let mut out = vec![0_u8; unpadded * height as usize];
    for (row, dst) in out.chunks_exact_mut(unpadded).enumerate() {
        let src = row * padded;
        dst.copy_from_slice(&mapped[src..src + unpadded]);
    }
    drop(mapped);
    readback.unmap();

    RgbaImage::from_raw(width, height, out).ok_or_else(|| anyhow!("readback size mismatch"))
}

fn init_gpu_context() -> Option<GpuContext> {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::PRIMARY,
        ..Default::default()
    });
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        force_fallback_adapter: false,
        compatible_surface: None,
    }))?;
    let info = adapter.get_info();
    let (device, queue) = match pollster::block_on(adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: Some("xrf_device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
        },
        None,
    )) {
        Ok(pair) => pair,
        Err(err) => {
            tracing::warn!(adapter = %info.name, error = %err, "failed to open GPU device");
            return None;
        }
    };
    tracing::debug!(adapter = %info.name, backend = ?info.backend, "gpu adapter selected");
    let pipelines = create_pipelines(&device);
    Some(GpuContext {
        device,
        queue,
        pipelines,
        adapter_name: info.name,
    })
}

fn uniform_entry() -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding: 0,
        visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn texture_entry(binding: u32, filterable: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }
}

fn sampler(device: &wgpu::Device, filter: wgpu::FilterMode) -> wgpu::Sampler {
    device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("xrf_sampler"),
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: filter,
        min_filter: filter,
        mipmap_filter: wgpu::FilterMode::Nearest,
        ..Default::default()
    })
}

#[allow(clippy::too_many_arguments)]
fn render_pipeline(
    device: &wgpu::Device,
    label: &str,
    layout: &wgpu::PipelineLayout,
    module: &wgpu::ShaderModule,
    vertex: &str,
    fragment: &str,
    format: wgpu::TextureFormat,
    blend: wgpu::BlendState,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module,
            entry_point: Some(vertex),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            buffers: &[],
        },
        primitive: wgpu::PrimitiveState::default(),
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        fragment: Some(wgpu::FragmentState {
            module,
            entry_point: Some(fragment),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend: Some(blend),
                write_mask: wgpu::ColorWrites::ALL,
            })],
        }),
        multiview: None,
        cache: None,
    })
}

fn stack_blend(operation: wgpu::BlendOperation) -> wgpu::BlendState {
    let component = wgpu::BlendComponent {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::One,
        operation,
    };
    wgpu::BlendState {
        color: component,
        alpha: component,
    }
}

fn create_pipelines(device: &wgpu::Device) -> Pipelines {
    let layer_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("xrf_layer_bgl"),
        entries: &[
            uniform_entry(),
            texture_entry(1, true),
            wgpu::BindGroupLayoutEntry {
                binding: 2,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            },
            texture_entry(3, false),
        ],
    });
    let normalize_bgl = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("xrf_normalize_bgl"),
        entries: &[uniform_entry(), texture_entry(1, false), texture_entry(2, false)],
    });

    let layer_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("xrf_layer_shader"),
        source: wgpu::ShaderSource::Wgsl(format!("{PRELUDE_SRC}{LAYER_SHADER_SRC}").into()),
    });
    let normalize_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("xrf_normalize_shader"),
        source: wgpu::ShaderSource::Wgsl(format!("{PRELUDE_SRC}{NORMALIZE_SHADER_SRC}").into()),
    });
    let layer_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("xrf_layer_layout"),
        bind_group_layouts: &[&layer_bgl],
        push_constant_ranges: &[],
    });
    let normalize_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("xrf_normalize_layout"),
        bind_group_layouts: &[&normalize_bgl],
        push_constant_ranges: &[],
    });

    let over = render_pipeline(
        device,
        "xrf_over",
        &layer_layout,
        &layer_module,
        "vs_layer",
        "fs_layer",
        TARGET_FORMAT,
        wgpu::BlendState::ALPHA_BLENDING,
    );
    let accumulate = render_pipeline(
        device,
        "xrf_accumulate",
        &layer_layout,
        &layer_module,
        "vs_layer",
        "fs_elemental",
        STACK_FORMAT,
        stack_blend(wgpu::BlendOperation::Add),
    );
    let max = render_pipeline(
        device,
        "xrf_max",
        &layer_layout,
        &layer_module,
        "vs_layer",
        "fs_elemental",
        STACK_FORMAT,
        stack_blend(wgpu::BlendOperation::Max),
    );
    let normalize = render_pipeline(
        device,
        "xrf_normalize",
        &normalize_layout,
        &normalize_module,
        "vs_fullscreen",
        "fs_normalize",
        TARGET_FORMAT,
        wgpu::BlendState::ALPHA_BLENDING,
    );

    Pipelines {
        layer_bgl,
        normalize_bgl,
        over,
        accumulate,
        max,
        normalize,
        linear: sampler(device, wgpu::FilterMode::Linear),
        nearest: sampler(device, wgpu::FilterMode::Nearest),
    }
}

const PRELUDE_SRC: &str = r#"
struct LayerUniforms {
    transform: mat3x3<f32>,
    canvas: vec4<f32>,
    lens: vec4<f32>,
    look: vec4<f32>,
    extra: vec4<f32>,
    info: vec4<u32>,
};

@group(0) @binding(0) var<uniform> u: LayerUniforms;

const INTENSITY_EPS: f32 = 0.0009765625;

// Fragment position to canvas space, bottom-left origin.
fn canvas_point(frag: vec2<f32>) -> vec2<f32> {
    let scale = u.canvas.xy / u.canvas.zw;
    return vec2<f32>(frag.x * scale.x, u.canvas.y - frag.y * scale.y);
}

fn lens_allows(p: vec2<f32>) -> bool {
    let vis = u.info.y;
    if vis == 0u {
        return false;
    }
    if vis == 1u {
        return true;
    }
    let inside = u.info.w == 1u && distance(p, u.lens.xy) <= u.lens.z;
    if vis == 2u {
        return inside;
    }
    return !inside;
}

fn apply_display(rgb_in: vec3<f32>, alpha: f32) -> vec4<f32> {
    var c = (rgb_in - vec3<f32>(0.5)) * u.look.x + vec3<f32>(0.5);
    let luma = dot(c, vec3<f32>(0.2126, 0.7152, 0.0722));
    c = vec3<f32>(luma) + (c - vec3<f32>(luma)) * u.look.y;
    let inv_gamma = 1.0 / max(u.look.z, 0.001);
    c = pow(max(c, vec3<f32>(0.0)), vec3<f32>(inv_gamma)) + vec3<f32>(u.look.w);
    return vec4<f32>(clamp(c, vec3<f32>(0.0), vec3<f32>(1.0)), clamp(alpha * u.extra.x, 0.0, 1.0));
}
"#;

const LAYER_SHADER_SRC: &str = r#"
@group(0) @binding(1) var t_layer: texture_2d<f32>;
@group(0) @binding(2) var s_layer: sampler;
@group(0) @binding(3) var t_aux: texture_2d<f32>;

const KIND_COLOR_SEGMENTATION: u32 = 2u;
const KIND_SELECTION: u32 = 3u;

struct VsOut {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_layer(@builtin(vertex_index) vi: u32) -> VsOut {
    var corners = array<vec2<f32>, 6>(
        vec2<f32>(0.0, 0.0), vec2<f32>(1.0, 0.0), vec2<f32>(1.0, 1.0),
        vec2<f32>(0.0, 0.0), vec2<f32>(1.0, 1.0), vec2<f32>(0.0, 1.0),
    );
    let uv = corners[vi];
    let size = u.canvas.xy;
    let c = u.transform * vec3<f32>(uv * size, 1.0);
    var out: VsOut;
    out.position = vec4<f32>(c.x / size.x * 2.0 - c.z, c.y / size.y * 2.0 - c.z, 0.0, c.z);
    out.uv = uv;
    return out;
}

// Image rows run top-down; quad v runs bottom-up.
fn sample_layer(uv: vec2<f32>) -> vec4<f32> {
    return textureSampleLevel(t_layer, s_layer, vec2<f32>(uv.x, 1.0 - uv.y), 0.0);
}

fn nearest_layer(uv: vec2<f32>) -> vec4<f32> {
    let dims = vec2<f32>(textureDimensions(t_layer));
    let xy = clamp(floor(vec2<f32>(uv.x, 1.0 - uv.y) * dims), vec2<f32>(0.0), dims - vec2<f32>(1.0));
    return textureLoad(t_layer, vec2<i32>(xy), 0);
}

fn aux_texel(x: u32, y: u32) -> vec4<f32> {
    let dims = textureDimensions(t_aux);
    if x >= dims.x || y >= dims.y {
        return vec4<f32>(0.0);
    }
    return textureLoad(t_aux, vec2<i32>(i32(x), i32(y)), 0);
}

@fragment
fn fs_layer(in: VsOut) -> @location(0) vec4<f32> {
    if !lens_allows(canvas_point(in.position.xy)) {
        discard;
    }
    let uv = clamp(in.uv, vec2<f32>(0.0), vec2<f32>(1.0));
    let kind = u.info.x;
    if kind == KIND_COLOR_SEGMENTATION {
        let green = u32(round(nearest_layer(uv).g * 255.0));
        if green == 0u {
            discard;
        }
        let c = aux_texel(u.info.z, green - 1u);
        if c.a == 0.0 {
            discard;
        }
        return apply_display(c.rgb, 1.0);
    }
    if kind == KIND_SELECTION {
        let dims = vec2<f32>(textureDimensions(t_aux));
        let xy = clamp(floor(uv * dims), vec2<f32>(0.0), dims - vec2<f32>(1.0));
        let c = textureLoad(t_aux, vec2<i32>(xy), 0);
        if c.a == 0.0 {
            discard;
        }
        return apply_display(c.rgb, 1.0);
    }
    let t = sample_layer(uv);
    return apply_display(t.rgb, t.a);
}

// Shared by the additive and max pipelines: (intensity * color, intensity).
@fragment
fn fs_elemental(in: VsOut) -> @location(0) vec4<f32> {
    let uv = clamp(in.uv, vec2<f32>(0.0), vec2<f32>(1.0));
    let raw = sample_layer(uv).r;
    let color = aux_texel(u.info.z, 0u);
    if color.a == 0.0 {
        return vec4<f32>(0.0);
    }
    let bounds = aux_texel(u.info.z, 1u);
    var i = raw;
    if bounds.g > bounds.r {
        i = clamp((raw - bounds.r) / (bounds.g - bounds.r), 0.0, 1.0);
    }
    return vec4<f32>(color.rgb * i, i);
}
"#;

const NORMALIZE_SHADER_SRC: &str = r#"
@group(0) @binding(1) var t_accum: texture_2d<f32>;
@group(0) @binding(2) var t_max: texture_2d<f32>;

@vertex
fn vs_fullscreen(@builtin(vertex_index) vi: u32) -> @builtin(position) vec4<f32> {
    var corners = array<vec2<f32>, 6>(
        vec2<f32>(-1.0, -1.0), vec2<f32>(1.0, -1.0), vec2<f32>(1.0, 1.0),
        vec2<f32>(-1.0, -1.0), vec2<f32>(1.0, 1.0), vec2<f32>(-1.0, 1.0),
    );
    return vec4<f32>(corners[vi], 0.0, 1.0);
}

@fragment
fn fs_normalize(@builtin(position) position: vec4<f32>) -> @location(0) vec4<f32> {
    if !lens_allows(canvas_point(position.xy)) {
        discard;
    }
    let xy = vec2<i32>(position.xy);
    let m = textureLoad(t_max, xy, 0).a;
    if m <= INTENSITY_EPS {
        discard;
    }
    let acc = textureLoad(t_accum, xy, 0);
    return apply_display(clamp(acc.rgb / m, vec3<f32>(0.0), vec3<f32>(1.0)), min(m, 1.0));
}
"#;
