use std::borrow::Cow;
use std::sync::Arc;

use half::f16;
use image::{ImageBuffer, RgbaImage};
use tracing::info;
use wgpu::{PollType, util::DeviceExt};

use super::{
    DEFAULT_MAX_VIEWPORT, MAX_STEPS, RayCastBackend, RayGenerator, RenderRequest, VolumeMapper,
};
use crate::enums::Interpolation;
use crate::error::{Result, ViewerError};
use crate::volume::ScalarVolume;

#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct Uniforms {
    eye: [f32; 4],
    forward: [f32; 4],
    right: [f32; 4],
    up: [f32; 4],
    extent: [f32; 4],
    inv_spacing: [f32; 4],
    grid: [f32; 4],
    scalar: [f32; 4],
    background: [f32; 4],
    light: [f32; 4],
    material: [f32; 4],
    dims: [u32; 4],
}

struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

/// Compute-shader ray caster. Construction fails when no adapter or device
/// is available; that is fatal for the process.
pub struct GpuRayCaster {
    context: Arc<GpuContext>,
}

impl GpuRayCaster {
    pub async fn new() -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .map_err(|err| ViewerError::FatalResource(format!("no GPU adapter: {err}")))?;
        info!(adapter = %adapter.get_info().name, "GPU adapter selected");

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("Volume Ray Cast Device"),
                ..Default::default()
            })
            .await
            .map_err(|err| ViewerError::FatalResource(format!("no GPU device: {err}")))?;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Volume Ray Cast Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!(
                "../shaders/volume_raycast.wgsl"
            ))),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Volume Ray Cast Bind Group Layout"),
            entries: &[
                // 3D texture
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D3,
                        multisampled: false,
                    },
                    count: None,
                },
                // Sampler
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                // Output buffer
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Uniforms
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                // Transfer function lookup table
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Volume Ray Cast Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("Volume Ray Cast Pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: Some("main"),
            compilation_options: Default::default(),
            cache: None,
        });

        Ok(Self {
            context: Arc::new(GpuContext {
                device,
                queue,
                pipeline,
                bind_group_layout,
            }),
        })
    }
}

impl RayCastBackend for GpuRayCaster {
    fn name(&self) -> &'static str {
        "gpu"
    }

    /// Side of the largest square frame whose RGBA8 output fits one storage
    /// buffer binding.
    fn max_viewport(&self) -> u32 {
        let bytes = u64::from(self.context.device.limits().max_storage_buffer_binding_size);
        let side = ((bytes / 4) as f64).sqrt() as u32;
        side.min(DEFAULT_MAX_VIEWPORT)
    }

    fn create_mapper(&self, volume: Arc<ScalarVolume>) -> Result<Box<dyn VolumeMapper>> {
        let (width, height, depth) = volume.dimensions();
        let (width, height, depth) = (width as u32, height as u32, depth as u32);
        let device = &self.context.device;

        let max = device.limits().max_texture_dimension_3d;
        if width > max || height > max || depth > max {
            return Err(ViewerError::Validation(format!(
                "volume {width}x{height}x{depth} exceeds the GPU 3D texture limit of {max}"
            )));
        }

        // Create 3D texture
        let texture_size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: depth,
        };

        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Volume 3D Texture"),
            size: texture_size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D3,
            format: wgpu::TextureFormat::R16Float,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        // Upload volume data normalized to the scalar range
        let (min, max) = volume.scalar_range();
        let span = if max > min { max - min } else { 1.0 };
        let texels: Vec<f16> = volume
            .data()
            .iter()
            .map(|&v| f16::from_f32((v - min) / span))
            .collect();
        self.context.queue.write_texture(
            wgpu::TexelCopyTextureInfoBase {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(&texels),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(std::mem::size_of::<f16>() as u32 * width),
                rows_per_image: Some(height),
            },
            texture_size,
        );

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        Ok(Box::new(GpuVolumeMapper {
            context: Arc::clone(&self.context),
            volume,
            texture,
            view,
        }))
    }
}

pub struct GpuVolumeMapper {
    context: Arc<GpuContext>,
    volume: Arc<ScalarVolume>,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

impl GpuVolumeMapper {
    fn uniforms(&self, request: &RenderRequest<'_>) -> Uniforms {
        let rays = RayGenerator::new(request.camera, request.width, request.height);
        let extent = self.volume.extent();
        let (sx, sy, sz) = self.volume.spacing();
        let size = self.texture.size();
        let (min, max) = self.volume.scalar_range();
        let span = if max > min { max - min } else { 1.0 };
        let (lut_lo, lut_hi) = request.lut.domain();
        let light = request.lights.first().copied().unwrap_or_default();
        let light_dir = light.direction_to_light();
        let shading = request.shading;
        let [br, bg, bb] = request.background;

        Uniforms {
            eye: rays.origin.extend(rays.tan_half_fov).to_array(),
            forward: rays.forward.extend(rays.aspect).to_array(),
            right: rays
                .right
                .extend(RenderRequest::sample_distance(&self.volume))
                .to_array(),
            up: rays
                .up
                .extend(RenderRequest::opacity_exponent(&self.volume))
                .to_array(),
            extent: extent.extend(0.0).to_array(),
            inv_spacing: [1.0 / sx, 1.0 / sy, 1.0 / sz, 0.0],
            grid: [
                size.width as f32,
                size.height as f32,
                size.depth_or_array_layers as f32,
                0.0,
            ],
            scalar: [min, span, lut_lo, lut_hi],
            background: [br, bg, bb, request.lut.entries().len() as f32],
            light: light_dir.extend(light.intensity).to_array(),
            material: [
                shading.ambient,
                shading.diffuse,
                shading.specular,
                shading.specular_power,
            ],
            dims: [
                request.width,
                request.height,
                u32::from(shading.enabled),
                MAX_STEPS,
            ],
        }
    }
}

impl VolumeMapper for GpuVolumeMapper {
    fn render(&mut self, request: &RenderRequest<'_>) -> Result<RgbaImage> {
        let GpuContext {
            device,
            queue,
            pipeline,
            bind_group_layout,
        } = &*self.context;
        let (target_width, target_height) = (request.width, request.height);
        let output_size = (target_width as u64) * (target_height as u64) * 4;
        if output_size > u64::from(device.limits().max_storage_buffer_binding_size) {
            return Err(ViewerError::Validation(format!(
                "viewport {target_width}x{target_height} exceeds the GPU storage buffer limit"
            )));
        }

        let filter = match request.interpolation {
            Interpolation::Nearest => wgpu::FilterMode::Nearest,
            Interpolation::Linear => wgpu::FilterMode::Linear,
        };
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Volume Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: filter,
            min_filter: filter,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let uniforms = self.uniforms(request);
        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Uniform Buffer"),
            contents: bytemuck::bytes_of(&uniforms),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let lut_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Transfer Function Buffer"),
            contents: bytemuck::cast_slice(request.lut.entries()),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let output_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Output Buffer"),
            size: output_size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let staging_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging Buffer"),
            size: output_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Volume Ray Cast Bind Group"),
            layout: bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&self.view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: output_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 4,
                    resource: lut_buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Volume Ray Cast Encoder"),
        });
        {
            let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Volume Ray Cast Pass"),
                timestamp_writes: None,
            });
            compute_pass.set_pipeline(pipeline);
            compute_pass.set_bind_group(0, &bind_group, &[]);
            let workgroup_size = 8;
            let dispatch_x = target_width.div_ceil(workgroup_size);
            let dispatch_y = target_height.div_ceil(workgroup_size);
            compute_pass.dispatch_workgroups(dispatch_x, dispatch_y, 1);
        }
        encoder.copy_buffer_to_buffer(&output_buffer, 0, &staging_buffer, 0, output_size);
        queue.submit(Some(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        device
            .poll(PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|err| ViewerError::FatalResource(format!("GPU poll failed: {err}")))?;
        futures::executor::block_on(receiver)
            .map_err(|_| ViewerError::FatalResource("GPU readback was cancelled".into()))?
            .map_err(|err| ViewerError::FatalResource(format!("GPU readback failed: {err}")))?;

        // pack4x8unorm stores red in the lowest byte, so the buffer is RGBA8.
        let data = buffer_slice.get_mapped_range();
        let pixels = data.to_vec();
        drop(data);
        staging_buffer.unmap();

        ImageBuffer::from_raw(target_width, target_height, pixels)
            .ok_or_else(|| ViewerError::FatalResource("frame buffer size mismatch".into()))
    }
}
