//! Explicit GPU execution context.
//!
//! Owns the wgpu device/queue pair plus the shared bind-group layout and
//! samplers used by every resident tile. Constructed once by the caller and
//! passed by reference into the tile manager and culler; lifetime is tied to
//! the owning renderer, not to process-wide static state.

use crate::error::{TerrainError, TerrainResult};

pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter: wgpu::Adapter,
    tile_layout: wgpu::BindGroupLayout,
    height_sampler: wgpu::Sampler,
    normal_sampler: wgpu::Sampler,
}

impl GpuContext {
    /// Acquire an adapter and device suitable for terrain streaming.
    ///
    /// Fails with [`TerrainError::Gpu`] when no adapter is present, which
    /// callers (and tests) should treat as "run without a GPU".
    pub fn new() -> TerrainResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| TerrainError::gpu("no suitable GPU adapter"))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
                label: Some("terrastream-device"),
            },
            None,
        ))
        .map_err(|e| TerrainError::gpu(format!("request_device failed: {e}")))?;

        let tile_layout = create_tile_bind_group_layout(&device);
        let (height_sampler, normal_sampler) = create_tile_samplers(&device);

        Ok(Self {
            device,
            queue,
            adapter,
            tile_layout,
            height_sampler,
            normal_sampler,
        })
    }

    /// Bind-group layout shared by all tile height/normal texture sets.
    pub fn tile_bind_group_layout(&self) -> &wgpu::BindGroupLayout {
        &self.tile_layout
    }

    pub fn height_sampler(&self) -> &wgpu::Sampler {
        &self.height_sampler
    }

    pub fn normal_sampler(&self) -> &wgpu::Sampler {
        &self.normal_sampler
    }
}

fn create_tile_bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("terrain-tile-bind-group-layout"),
        entries: &[
            // Height texture (R32Float is not filterable without an extra feature)
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: false },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            },
            // Normal texture
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 2,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 3,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            },
        ],
    })
}

fn create_tile_samplers(device: &wgpu::Device) -> (wgpu::Sampler, wgpu::Sampler) {
    let height = device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("terrain-height-sampler"),
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: wgpu::FilterMode::Nearest,
        min_filter: wgpu::FilterMode::Nearest,
        mipmap_filter: wgpu::FilterMode::Nearest,
        ..Default::default()
    });
    let normal = device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("terrain-normal-sampler"),
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: wgpu::FilterMode::Linear,
        min_filter: wgpu::FilterMode::Linear,
        mipmap_filter: wgpu::FilterMode::Nearest,
        ..Default::default()
    });
    (height, normal)
}

/// Align to WebGPU's required bytes-per-row for texture copies.
#[inline]
pub fn align_copy_bpr(unpadded: u32) -> u32 {
    let a = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    ((unpadded + a - 1) / a) * a
}
