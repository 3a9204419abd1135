//! Compute-dispatch culling path.
//!
//! Uploads the flat object set, the six frustum planes and a parameter
//! block, dispatches one invocation per object, and reads the 0/1
//! visibility flags back through a mapped staging buffer. Buffer backing is
//! reserved through the typed memory pools and returned on drop.

use super::{CullResults, CullingObject, CullingParams};
use crate::core::memory_pool::{MemoryPoolAllocator, PoolAllocation, PoolKind};
use crate::error::{TerrainError, TerrainResult};
use crate::gpu::GpuContext;
use futures_intrusive::channel::shared::oneshot_channel;
use glam::{Vec3, Vec4};
use std::sync::Arc;
use std::time::Instant;

const WORKGROUP_SIZE: u32 = 64;

/// Must match `CullObject` in `shaders/culling.wgsl`.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct GpuCullObject {
    bounds_min: [f32; 3],
    id: u32,
    bounds_max: [f32; 3],
    lod_level: u32,
    visible: u32,
    _pad: [u32; 3],
}

/// Must match `FrustumPlane` in `shaders/culling.wgsl`.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct GpuFrustumPlane {
    normal: [f32; 3],
    distance: f32,
}

/// Must match `CullParams` in `shaders/culling.wgsl`.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct GpuCullParams {
    camera_position: [f32; 3],
    object_count: u32,
    lod_distances: [f32; 4],
    enable_frustum_culling: u32,
    enable_lod_culling: u32,
    _pad: [u32; 2],
}

pub struct GpuCuller {
    pipeline: wgpu::ComputePipeline,
    bind_group: wgpu::BindGroup,
    object_buffer: wgpu::Buffer,
    result_buffer: wgpu::Buffer,
    plane_buffer: wgpu::Buffer,
    params_buffer: wgpu::Buffer,
    readback_buffer: wgpu::Buffer,
    max_objects: u32,
    allocator: Arc<MemoryPoolAllocator>,
    allocations: Vec<PoolAllocation>,
}

impl GpuCuller {
    /// Build the compute pipeline and device buffers for up to
    /// `max_objects` objects. Any failure here disables GPU culling for the
    /// session; the caller falls back to the CPU path.
    pub fn new(
        gpu: &GpuContext,
        allocator: Arc<MemoryPoolAllocator>,
        max_objects: u32,
    ) -> TerrainResult<Self> {
        let object_bytes = max_objects as u64 * std::mem::size_of::<GpuCullObject>() as u64;
        let result_bytes = max_objects as u64 * std::mem::size_of::<u32>() as u64;
        let plane_bytes = 6 * std::mem::size_of::<GpuFrustumPlane>() as u64;
        let params_bytes = std::mem::size_of::<GpuCullParams>() as u64;

        // Reserve pool backing first so exhaustion surfaces as a clean
        // AllocationFailure before any device object exists.
        let mut allocations = Vec::with_capacity(5);
        let reservations = [
            (PoolKind::ComputeBuffer, object_bytes),
            (PoolKind::ComputeBuffer, result_bytes),
            (PoolKind::UniformBuffer, plane_bytes),
            (PoolKind::UniformBuffer, params_bytes),
            (PoolKind::StagingBuffer, result_bytes),
        ];
        for (kind, size) in reservations {
            match allocator.allocate(kind, size) {
                Ok(allocation) => allocations.push(allocation),
                Err(e) => {
                    for allocation in allocations {
                        allocator.deallocate(allocation);
                    }
                    return Err(e);
                }
            }
        }

        let device = &gpu.device;

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("culling-compute"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../../shaders/culling.wgsl").into()),
        });

        let storage_entry = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("culling-bind-group-layout"),
            entries: &[
                storage_entry(0, true),  // objects
                storage_entry(1, false), // results
                storage_entry(2, true),  // frustum planes
                storage_entry(3, true),  // params
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("culling-pipeline-layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("culling-pipeline"),
            layout: Some(&pipeline_layout),
            module: &shader,
            entry_point: "main",
        });

        let make_buffer = |label: &str, size: u64, usage: wgpu::BufferUsages| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage,
                mapped_at_creation: false,
            })
        };
        let object_buffer = make_buffer(
            "culling-objects",
            object_bytes,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        );
        let result_buffer = make_buffer(
            "culling-results",
            result_bytes,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        );
        let plane_buffer = make_buffer(
            "culling-planes",
            plane_bytes,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        );
        let params_buffer = make_buffer(
            "culling-params",
            params_bytes,
            wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
        );
        let readback_buffer = make_buffer(
            "culling-readback",
            result_bytes,
            wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        );

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("culling-bind-group"),
            layout: &layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: object_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: result_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: plane_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: params_buffer.as_entire_binding(),
                },
            ],
        });

        log::info!("GPU culling pipeline initialized ({max_objects} object capacity)");

        Ok(Self {
            pipeline,
            bind_group,
            object_buffer,
            result_buffer,
            plane_buffer,
            params_buffer,
            readback_buffer,
            max_objects,
            allocator,
            allocations,
        })
    }

    pub fn max_objects(&self) -> u32 {
        self.max_objects
    }

    /// Dispatch the culling pass and partition `objects` by the flags read
    /// back from the device.
    pub fn cull(
        &self,
        gpu: &GpuContext,
        objects: &[CullingObject],
        frustum_planes: &[Vec4; 6],
        camera_position: Vec3,
        params: &CullingParams,
    ) -> TerrainResult<CullResults> {
        if objects.is_empty() {
            return Ok(CullResults::default());
        }
        if objects.len() as u32 > self.max_objects {
            return Err(TerrainError::gpu(format!(
                "object count {} exceeds GPU culling capacity {}",
                objects.len(),
                self.max_objects
            )));
        }

        let start = Instant::now();

        let records: Vec<GpuCullObject> = objects
            .iter()
            .map(|object| GpuCullObject {
                bounds_min: object.bounds.min.to_array(),
                id: object.id,
                bounds_max: object.bounds.max.to_array(),
                lod_level: object.lod_level,
                visible: 0,
                _pad: [0; 3],
            })
            .collect();
        let planes: Vec<GpuFrustumPlane> = frustum_planes
            .iter()
            .map(|plane| GpuFrustumPlane {
                normal: plane.truncate().to_array(),
                distance: plane.w,
            })
            .collect();
        let gpu_params = GpuCullParams {
            camera_position: camera_position.to_array(),
            object_count: objects.len() as u32,
            lod_distances: params.lod_distances,
            enable_frustum_culling: params.enable_frustum_culling as u32,
            enable_lod_culling: params.enable_lod_culling as u32,
            _pad: [0; 2],
        };

        gpu.queue
            .write_buffer(&self.object_buffer, 0, bytemuck::cast_slice(&records));
        gpu.queue
            .write_buffer(&self.plane_buffer, 0, bytemuck::cast_slice(&planes));
        gpu.queue
            .write_buffer(&self.params_buffer, 0, bytemuck::bytes_of(&gpu_params));

        // Copy/map sizes padded to wgpu's 8-byte map alignment; the flag
        // readback below only consumes the first `objects.len()` entries.
        let result_bytes = ((objects.len() * std::mem::size_of::<u32>() + 7) & !7) as u64;
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("culling-encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("culling-pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &self.bind_group, &[]);
            let groups = (objects.len() as u32 + WORKGROUP_SIZE - 1) / WORKGROUP_SIZE;
            pass.dispatch_workgroups(groups, 1, 1);
        }
        encoder.copy_buffer_to_buffer(&self.result_buffer, 0, &self.readback_buffer, 0, result_bytes);
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let slice = self.readback_buffer.slice(0..result_bytes);
        let (sender, receiver) = oneshot_channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        gpu.device.poll(wgpu::Maintain::Wait);
        pollster::block_on(receiver.receive())
            .ok_or_else(|| TerrainError::readback("map_async callback channel dropped"))?
            .map_err(|e| TerrainError::readback(format!("buffer map failed: {e:?}")))?;

        let flags: Vec<u32> = {
            let data = slice.get_mapped_range();
            bytemuck::cast_slice(&data).to_vec()
        };
        self.readback_buffer.unmap();

        let mut results = CullResults::default();
        for (object, &flag) in objects.iter().zip(flags.iter()) {
            if flag == 1 {
                results.visible.push(object.clone());
            } else {
                results.culled.push(object.clone());
            }
        }
        results.cull_time_ms = start.elapsed().as_secs_f32() * 1000.0;
        Ok(results)
    }
}

impl Drop for GpuCuller {
    fn drop(&mut self) {
        for allocation in self.allocations.drain(..) {
            self.allocator.deallocate(allocation);
        }
    }
}
