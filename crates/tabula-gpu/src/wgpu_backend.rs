//! The wgpu device. In render-bundle mode workers encode bundles and the orchestrator
//! executes them in one render pass per frame; in command-buffer mode each worker
//! records a whole render pass into the published frame target and the orchestrator
//! submits every command buffer at once. Benchmark workloads record compute dispatches.

use std::sync::Arc;

use parking_lot::Mutex;

use tabula_core::{
    ContextId, IdLayout, Registry, ResourceHandle, ResourceId, ResourceKind, SharedIds, TabulaError,
    TabulaResult, WorkerContext,
};
use wgpu::util::DeviceExt;

use crate::backend::{lane_center, Backend, WorkerEncoder};
use crate::gpu::{GpuContext, FRAME_FORMAT};
use crate::headless::publish_once;
use crate::scene;

const VERTEX_STRIDE: wgpu::BufferAddress = (std::mem::size_of::<f32>() * 3) as wgpu::BufferAddress;

/// A finished command buffer. Queue submission consumes it, so it can be taken once.
pub struct EncodedCommands {
    label: String,
    buffer: Mutex<Option<wgpu::CommandBuffer>>,
}

impl EncodedCommands {
    fn new(label: String, buffer: wgpu::CommandBuffer) -> Self {
        Self {
            label,
            buffer: Mutex::new(Some(buffer)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn take(&self) -> TabulaResult<wgpu::CommandBuffer> {
        self.buffer
            .lock()
            .take()
            .ok_or_else(|| TabulaError::device(format!("command buffer {} was already submitted", self.label)))
    }
}

pub struct WgpuBackend {
    gpu: GpuContext,
    width: u32,
    height: u32,
    frames_submitted: u64,
}

impl WgpuBackend {
    /// Acquire an adapter and device. Failure is terminal for the caller.
    pub fn new(width: u32, height: u32) -> TabulaResult<Self> {
        let gpu = GpuContext::init(width, height).map_err(|e| TabulaError::DeviceUnavailable(e.to_string()))?;
        Ok(Self {
            gpu,
            width,
            height,
            frames_submitted: 0,
        })
    }

    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted
    }

    fn device_handle(&self) -> ResourceHandle {
        ResourceHandle::from_arc(ResourceKind::Device, Arc::clone(&self.gpu.device)).with_label("wgpu-device")
    }

    fn vertex_buffer(&self, label: &str, data: &[f32]) -> wgpu::Buffer {
        self.gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(data),
            usage: wgpu::BufferUsages::VERTEX,
        })
    }

    fn triangle_pipeline(&self) -> wgpu::RenderPipeline {
        let device = &self.gpu.device;
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("triangle_shader"),
            source: wgpu::ShaderSource::Wgsl(scene::TRIANGLE_WGSL.into()),
        });
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("triangle_pipeline_layout"),
            bind_group_layouts: &[],
            push_constant_ranges: &[],
        });

        device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("triangle_pipeline"),
            layout: Some(&layout),
            vertex: wgpu::VertexState {
                module: &module,
                entry_point: "vs_main",
                buffers: &[
                    wgpu::VertexBufferLayout {
                        array_stride: VERTEX_STRIDE,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &wgpu::vertex_attr_array![0 => Float32x3],
                    },
                    wgpu::VertexBufferLayout {
                        array_stride: VERTEX_STRIDE,
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &wgpu::vertex_attr_array![1 => Float32x3],
                    },
                ],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &module,
                entry_point: "fs_main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &[Some(wgpu::ColorTargetState {
                    format: FRAME_FORMAT,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                front_face: wgpu::FrontFace::Cw,
                cull_mode: None,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
        })
    }
}

impl Backend for WgpuBackend {
    type Encoder = WgpuEncoder;

    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn publish_device(&mut self, registry: &Registry, id: ResourceId) -> TabulaResult<()> {
        publish_once(registry, id, self.device_handle())
    }

    fn publish_scene(
        &mut self,
        registry: &Registry,
        ids: &IdLayout,
        workers: usize,
    ) -> TabulaResult<Vec<SharedIds>> {
        self.publish_device(registry, ids.device)?;

        registry.publish(
            ids.pipeline,
            ResourceHandle::new(ResourceKind::Pipeline, self.triangle_pipeline()).with_label("triangle_pipeline"),
        )?;
        registry.publish(
            ids.color_buffer,
            ResourceHandle::new(ResourceKind::Buffer, self.vertex_buffer("color_buffer", &scene::COLORS)),
        )?;

        let index_buffer = self.gpu.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("index_buffer"),
            contents: &scene::padded(bytemuck::cast_slice(&scene::INDICES)),
            usage: wgpu::BufferUsages::INDEX,
        });
        registry.publish(ids.index_buffer, ResourceHandle::new(ResourceKind::Buffer, index_buffer))?;

        let mut shared = Vec::with_capacity(workers);
        for worker in 0..workers {
            let positions = scene::triangle_positions(lane_center(worker, workers));
            let buffer = self.vertex_buffer(&format!("position_buffer_{}", worker), &positions);
            let position_id = ids.position_id(worker)?;
            registry.publish(position_id, ResourceHandle::new(ResourceKind::Buffer, buffer))?;
            shared.push(SharedIds {
                device: ids.device,
                pipeline: Some(ids.pipeline),
                vertex_buffers: vec![position_id, ids.color_buffer],
                index_buffer: Some(ids.index_buffer),
            });
        }

        tracing::info!("wgpu scene published for {} workers", workers);
        Ok(shared)
    }

    fn publish_frame_target(
        &mut self,
        registry: &Registry,
        id: ResourceId,
        cycle: u64,
    ) -> TabulaResult<()> {
        let label = format!("frame_target_c{}", cycle);
        registry.insert_as(
            ContextId::Orchestrator,
            id,
            ResourceHandle::new(ResourceKind::TextureView, self.gpu.frame_view()).with_label(label),
        )?;
        Ok(())
    }

    fn submit(&mut self, cycle: u64, batch: &[ResourceHandle]) -> TabulaResult<()> {
        if batch.iter().all(|handle| handle.is::<EncodedCommands>()) {
            let buffers = batch
                .iter()
                .filter_map(|handle| handle.downcast::<EncodedCommands>())
                .map(|commands| commands.take())
                .collect::<TabulaResult<Vec<_>>>()?;
            let count = buffers.len();
            self.gpu.queue.submit(buffers);
            self.frames_submitted += 1;
            tracing::trace!("wgpu submit: cycle {} with {} command buffers", cycle, count);
            return Ok(());
        }

        let bundles = batch
            .iter()
            .map(|handle| {
                handle.downcast::<wgpu::RenderBundle>().ok_or_else(|| {
                    TabulaError::device(format!("{} is not a render bundle", handle.type_name()))
                })
            })
            .collect::<TabulaResult<Vec<_>>>()?;

        let view = self.gpu.frame_view();
        let mut encoder = self
            .gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("frame_encoder") });
        {
            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("frame_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            rpass.set_viewport(0.0, 0.0, self.width as f32, self.height as f32, 0.0, 1.0);
            rpass.execute_bundles(bundles.iter().map(|bundle| &**bundle));
        }

        self.gpu.queue.submit(Some(encoder.finish()));
        self.frames_submitted += 1;
        tracing::trace!("wgpu submit: cycle {} with {} bundles", cycle, bundles.len());
        Ok(())
    }

    fn present(&mut self) -> TabulaResult<()> {
        // Offscreen target: presenting only lets the device make progress.
        let _ = self.gpu.device.poll(wgpu::Maintain::Poll);
        Ok(())
    }

    fn wait_idle(&mut self) -> TabulaResult<()> {
        let _ = self.gpu.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}

pub struct WgpuEncoder {
    worker: usize,
    width: u32,
    height: u32,
    device: Arc<wgpu::Device>,
    pipeline: Option<Arc<wgpu::RenderPipeline>>,
    vertex_buffers: Vec<Arc<wgpu::Buffer>>,
    index_buffer: Option<Arc<wgpu::Buffer>>,
    compute: Option<wgpu::ComputePipeline>,
}

impl WgpuEncoder {
    fn pipeline(&self) -> TabulaResult<&wgpu::RenderPipeline> {
        self.pipeline
            .as_deref()
            .ok_or_else(|| TabulaError::InvalidArgument("no render pipeline bound".into()))
    }

    fn encode_bundle(&self, cycle: u64) -> TabulaResult<ResourceHandle> {
        let pipeline = self.pipeline()?;
        let mut encoder = self
            .device
            .create_render_bundle_encoder(&wgpu::RenderBundleEncoderDescriptor {
                label: Some("worker_bundle_encoder"),
                color_formats: &[Some(FRAME_FORMAT)],
                depth_stencil: None,
                sample_count: 1,
                multiview: None,
            });
        encoder.set_pipeline(pipeline);
        for (slot, buffer) in self.vertex_buffers.iter().enumerate() {
            encoder.set_vertex_buffer(slot as u32, buffer.slice(..));
        }
        match &self.index_buffer {
            Some(index) => {
                encoder.set_index_buffer(index.slice(..), wgpu::IndexFormat::Uint16);
                encoder.draw_indexed(0..scene::INDICES.len() as u32, 0, 0..1);
            }
            None => encoder.draw(0..3, 0..1),
        }
        let label = format!("bundle_w{}_c{}_{}x{}", self.worker, cycle, self.width, self.height);
        let bundle = encoder.finish(&wgpu::RenderBundleDescriptor { label: Some(&label) });

        Ok(ResourceHandle::new(ResourceKind::RenderBundle, bundle).with_label(label))
    }

    fn encode_commands(&self, cycle: u64, target: &ResourceHandle) -> TabulaResult<ResourceHandle> {
        let pipeline = self.pipeline()?;
        let view = target
            .downcast::<wgpu::TextureView>()
            .ok_or_else(|| TabulaError::device(format!("{} is not a texture view", target.type_name())))?;

        // The first worker clears the target, later passes draw over it.
        let load = if self.worker == 0 {
            wgpu::LoadOp::Clear(wgpu::Color::BLACK)
        } else {
            wgpu::LoadOp::Load
        };

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("worker_frame_encoder"),
        });
        {
            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("worker_frame_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
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
            rpass.set_pipeline(pipeline);
            rpass.set_viewport(0.0, 0.0, self.width as f32, self.height as f32, 0.0, 1.0);
            rpass.set_scissor_rect(0, 0, self.width, self.height);
            for (slot, buffer) in self.vertex_buffers.iter().enumerate() {
                rpass.set_vertex_buffer(slot as u32, buffer.slice(..));
            }
            match &self.index_buffer {
                Some(index) => {
                    rpass.set_index_buffer(index.slice(..), wgpu::IndexFormat::Uint16);
                    rpass.draw_indexed(0..scene::INDICES.len() as u32, 0, 0..1);
                }
                None => rpass.draw(0..3, 0..1),
            }
        }

        let label = format!("commands_w{}_c{}", self.worker, cycle);
        let commands = EncodedCommands::new(label.clone(), encoder.finish());
        Ok(ResourceHandle::new(ResourceKind::CommandBuffer, commands).with_label(label))
    }

    fn compute_pipeline(device: &wgpu::Device) -> wgpu::ComputePipeline {
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("bench_compute_shader"),
            source: wgpu::ShaderSource::Wgsl(scene::EMPTY_COMPUTE_WGSL.into()),
        });
        device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("bench_compute_pipeline"),
            layout: None,
            module: &module,
            entry_point: "main",
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        })
    }
}

impl WorkerEncoder for WgpuEncoder {
    fn bind(ctx: &WorkerContext, registry: &Registry) -> TabulaResult<Self> {
        let context = ContextId::worker(ctx.index);
        let device = registry.resolve_as::<wgpu::Device>(context, ctx.shared.device)?;
        let pipeline = ctx
            .shared
            .pipeline
            .map(|id| registry.resolve_as::<wgpu::RenderPipeline>(context, id))
            .transpose()?;
        let vertex_buffers = ctx
            .shared
            .vertex_buffers
            .iter()
            .map(|id| registry.resolve_as::<wgpu::Buffer>(context, *id))
            .collect::<TabulaResult<Vec<_>>>()?;
        let index_buffer = ctx
            .shared
            .index_buffer
            .map(|id| registry.resolve_as::<wgpu::Buffer>(context, id))
            .transpose()?;

        Ok(Self {
            worker: ctx.index,
            width: ctx.width,
            height: ctx.height,
            device,
            pipeline,
            vertex_buffers,
            index_buffer,
            compute: None,
        })
    }

    fn encode_frame(
        &mut self,
        cycle: u64,
        target: Option<&ResourceHandle>,
    ) -> TabulaResult<ResourceHandle> {
        match target {
            None => self.encode_bundle(cycle),
            Some(target) => self.encode_commands(cycle, target),
        }
    }

    fn encode_workload(&mut self, dispatch_count: u32) -> TabulaResult<()> {
        let device = &self.device;
        let pipeline = self.compute.get_or_insert_with(|| Self::compute_pipeline(device));

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("bench_encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("bench_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            let (x, y, z) = scene::WORKLOAD_DISPATCH;
            for _ in 0..dispatch_count {
                pass.dispatch_workgroups(x, y, z);
            }
        }
        // Finished but never submitted: the measurement is encode cost only.
        let _ = encoder.finish();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> Option<WgpuBackend> {
        match WgpuBackend::new(64, 64) {
            Ok(backend) => Some(backend),
            Err(e) => {
                eprintln!("skipping wgpu test: {}", e);
                None
            }
        }
    }

    fn encoders(registry: &Registry, shared: Vec<SharedIds>, ids: &IdLayout) -> Vec<WgpuEncoder> {
        shared
            .into_iter()
            .enumerate()
            .map(|(index, shared)| {
                let ctx = WorkerContext {
                    index,
                    output_id: ids.output_id(index).unwrap(),
                    shared,
                    frame_target: None,
                    width: 64,
                    height: 64,
                };
                WgpuEncoder::bind(&ctx, registry).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_wgpu_frame_round() {
        let Some(mut backend) = backend() else {
            return;
        };
        let registry = Registry::new();
        let ids = IdLayout::default();
        let shared = backend.publish_scene(&registry, &ids, 2).unwrap();

        let mut batch = Vec::new();
        for mut encoder in encoders(&registry, shared, &ids) {
            encoder.encode_workload(16).unwrap();
            batch.push(encoder.encode_frame(0, None).unwrap());
        }

        backend.submit(0, &batch).unwrap();
        backend.present().unwrap();
        backend.wait_idle().unwrap();
        assert_eq!(backend.frames_submitted(), 1);
    }

    #[test]
    fn test_wgpu_command_buffer_round() {
        let Some(mut backend) = backend() else {
            return;
        };
        let registry = Registry::new();
        let ids = IdLayout::default();
        let shared = backend.publish_scene(&registry, &ids, 2).unwrap();
        registry.claim(ids.frame_target, ContextId::Orchestrator).unwrap();
        backend.publish_frame_target(&registry, ids.frame_target, 0).unwrap();
        let target = registry.get(ids.frame_target).unwrap();

        let batch: Vec<ResourceHandle> = encoders(&registry, shared, &ids)
            .iter_mut()
            .map(|encoder| encoder.encode_frame(0, Some(&target)).unwrap())
            .collect();

        backend.submit(0, &batch).unwrap();
        backend.wait_idle().unwrap();
        assert_eq!(backend.frames_submitted(), 1);
        assert!(matches!(backend.submit(1, &batch), Err(TabulaError::Device(_))));
    }
}
