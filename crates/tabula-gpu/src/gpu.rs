//! wgpu bootstrap: one shared device and queue, and the offscreen texture every
//! frame renders into.

use std::sync::Arc;

use anyhow::Result;
use wgpu::{Device, Extent3d, Queue, Texture, TextureFormat, TextureUsages, TextureView};

pub const FRAME_FORMAT: TextureFormat = TextureFormat::Bgra8Unorm;

/// Device, queue and frame target for the wgpu backend.
///
/// The device is reference counted so it can be published into the registry and
/// resolved by workers while the orchestrator keeps using it.
pub struct GpuContext {
    pub device: Arc<Device>,
    pub queue: Queue,
    frame_target: Texture,
}

impl GpuContext {
    /// Acquire an adapter and device, and allocate a `width` x `height` frame target.
    pub fn init(width: u32, height: u32) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| anyhow::anyhow!("Failed to find suitable wgpu adapter"))?;

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("Tabula Shared Device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
            },
            None,
        ))?;

        let info = adapter.get_info();
        tracing::info!("wgpu adapter: {} ({:?})", info.name, info.backend);

        let frame_target = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("frame_target"),
            size: Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: FRAME_FORMAT,
            usage: TextureUsages::RENDER_ATTACHMENT | TextureUsages::COPY_SRC,
            view_formats: &[],
        });

        Ok(Self {
            device: Arc::new(device),
            queue,
            frame_target,
        })
    }

    /// A fresh view of the frame target.
    pub fn frame_view(&self) -> TextureView {
        self.frame_target.create_view(&wgpu::TextureViewDescriptor::default())
    }
}
