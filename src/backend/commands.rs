// Command pool, command buffers and the per-image draw recording
//
// Buffers are recorded once per swapchain build and resubmitted every frame.
// They hold no per-frame data, so they stay valid until the next rebuild.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::pipeline::{Framebuffer, GraphicsPipeline, RenderPass};
use super::VulkanDevice;
use crate::error::RendererError;

pub struct CommandPool {
    device: Arc<VulkanDevice>,
    pub handle: vk::CommandPool,
}

impl CommandPool {
    pub fn new(device: &Arc<VulkanDevice>, queue_family: u32) -> Result<Arc<Self>> {
        let pool_info = vk::CommandPoolCreateInfo::default().queue_family_index(queue_family);

        let handle = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        Ok(Arc::new(Self {
            device: device.clone(),
            handle,
        }))
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_command_pool(self.handle, None) };
    }
}

/// Primary command buffers allocated together and freed together, once
pub struct CommandBuffers {
    pool: Arc<CommandPool>,
    pub handles: Vec<vk::CommandBuffer>,
}

impl CommandBuffers {
    pub fn allocate(pool: &Arc<CommandPool>, count: usize) -> Result<Self> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool.handle)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);

        let handles = unsafe { pool.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")?;

        Ok(Self {
            pool: pool.clone(),
            handles,
        })
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for CommandBuffers {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        unsafe {
            self.pool
                .device
                .device
                .free_command_buffers(self.pool.handle, &self.handles)
        };
    }
}

/// Everything one recorded draw needs
pub struct DrawTarget<'a> {
    pub render_pass: &'a RenderPass,
    pub pipeline: &'a GraphicsPipeline,
    pub framebuffers: &'a [Framebuffer],
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
}

/// Record clear + one triangle into each buffer, buffer `i` targeting framebuffer `i`.
pub fn record_draw_commands(
    device: &ash::Device,
    command_buffers: &CommandBuffers,
    target: &DrawTarget<'_>,
) -> Result<(), RendererError> {
    debug_assert_eq!(command_buffers.len(), target.framebuffers.len());

    let clear_values = [vk::ClearValue {
        color: vk::ClearColorValue {
            float32: target.clear_color,
        },
    }];
    let render_area = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: target.extent,
    };

    for (&cmd, framebuffer) in command_buffers.handles.iter().zip(target.framebuffers) {
        // Simultaneous use: the same buffer may be pending on two frame slots
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::SIMULTANEOUS_USE);

        let render_pass_info = vk::RenderPassBeginInfo::default()
            .render_pass(target.render_pass.handle)
            .framebuffer(framebuffer.handle)
            .render_area(render_area)
            .clear_values(&clear_values);

        unsafe {
            device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(RendererError::CommandRecordingFailed)?;

            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, target.pipeline.handle);
            device.cmd_draw(cmd, 3, 1, 0, 0);
            device.cmd_end_render_pass(cmd);

            device
                .end_command_buffer(cmd)
                .map_err(RendererError::CommandRecordingFailed)?;
        }
    }

    Ok(())
}
