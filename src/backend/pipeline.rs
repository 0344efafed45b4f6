// Render pass, graphics pipeline and framebuffers
//
// All three depend on the swapchain format or extent, so they are rebuilt
// together with it. Vertex positions live in the vertex shader; there is no
// vertex input, depth buffer or descriptor state.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::shader::{ShaderModule, ShaderSet};
use super::VulkanDevice;

/// Single-subpass render pass with one color attachment that ends up presentable
pub struct RenderPass {
    device: Arc<VulkanDevice>,
    pub handle: vk::RenderPass,
}

impl RenderPass {
    pub fn new(device: &Arc<VulkanDevice>, format: vk::Format) -> Result<Self> {
        // Color attachment (the swapchain image)
        let color_attachment = vk::AttachmentDescription::default()
            .format(format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

        let color_attachment_ref = vk::AttachmentReference::default()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

        let color_attachments = [color_attachment_ref];
        let subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_attachments);

        // The layout transition must wait until the acquired image is released
        // by the presentation engine, which the submit gates at this stage.
        let dependency = vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            );

        let attachments = [color_attachment];
        let subpasses = [subpass];
        let dependencies = [dependency];

        let render_pass_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let handle = unsafe { device.device.create_render_pass(&render_pass_info, None) }
            .context("Failed to create render pass")?;

        Ok(Self {
            device: device.clone(),
            handle,
        })
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_render_pass(self.handle, None) };
    }
}

/// Graphics pipeline together with its layout
pub struct GraphicsPipeline {
    device: Arc<VulkanDevice>,
    pub handle: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

impl GraphicsPipeline {
    /// Fixed triangle pipeline. Viewport and scissor are baked to `extent`.
    pub fn new(
        device: &Arc<VulkanDevice>,
        render_pass: &RenderPass,
        extent: vk::Extent2D,
        shaders: &ShaderSet,
    ) -> Result<Self> {
        // Modules are only needed until the pipeline is created
        let vert_module = ShaderModule::new(device, &shaders.vertex)?;
        let frag_module = ShaderModule::new(device, &shaders.fragment)?;

        let entry_point = c"main";
        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert_module.handle)
                .name(entry_point),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag_module.handle)
                .name(entry_point),
        ];

        // No vertex buffers
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::default();

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        let viewports = [vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }];
        let scissors = [vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        }];
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(&viewports)
            .scissors(&scissors);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .min_sample_shading(1.0);

        // Opaque, no blending
        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .logic_op(vk::LogicOp::COPY)
            .attachments(&color_blend_attachments);

        // Empty layout: no descriptors, no push constants
        let layout_info = vk::PipelineLayoutCreateInfo::default();
        let layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }
            .context("Failed to create pipeline layout")?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blending)
            .layout(layout)
            .render_pass(render_pass.handle)
            .subpass(0);

        let pipelines = unsafe {
            device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };

        let handle = match pipelines {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                unsafe { device.device.destroy_pipeline_layout(layout, None) };
                return Err(e).context("Failed to create graphics pipeline");
            }
        };

        Ok(Self {
            device: device.clone(),
            handle,
            layout,
        })
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_pipeline(self.handle, None);
            self.device.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Render target binding for one swapchain image
pub struct Framebuffer {
    device: Arc<VulkanDevice>,
    pub handle: vk::Framebuffer,
}

impl Framebuffer {
    pub fn new(
        device: &Arc<VulkanDevice>,
        render_pass: &RenderPass,
        image_view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        let attachments = [image_view];
        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass.handle)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        let handle = unsafe { device.device.create_framebuffer(&framebuffer_info, None) }
            .context("Failed to create framebuffer")?;

        Ok(Self {
            device: device.clone(),
            handle,
        })
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_framebuffer(self.handle, None) };
    }
}

/// Create framebuffers for each swapchain image view
pub fn create_framebuffers(
    device: &Arc<VulkanDevice>,
    render_pass: &RenderPass,
    image_views: &[vk::ImageView],
    extent: vk::Extent2D,
) -> Result<Vec<Framebuffer>> {
    image_views
        .iter()
        .map(|&view| Framebuffer::new(device, render_pass, view, extent))
        .collect()
}
