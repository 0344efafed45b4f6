// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen, plus
// every object sized or formatted after it. The whole set is replaced at
// once whenever the surface goes stale or the window is resized.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::commands::{record_draw_commands, CommandBuffers, CommandPool, DrawTarget};
use super::pipeline::{create_framebuffers, Framebuffer, GraphicsPipeline, RenderPass};
use super::probe::SurfaceSupport;
use super::shader::ShaderSet;
use super::VulkanDevice;
use crate::error::RendererError;

/// `current_extent` value meaning "the window decides"
pub const UNDEFINED_EXTENT: u32 = u32::MAX;

// =============================================================================
// NEGOTIATION
// =============================================================================

/// Prefer BGRA8 UNORM with sRGB non-linear color space, else the first listed format.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_UNORM
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// Use `preferred` when the surface lists it. FIFO is always supported.
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if modes.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// A defined current extent wins; otherwise clamp the window framebuffer size.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != UNDEFINED_EXTENT {
        return caps.current_extent;
    }

    vk::Extent2D {
        width: window
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: window
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped by the maximum when there is one (0 = unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && count > caps.max_image_count {
        caps.max_image_count
    } else {
        count
    }
}

/// How swapchain images are shared between the graphics and present families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSharing {
    Exclusive,
    Concurrent([u32; 2]),
}

impl ImageSharing {
    pub fn for_families(graphics: u32, present: u32) -> Self {
        if graphics == present {
            Self::Exclusive
        } else {
            Self::Concurrent([graphics, present])
        }
    }

    pub fn mode(&self) -> vk::SharingMode {
        match self {
            Self::Exclusive => vk::SharingMode::EXCLUSIVE,
            Self::Concurrent(_) => vk::SharingMode::CONCURRENT,
        }
    }

    pub fn family_indices(&self) -> &[u32] {
        match self {
            Self::Exclusive => &[],
            Self::Concurrent(indices) => indices,
        }
    }
}

/// Parameters negotiated from one surface support snapshot
#[derive(Debug, Clone, Copy)]
pub struct SwapchainConfig {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub sharing: ImageSharing,
    pub transform: vk::SurfaceTransformFlagsKHR,
}

impl SwapchainConfig {
    pub fn negotiate(
        support: &SurfaceSupport,
        window_extent: vk::Extent2D,
        preferred_present_mode: vk::PresentModeKHR,
        graphics_family: u32,
        present_family: u32,
    ) -> Result<Self, RendererError> {
        let surface_format = choose_surface_format(&support.formats)
            .ok_or(RendererError::SwapchainCreationFailed(vk::Result::ERROR_FORMAT_NOT_SUPPORTED))?;

        Ok(Self {
            surface_format,
            present_mode: choose_present_mode(&support.present_modes, preferred_present_mode),
            extent: choose_extent(&support.capabilities, window_extent),
            image_count: choose_image_count(&support.capabilities),
            sharing: ImageSharing::for_families(graphics_family, present_family),
            transform: support.capabilities.current_transform,
        })
    }
}

// =============================================================================
// OWNED OBJECTS
// =============================================================================

/// The swapchain handle and the images it owns
pub struct Swapchain {
    loader: ash::khr::swapchain::Device,
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
}

impl Swapchain {
    fn new(
        loader: &ash::khr::swapchain::Device,
        surface: vk::SurfaceKHR,
        config: &SwapchainConfig,
    ) -> Result<Self> {
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(config.image_count)
            .image_format(config.surface_format.format)
            .image_color_space(config.surface_format.color_space)
            .image_extent(config.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(config.sharing.mode())
            .queue_family_indices(config.sharing.family_indices())
            .pre_transform(config.transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(config.present_mode)
            .clipped(true);

        let handle = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(RendererError::SwapchainCreationFailed)?;

        // Owned from here so an image query failure still destroys the handle
        let mut swapchain = Self {
            loader: loader.clone(),
            handle,
            images: Vec::new(),
        };

        swapchain.images = unsafe { loader.get_swapchain_images(handle) }
            .context("Failed to get swapchain images")?;

        Ok(swapchain)
    }

    /// Acquire next image for rendering, signalling `semaphore` when it is ready.
    /// Returns the index and whether the swapchain is suboptimal.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> ash::prelude::VkResult<(u32, bool)> {
        unsafe {
            self.loader
                .acquire_next_image(self.handle, u64::MAX, semaphore, vk::Fence::null())
        }
    }

    /// Queue `image_index` for presentation once `wait_semaphores` signal.
    /// Returns whether the swapchain is suboptimal.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> ash::prelude::VkResult<bool> {
        let swapchains = [self.handle];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        unsafe { self.loader.queue_present(queue, &present_info) }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe { self.loader.destroy_swapchain(self.handle, None) };
    }
}

pub struct ImageView {
    device: Arc<VulkanDevice>,
    pub handle: vk::ImageView,
}

impl ImageView {
    fn new(device: &Arc<VulkanDevice>, image: vk::Image, format: vk::Format) -> Result<Self> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        let handle = unsafe { device.device.create_image_view(&create_info, None) }
            .context("Failed to create image view")?;

        Ok(Self {
            device: device.clone(),
            handle,
        })
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_image_view(self.handle, None) };
    }
}

/// Everything that depends on the swapchain.
///
/// Fields drop top to bottom, so command buffers go first and the
/// swapchain itself goes last. Every per-image vector has one entry
/// per swapchain image. The underscored fields are only held for their
/// destruction; the recorded command buffers already reference them.
pub struct SwapchainResources {
    pub command_buffers: CommandBuffers,
    _framebuffers: Vec<Framebuffer>,
    _pipeline: GraphicsPipeline,
    _render_pass: RenderPass,
    _image_views: Vec<ImageView>,
    pub swapchain: Swapchain,
    pub config: SwapchainConfig,
}

// =============================================================================
// MANAGER
// =============================================================================

/// Builds, rebuilds and tears down the swapchain resource set.
///
/// Callers must not hold on to images or command buffers across `rebuild`:
/// they are destroyed there.
pub struct SwapchainManager {
    resources: Option<SwapchainResources>,
    command_pool: Arc<CommandPool>,
    loader: ash::khr::swapchain::Device,
    shaders: ShaderSet,
    clear_color: [f32; 4],
    preferred_present_mode: vk::PresentModeKHR,
    device: Arc<VulkanDevice>,
}

impl SwapchainManager {
    pub fn new(
        device: Arc<VulkanDevice>,
        shaders: ShaderSet,
        clear_color: [f32; 4],
        preferred_present_mode: vk::PresentModeKHR,
        window_extent: vk::Extent2D,
    ) -> Result<Self> {
        let loader = ash::khr::swapchain::Device::new(&device.instance, &device.device);
        let command_pool = CommandPool::new(&device, device.graphics_queue_family)?;

        let mut manager = Self {
            resources: None,
            command_pool,
            loader,
            shaders,
            clear_color,
            preferred_present_mode,
            device,
        };
        manager.resources = Some(manager.build(window_extent)?);

        Ok(manager)
    }

    /// Create a complete resource set for the current surface state
    pub fn build(&self, window_extent: vk::Extent2D) -> Result<SwapchainResources> {
        let device = &self.device;

        let support =
            SurfaceSupport::probe(&device.surface_loader, device.physical_device, device.surface)?;
        let config = SwapchainConfig::negotiate(
            &support,
            window_extent,
            self.preferred_present_mode,
            device.graphics_queue_family,
            device.present_queue_family,
        )?;

        let swapchain = Swapchain::new(&self.loader, device.surface, &config)?;

        let image_views = swapchain
            .images
            .iter()
            .map(|&image| ImageView::new(device, image, config.surface_format.format))
            .collect::<Result<Vec<_>>>()?;

        let render_pass = RenderPass::new(device, config.surface_format.format)?;
        let pipeline = GraphicsPipeline::new(device, &render_pass, config.extent, &self.shaders)?;

        let view_handles: Vec<vk::ImageView> = image_views.iter().map(|v| v.handle).collect();
        let framebuffers = create_framebuffers(device, &render_pass, &view_handles, config.extent)?;

        let command_buffers = CommandBuffers::allocate(&self.command_pool, framebuffers.len())?;
        record_draw_commands(
            &device.device,
            &command_buffers,
            &DrawTarget {
                render_pass: &render_pass,
                pipeline: &pipeline,
                framebuffers: &framebuffers,
                extent: config.extent,
                clear_color: self.clear_color,
            },
        )?;

        log::info!(
            "Swapchain ready: {}x{}, {:?}/{:?}, {:?}, {} images ({:?} sharing)",
            config.extent.width,
            config.extent.height,
            config.surface_format.format,
            config.surface_format.color_space,
            config.present_mode,
            swapchain.images.len(),
            config.sharing.mode()
        );

        Ok(SwapchainResources {
            command_buffers,
            _framebuffers: framebuffers,
            _pipeline: pipeline,
            _render_pass: render_pass,
            _image_views: image_views,
            swapchain,
            config,
        })
    }

    /// Replace the whole resource set.
    ///
    /// Waits for the device to go idle, destroys the old set completely, then builds
    /// and records a new one.
    pub fn rebuild(&mut self, window_extent: vk::Extent2D) -> Result<()> {
        self.device.wait_idle()?;

        // Old set goes first: a surface backs at most one swapchain
        self.resources = None;
        self.resources = Some(self.build(window_extent)?);

        Ok(())
    }

    /// Destroy the resource set. Device must be idle. Safe to call twice.
    pub fn teardown(&mut self) {
        if self.resources.take().is_some() {
            log::info!("Swapchain resources destroyed");
        }
    }

    pub fn resources(&self) -> Result<&SwapchainResources> {
        self.resources.as_ref().context("Swapchain not initialized")
    }
}
