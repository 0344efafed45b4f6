// Renderer - ties the device, swapchain and frame slots together
//
// `Presenter` is the real GPU side of the frame loop; `Renderer` is what the
// window layer talks to.

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;

use crate::backend::{FrameSync, ShaderSet, SwapchainManager, VulkanDevice};
use crate::config::Config;
use crate::error::RendererError;
use crate::frame::{Acquired, FrameOutcome, FrameSynchronizer, FrameTarget, Presented};

/// Map an acquire result onto the frame loop.
///
/// The flag is set when the image-available semaphore was signalled but the
/// image will not be drawn, leaving a signal nobody waits on. Out-of-date
/// acquires signal nothing. Any other error is fatal.
fn classify_acquire(result: VkResult<(u32, bool)>) -> Result<(Acquired, bool)> {
    match result {
        Ok((image, false)) => Ok((Acquired::Image(image), false)),
        Ok((_, true)) => Ok((Acquired::Stale, true)),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok((Acquired::Stale, false)),
        Err(e) => Err(e).context("Failed to acquire swapchain image"),
    }
}

/// Out-of-date and suboptimal presents ask for a rebuild; other errors are fatal.
fn classify_present(result: VkResult<bool>) -> Result<Presented> {
    match result {
        Ok(false) => Ok(Presented::Done),
        Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Presented::Stale),
        Err(e) => Err(e).context("Failed to present swapchain image"),
    }
}

/// Frame slots plus the swapchain they present to.
///
/// Field order matters for Drop: slots, then swapchain, then the device handle.
pub struct Presenter {
    slots: Vec<FrameSync>,
    swapchain: SwapchainManager,
    window_extent: vk::Extent2D,
    /// Slot whose image-available semaphore was signalled by an abandoned acquire
    stale_acquire: Option<usize>,
    device: Arc<VulkanDevice>,
}

impl Presenter {
    fn slot(&self, slot: usize) -> Result<&FrameSync> {
        self.slots
            .get(slot)
            .with_context(|| format!("Frame slot {} out of range", slot))
    }
}

impl FrameTarget for Presenter {
    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        self.slot(slot)?.in_flight.wait()
    }

    fn acquire(&mut self, slot: usize) -> Result<Acquired> {
        let semaphore = self.slot(slot)?.image_available.handle;
        let swapchain = &self.swapchain.resources()?.swapchain;

        let result = swapchain.acquire_next_image(semaphore);

        let (acquired, orphaned_signal) = classify_acquire(result)?;
        if orphaned_signal {
            self.stale_acquire = Some(slot);
        }
        Ok(acquired)
    }

    fn reset_slot(&mut self, slot: usize) -> Result<()> {
        self.slot(slot)?.in_flight.reset()
    }

    fn submit(&mut self, slot: usize, image: u32) -> Result<()> {
        let frame = self.slot(slot)?;
        let resources = self.swapchain.resources()?;

        let command_buffer = *resources
            .command_buffers
            .handles
            .get(image as usize)
            .with_context(|| format!("No command buffer for image {}", image))?;

        let wait_semaphores = [frame.image_available.handle];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [command_buffer];
        let signal_semaphores = [frame.render_finished.handle];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info],
                frame.in_flight.handle,
            )
        }
        .map_err(RendererError::QueueSubmitFailed)?;

        Ok(())
    }

    fn present(&mut self, slot: usize, image: u32) -> Result<Presented> {
        let render_finished = self.slot(slot)?.render_finished.handle;
        let swapchain = &self.swapchain.resources()?.swapchain;

        classify_present(swapchain.present(self.device.present_queue, image, &[render_finished]))
    }

    fn rebuild(&mut self) -> Result<()> {
        log::info!(
            "Rebuilding swapchain for {}x{}",
            self.window_extent.width,
            self.window_extent.height
        );
        self.swapchain.rebuild(self.window_extent)?;

        let extent = self.swapchain.resources()?.config.extent;
        if extent != self.window_extent {
            log::debug!(
                "Surface settled on {}x{} instead of the window size",
                extent.width,
                extent.height
            );
        }

        // Device is idle after the rebuild
        if let Some(slot) = self.stale_acquire.take() {
            if let Some(frame) = self.slots.get_mut(slot) {
                frame.replace_image_available(&self.device)?;
            }
        }

        Ok(())
    }
}

/// Vulkan renderer for one window
pub struct Renderer {
    frames: FrameSynchronizer,
    presenter: Presenter,
    shut_down: bool,
}

impl Renderer {
    /// Bring up device, swapchain and frame slots for a window of `width` x `height`.
    pub fn new(
        config: &Config,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let shaders = ShaderSet::load(&config.shaders.vertex, &config.shaders.fragment)?;

        let settings = config.device_settings()?;
        let device = VulkanDevice::new(&settings, display_handle, window_handle)?;

        let window_extent = vk::Extent2D { width, height };
        let swapchain = SwapchainManager::new(
            device.clone(),
            shaders,
            config.graphics.clear_color,
            config.present_mode(),
            window_extent,
        )?;

        let frames = FrameSynchronizer::new(config.graphics.max_frames_in_flight);
        let slots = FrameSync::create_slots(&device, frames.frames_in_flight())?;
        log::info!("{} frames in flight", slots.len());

        Ok(Self {
            frames,
            presenter: Presenter {
                slots,
                swapchain,
                window_extent,
                stale_acquire: None,
                device,
            },
            shut_down: false,
        })
    }

    /// Draw one frame at the current framebuffer size.
    ///
    /// Returns `false` when nothing was presented: the window has no area,
    /// or the iteration went to a swapchain rebuild.
    pub fn draw_frame(&mut self, width: u32, height: u32) -> Result<bool> {
        if self.shut_down || width == 0 || height == 0 {
            return Ok(false);
        }
        self.presenter.window_extent = vk::Extent2D { width, height };

        match self.frames.draw_frame(&mut self.presenter)? {
            FrameOutcome::Presented { .. } => Ok(true),
            FrameOutcome::Rebuilt => Ok(false),
        }
    }

    /// Mark the swapchain as out of date, e.g. after a resize
    pub fn request_rebuild(&mut self) {
        self.frames.request_rebuild();
    }

    /// Drive the device idle and destroy the swapchain resources. Safe to call twice.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        self.presenter.device.wait_idle()?;
        self.presenter.swapchain.teardown();
        log::info!("Renderer shut down");
        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Renderer shutdown failed: {:?}", e);
        }
    }
}
