// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync.
// Each handle is destroyed when its wrapper drops.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::RendererError;

/// GPU-timeline ordering signal
pub struct Semaphore {
    device: Arc<VulkanDevice>,
    pub handle: vk::Semaphore,
}

impl Semaphore {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self, RendererError> {
        let info = vk::SemaphoreCreateInfo::default();
        let handle = unsafe { device.device.create_semaphore(&info, None) }
            .map_err(RendererError::SyncObjectCreationFailed)?;

        Ok(Self {
            device: device.clone(),
            handle,
        })
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_semaphore(self.handle, None) };
    }
}

/// CPU-observable completion signal
pub struct Fence {
    device: Arc<VulkanDevice>,
    pub handle: vk::Fence,
}

impl Fence {
    pub fn new(device: &Arc<VulkanDevice>, signaled: bool) -> Result<Self, RendererError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::default().flags(flags);
        let handle = unsafe { device.device.create_fence(&info, None) }
            .map_err(RendererError::SyncObjectCreationFailed)?;

        Ok(Self {
            device: device.clone(),
            handle,
        })
    }

    /// Block until the fence signals. No timeout.
    pub fn wait(&self) -> Result<()> {
        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.handle], true, u64::MAX)
        }
        .context("Failed to wait for in-flight fence")
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.device.device.reset_fences(&[self.handle]) }
            .context("Failed to reset in-flight fence")
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_fence(self.handle, None) };
    }
}

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: Semaphore,
    pub render_finished: Semaphore,
    pub in_flight: Fence,
}

impl FrameSync {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self, RendererError> {
        Ok(Self {
            image_available: Semaphore::new(device)?,
            render_finished: Semaphore::new(device)?,
            // Start signaled so the first wait on each slot returns immediately
            in_flight: Fence::new(device, true)?,
        })
    }

    /// Create `count` slots
    pub fn create_slots(device: &Arc<VulkanDevice>, count: usize) -> Result<Vec<Self>, RendererError> {
        (0..count).map(|_| Self::new(device)).collect()
    }

    /// Swap in a fresh image-available semaphore.
    ///
    /// Needed when an acquire signalled the old one but the frame was
    /// abandoned, leaving a signal nobody will wait on. Device must be idle.
    pub fn replace_image_available(&mut self, device: &Arc<VulkanDevice>) -> Result<(), RendererError> {
        self.image_available = Semaphore::new(device)?;
        Ok(())
    }
}
