// Capability probing
//
// Point-in-time queries of what a physical device can do with our surface.
// Nothing here is cached: the swapchain re-probes on every (re)build.

use anyhow::{Context, Result};
use ash::vk;

/// Queue families able to run graphics work and present to the surface.
/// Both roles may be served by the same family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    /// Walk the device's queue families in order, stopping once both roles are filled.
    pub fn find(
        instance: &ash::Instance,
        surface_loader: &ash::khr::surface::Instance,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Self> {
        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        Self::from_families(&families, |index| {
            unsafe {
                surface_loader.get_physical_device_surface_support(physical_device, index, surface)
            }
            .context("Failed to query surface presentation support")
        })
    }

    pub fn from_families<F>(families: &[vk::QueueFamilyProperties], mut supports_present: F) -> Result<Self>
    where
        F: FnMut(u32) -> Result<bool>,
    {
        let mut indices = Self::default();

        for (i, family) in families.iter().enumerate() {
            let index = i as u32;
            if family.queue_count == 0 {
                continue;
            }
            if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
                indices.graphics = Some(index);
            }
            if supports_present(index)? {
                indices.present = Some(index);
            }
            if indices.is_complete() {
                break;
            }
        }

        Ok(indices)
    }

    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    /// Both indices, once complete
    pub fn pair(&self) -> Option<(u32, u32)> {
        Some((self.graphics?, self.present?))
    }
}

/// Surface support snapshot for one device/surface pair
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn probe(
        surface_loader: &ash::khr::surface::Instance,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Self> {
        let capabilities = unsafe {
            surface_loader.get_physical_device_surface_capabilities(physical_device, surface)
        }
        .context("Failed to query surface capabilities")?;

        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(physical_device, surface)
        }
        .context("Failed to query surface formats")?;

        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(physical_device, surface)
        }
        .context("Failed to query surface present modes")?;

        log::debug!(
            "Surface support: {} formats, {} present modes, image count {}..{}",
            formats.len(),
            present_modes.len(),
            capabilities.min_image_count,
            if capabilities.max_image_count == 0 {
                "unbounded".to_string()
            } else {
                capabilities.max_image_count.to_string()
            }
        );

        Ok(Self {
            capabilities,
            formats,
            present_modes,
        })
    }

    /// A swapchain needs at least one format and one present mode
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}
