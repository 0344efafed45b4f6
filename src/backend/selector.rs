// Physical device selection
//
// Every enumerated GPU is turned into a plain-data DeviceCandidate, scored,
// and the best viable one wins. Scoring never touches Vulkan so it can be
// exercised without a GPU.

use anyhow::{Context, Result};
use ash::vk;
use std::collections::HashSet;
use std::ffi::{CStr, CString};

use super::probe::{QueueFamilyIndices, SurfaceSupport};
use crate::error::RendererError;

/// Bonus awarded to discrete GPUs on top of their max image dimension
const DISCRETE_GPU_BONUS: u64 = 1000;

/// What a device must offer to be considered at all
#[derive(Debug, Clone, Copy)]
pub struct DeviceRequirements<'a> {
    pub extensions: &'a [CString],
    pub geometry_shader: bool,
}

/// Snapshot of one physical device's scoring attributes
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub handle: vk::PhysicalDevice,
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub max_image_dimension_2d: u32,
    pub queue_families: QueueFamilyIndices,
    pub extensions: HashSet<CString>,
    pub geometry_shader: bool,
    /// Only probed when the device supports every required extension
    pub surface_support: Option<SurfaceSupport>,
}

impl DeviceCandidate {
    /// Describe every physical device visible to the instance, in enumeration order.
    pub fn enumerate(
        instance: &ash::Instance,
        surface_loader: &ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
        requirements: DeviceRequirements<'_>,
    ) -> Result<Vec<Self>> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        if devices.is_empty() {
            log::warn!("No Vulkan-capable GPU found");
        }

        devices
            .into_iter()
            .map(|device| Self::describe(instance, surface_loader, surface, device, requirements))
            .collect()
    }

    fn describe(
        instance: &ash::Instance,
        surface_loader: &ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
        handle: vk::PhysicalDevice,
        requirements: DeviceRequirements<'_>,
    ) -> Result<Self> {
        let props = unsafe { instance.get_physical_device_properties(handle) };
        let features = unsafe { instance.get_physical_device_features(handle) };

        let name = props
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "<unnamed device>".to_string());

        let extensions = unsafe { instance.enumerate_device_extension_properties(handle) }
            .context("Failed to enumerate device extensions")?
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok().map(CStr::to_owned))
            .collect::<HashSet<_>>();

        let queue_families = QueueFamilyIndices::find(instance, surface_loader, handle, surface)?;

        let mut candidate = Self {
            handle,
            name,
            device_type: props.device_type,
            max_image_dimension_2d: props.limits.max_image_dimension2_d,
            queue_families,
            extensions,
            geometry_shader: features.geometry_shader == vk::TRUE,
            surface_support: None,
        };

        if candidate.supports_extensions(requirements.extensions) {
            candidate.surface_support =
                Some(SurfaceSupport::probe(surface_loader, handle, surface)?);
        }

        Ok(candidate)
    }

    fn supports_extensions(&self, required: &[CString]) -> bool {
        required.iter().all(|ext| self.extensions.contains(ext))
    }

    /// Suitability score. Zero means the device cannot run this program.
    pub fn score(&self, requirements: DeviceRequirements<'_>) -> u64 {
        let swapchain_adequate = self
            .surface_support
            .as_ref()
            .is_some_and(SurfaceSupport::is_adequate);

        if !self.supports_extensions(requirements.extensions)
            || !self.queue_families.is_complete()
            || (requirements.geometry_shader && !self.geometry_shader)
            || !swapchain_adequate
        {
            return 0;
        }

        let mut score = u64::from(self.max_image_dimension_2d);
        if self.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += DISCRETE_GPU_BONUS;
        }
        score
    }
}

/// Pick the highest scoring candidate.
///
/// Ties go to the device enumerated first: a later candidate must score
/// strictly higher to replace the current best. A score-ordered map would
/// hand ties to the last device instead; keep the strict comparison.
pub fn select_device<'c>(
    candidates: &'c [DeviceCandidate],
    requirements: DeviceRequirements<'_>,
) -> Result<&'c DeviceCandidate, RendererError> {
    let mut best: Option<(&DeviceCandidate, u64)> = None;

    for candidate in candidates {
        let score = candidate.score(requirements);
        log::debug!("Scored {} for device: {}", score, candidate.name);

        if score > best.map_or(0, |(_, s)| s) {
            best = Some((candidate, score));
        }
    }

    best.map(|(candidate, _)| candidate)
        .ok_or(RendererError::NoSuitableDevice)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn swapchain_ext() -> Vec<CString> {
        vec![CString::new("VK_KHR_swapchain").unwrap()]
    }

    fn requirements(extensions: &[CString]) -> DeviceRequirements<'_> {
        DeviceRequirements {
            extensions,
            geometry_shader: true,
        }
    }

    fn capable(name: &str, device_type: vk::PhysicalDeviceType, max_dim: u32) -> DeviceCandidate {
        DeviceCandidate {
            handle: vk::PhysicalDevice::null(),
            name: name.to_string(),
            device_type,
            max_image_dimension_2d: max_dim,
            queue_families: QueueFamilyIndices {
                graphics: Some(0),
                present: Some(0),
            },
            extensions: swapchain_ext().into_iter().collect(),
            geometry_shader: true,
            surface_support: Some(SurfaceSupport {
                capabilities: vk::SurfaceCapabilitiesKHR::default(),
                formats: vec![vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                }],
                present_modes: vec![vk::PresentModeKHR::FIFO],
            }),
        }
    }

    #[test]
    fn discrete_beats_integrated() {
        let exts = swapchain_ext();
        let candidates = [
            capable("discrete", vk::PhysicalDeviceType::DISCRETE_GPU, 16384),
            capable("integrated", vk::PhysicalDeviceType::INTEGRATED_GPU, 8192),
        ];

        assert_eq!(candidates[0].score(requirements(&exts)), 17384);
        assert_eq!(candidates[1].score(requirements(&exts)), 8192);

        let chosen = select_device(&candidates, requirements(&exts)).unwrap();
        assert_eq!(chosen.name, "discrete");
    }

    #[test]
    fn larger_image_dimension_can_outscore_discrete_bonus() {
        let exts = swapchain_ext();
        let candidates = [
            capable("discrete", vk::PhysicalDeviceType::DISCRETE_GPU, 4096),
            capable("integrated", vk::PhysicalDeviceType::INTEGRATED_GPU, 16384),
        ];

        let chosen = select_device(&candidates, requirements(&exts)).unwrap();
        assert_eq!(chosen.name, "integrated");
    }

    #[test]
    fn each_missing_requirement_rejects() {
        let exts = swapchain_ext();
        let req = requirements(&exts);

        let mut no_ext = capable("a", vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        no_ext.extensions.clear();
        assert_eq!(no_ext.score(req), 0);

        let mut no_present = capable("b", vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        no_present.queue_families.present = None;
        assert_eq!(no_present.score(req), 0);

        let mut no_geometry = capable("c", vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        no_geometry.geometry_shader = false;
        assert_eq!(no_geometry.score(req), 0);

        let mut no_formats = capable("d", vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        no_formats.surface_support.as_mut().unwrap().formats.clear();
        assert_eq!(no_formats.score(req), 0);

        let mut no_modes = capable("e", vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        no_modes.surface_support.as_mut().unwrap().present_modes.clear();
        assert_eq!(no_modes.score(req), 0);

        let mut unprobed = capable("f", vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        unprobed.surface_support = None;
        assert_eq!(unprobed.score(req), 0);
    }

    #[test]
    fn geometry_shader_only_checked_when_required() {
        let exts = swapchain_ext();
        let mut device = capable("gpu", vk::PhysicalDeviceType::INTEGRATED_GPU, 2048);
        device.geometry_shader = false;

        let relaxed = DeviceRequirements {
            extensions: &exts,
            geometry_shader: false,
        };
        assert_eq!(device.score(relaxed), 2048);
    }

    #[test]
    fn viable_candidate_is_found_among_rejects() {
        let exts = swapchain_ext();
        let mut broken = capable("broken", vk::PhysicalDeviceType::DISCRETE_GPU, 32768);
        broken.queue_families.graphics = None;
        let candidates = [
            broken,
            capable("cpu", vk::PhysicalDeviceType::CPU, 1),
        ];

        let chosen = select_device(&candidates, requirements(&exts)).unwrap();
        assert_eq!(chosen.name, "cpu");
        assert!(chosen.score(requirements(&exts)) > 0);
    }

    #[test]
    fn all_rejected_is_no_suitable_device() {
        let exts = swapchain_ext();
        let mut a = capable("a", vk::PhysicalDeviceType::DISCRETE_GPU, 16384);
        a.geometry_shader = false;
        let mut b = capable("b", vk::PhysicalDeviceType::INTEGRATED_GPU, 8192);
        b.extensions.clear();

        let candidates = [a, b];
        let result = select_device(&candidates, requirements(&exts));
        assert!(matches!(result, Err(RendererError::NoSuitableDevice)));
    }

    #[test]
    fn no_candidates_is_no_suitable_device() {
        let exts = swapchain_ext();
        let result = select_device(&[], requirements(&exts));
        assert!(matches!(result, Err(RendererError::NoSuitableDevice)));
    }

    #[test]
    fn ties_go_to_first_enumerated() {
        let exts = swapchain_ext();
        let candidates = [
            capable("first", vk::PhysicalDeviceType::DISCRETE_GPU, 8192),
            capable("second", vk::PhysicalDeviceType::DISCRETE_GPU, 8192),
            capable("third", vk::PhysicalDeviceType::DISCRETE_GPU, 8192),
        ];

        let chosen = select_device(&candidates, requirements(&exts)).unwrap();
        assert_eq!(chosen.name, "first");
    }
}
