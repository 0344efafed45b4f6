// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with optional validation layers
// - Presentation surface for the window
// - Physical device selection (see selector.rs)
// - Logical device + graphics/present queue retrieval

use anyhow::{Context, Result};
use ash::{vk, Entry};
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::collections::BTreeSet;
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

use super::probe::QueueFamilyIndices;
use super::selector::{select_device, DeviceCandidate, DeviceRequirements};
use crate::error::RendererError;

/// Startup configuration for instance creation and device selection
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub app_name: CString,
    pub validation: bool,
    pub required_layers: Vec<CString>,
    pub required_extensions: Vec<CString>,
    pub require_geometry_shader: bool,
}

impl DeviceSettings {
    pub fn requirements(&self) -> DeviceRequirements<'_> {
        DeviceRequirements {
            extensions: &self.required_extensions,
            geometry_shader: self.require_geometry_shader,
        }
    }
}

/// Vulkan device wrapper with automatic cleanup.
///
/// Owns everything that lives for the whole process: instance, debug
/// messenger, surface, and logical device.
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: Entry,

    pub surface: vk::SurfaceKHR,
    pub surface_loader: ash::khr::surface::Instance,

    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub present_queue_family: u32,

    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanDevice {
    /// Create instance, surface and logical device for the given window.
    pub fn new(
        settings: &DeviceSettings,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<Arc<Self>> {
        log::info!("Creating Vulkan device: {}", settings.app_name.to_string_lossy());

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance (validation is checked first)
        if settings.validation {
            Self::check_validation_layers(&entry, &settings.required_layers)?;
        }
        let instance = Self::create_instance(&entry, settings, display_handle)?;

        // Step 3: Setup debug messenger if validation enabled
        let debug_utils = if settings.validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };

        // Step 4: Create surface
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);
        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
        }
        .context("Failed to create window surface")?;

        // Step 5: Pick physical device (GPU)
        let candidates = DeviceCandidate::enumerate(
            &instance,
            &surface_loader,
            surface,
            settings.requirements(),
        )?;
        let chosen = select_device(&candidates, settings.requirements())?;
        let (graphics_queue_family, present_queue_family) = chosen
            .queue_families
            .pair()
            .ok_or(RendererError::NoSuitableDevice)?;
        let physical_device = chosen.handle;

        // Step 6: Create logical device
        let device = Self::create_logical_device(
            &instance,
            physical_device,
            chosen.queue_families,
            &settings.required_extensions,
        )?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_queue_family, 0) };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        log::info!("Selected GPU: {}", chosen.name);
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!(
            "Queue families: graphics {}, present {}",
            graphics_queue_family,
            present_queue_family
        );

        Ok(Arc::new(Self {
            device,
            physical_device,
            instance,
            _entry: entry,
            surface,
            surface_loader,
            graphics_queue,
            present_queue,
            graphics_queue_family,
            present_queue_family,
            debug_utils,
        }))
    }

    fn check_validation_layers(entry: &Entry, required: &[CString]) -> Result<()> {
        let available = unsafe { entry.enumerate_instance_layer_properties() }
            .context("Failed to enumerate instance layers")?;

        for layer in required {
            let found = available
                .iter()
                .any(|props| props.layer_name_as_c_str().is_ok_and(|name| name == layer.as_c_str()));

            if !found {
                return Err(
                    RendererError::ValidationUnavailable(layer.to_string_lossy().into_owned()).into(),
                );
            }
        }

        Ok(())
    }

    fn create_instance(
        entry: &Entry,
        settings: &DeviceSettings,
        display_handle: RawDisplayHandle,
    ) -> Result<ash::Instance> {
        let engine_name = c"No Engine";

        let app_info = vk::ApplicationInfo::default()
            .application_name(&settings.app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        // Platform-specific surface extensions
        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .context("Failed to query required surface extensions")?
            .to_vec();
        if settings.validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let layer_names: Vec<*const c_char> =
            settings.required_layers.iter().map(|l| l.as_ptr()).collect();

        // Chained messenger covers instance creation and destruction
        let mut debug_info = debug_messenger_info();

        let mut create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        if settings.validation {
            create_info = create_info.push_next(&mut debug_info);
        }

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let messenger = unsafe {
            debug_utils.create_debug_utils_messenger(&debug_messenger_info(), None)
        }
        .context("Failed to set up debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: QueueFamilyIndices,
        required_extensions: &[CString],
    ) -> Result<ash::Device> {
        // One queue per unique family
        let unique_families: BTreeSet<u32> = [queue_families.graphics, queue_families.present]
            .into_iter()
            .flatten()
            .collect();

        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = unique_families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let extensions: Vec<*const c_char> =
            required_extensions.iter().map(|e| e.as_ptr()).collect();

        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        Ok(device)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("Failed to wait for device idle")?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // Cleanup in reverse order
        unsafe {
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

fn debug_messenger_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
}

// Debug callback for validation layers. Logs only, never aborts the call.
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("[Vulkan] {}", message),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("[Vulkan] {}", message),
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::info!("[Vulkan] {}", message),
        _ => log::debug!("[Vulkan] {}", message),
    }

    vk::FALSE
}
