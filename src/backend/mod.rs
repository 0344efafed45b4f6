// Backend module - Vulkan abstraction layer
//
// Thin owning wrappers around ash. Every GPU object is released when its
// wrapper drops, and each wrapper keeps the device alive until then.

pub mod commands;
pub mod device;
pub mod pipeline;
pub mod probe;
pub mod selector;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use device::{DeviceSettings, VulkanDevice};
pub use shader::ShaderSet;
pub use swapchain::SwapchainManager;
pub use sync::FrameSync;
