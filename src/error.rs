// Renderer error taxonomy
//
// Every variant is fatal at this layer. The only locally recovered
// condition (a stale swapchain) never surfaces as an error.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RendererError {
    #[error("No GPU can run this program")]
    NoSuitableDevice,

    #[error("Failed to create swapchain: {0}")]
    SwapchainCreationFailed(vk::Result),

    #[error("Failed to submit command buffer: {0}")]
    QueueSubmitFailed(vk::Result),

    #[error("Failed to load shader {}: {source}", path.display())]
    ShaderLoadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create synchronization objects: {0}")]
    SyncObjectCreationFailed(vk::Result),

    #[error("Validation layer {0} was requested but is not available")]
    ValidationUnavailable(String),

    #[error("Failed to record command buffer: {0}")]
    CommandRecordingFailed(vk::Result),
}
