// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::ffi::CString;
use std::path::{Path, PathBuf};

use crate::backend::DeviceSettings;

/// Device extension every configuration ends up requiring
const SWAPCHAIN_EXTENSION: &str = "VK_KHR_swapchain";

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub device: DeviceConfig,
    pub shaders: ShaderConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Vulkan Triangle".to_string(),
            width: 800,
            height: 600,
            resizable: true,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            max_frames_in_flight: 2,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub layers: Vec<String>,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            layers: vec!["VK_LAYER_KHRONOS_validation".to_string()],
            show_fps: true,
        }
    }
}

/// Physical device requirements
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub required_extensions: Vec<String>,
    pub require_geometry_shader: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            required_extensions: vec![SWAPCHAIN_EXTENSION.to_string()],
            require_geometry_shader: true,
        }
    }
}

/// Precompiled SPIR-V locations
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            vertex: PathBuf::from("shaders/triangle.vert.spv"),
            fragment: PathBuf::from("shaders/triangle.frag.spv"),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    fn parse(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;

        if config.graphics.max_frames_in_flight == 0 {
            log::warn!("max_frames_in_flight must be at least 1, using 1");
            config.graphics.max_frames_in_flight = 1;
        }

        Ok(config)
    }

    /// Preferred present mode as Vulkan enum. FIFO is the fallback since
    /// it is the only mode every surface supports.
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "fifo" => vk::PresentModeKHR::FIFO,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::FIFO
            }
        }
    }

    /// Whether validation layers are actually enabled (debug builds only)
    pub fn validation_enabled(&self) -> bool {
        cfg!(debug_assertions) && self.debug.validation_layers
    }

    /// Startup settings for instance creation and device selection
    pub fn device_settings(&self) -> Result<DeviceSettings> {
        let mut extensions = self.device.required_extensions.clone();
        if !extensions.iter().any(|e| e == SWAPCHAIN_EXTENSION) {
            extensions.push(SWAPCHAIN_EXTENSION.to_string());
        }

        let to_cstrings = |names: &[String]| -> Result<Vec<CString>> {
            names
                .iter()
                .map(|n| CString::new(n.as_str()).with_context(|| format!("Invalid name: {:?}", n)))
                .collect()
        };

        let validation = self.validation_enabled();
        let layers = if validation {
            to_cstrings(&self.debug.layers)?
        } else {
            Vec::new()
        };

        Ok(DeviceSettings {
            app_name: CString::new(self.window.title.as_str())
                .context("Window title contains a NUL byte")?,
            validation,
            required_layers: layers,
            required_extensions: to_cstrings(&extensions)?,
            require_geometry_shader: self.device.require_geometry_shader,
        })
    }
}
