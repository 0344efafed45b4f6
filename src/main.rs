// =============================================================================
// VULKAN TRIANGLE - swapchain lifecycle and frame pacing
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit App (window, events, FPS title)                          │
// │    └── Renderer                                                 │
// │          ├── VulkanDevice (instance, surface, device selection) │
// │          ├── SwapchainManager (swapchain + dependent objects)   │
// │          └── FrameSynchronizer (fences, semaphores, slots)      │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait for the frame slot's fence
// 2. Acquire swapchain image
// 3. Submit pre-recorded commands to GPU
// 4. Present rendered image to screen
// 5. Advance to the next slot
//
// =============================================================================

mod backend;
mod config;
mod error;
mod frame;
mod renderer;

use anyhow::{Context, Result};
use config::Config;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use renderer::Renderer;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    init_logging();

    let config = Config::load();
    log::info!("Starting Vulkan renderer");
    log::info!(
        "Window: {}x{}, present mode: {}",
        config.window.width,
        config.window.height,
        config.graphics.present_mode
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    // Errors inside event callbacks end the loop and surface here
    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Info by default, `RUST_LOG` overrides
fn init_logging() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Window plus renderer.
///
/// Field order matters for Drop: the renderer goes before the window
/// its surface was created from.
struct App {
    config: Config,
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,

    fatal: Option<anyhow::Error>,

    frame_count: u32,
    last_frame_time: Instant,
    last_fps_update: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            config,
            renderer: None,
            window: None,
            fatal: None,
            frame_count: 0,
            last_frame_time: now,
            last_fps_update: now,
        }
    }

    fn init_renderer(&self, window: &Window) -> Result<Renderer> {
        let display_handle = window
            .display_handle()
            .context("Window has no display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Window has no window handle")?
            .as_raw();

        let size = window.inner_size();
        Renderer::new(
            &self.config,
            display_handle,
            window_handle,
            size.width,
            size.height,
        )
    }

    /// Record a fatal error and leave the event loop
    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:?}", error);
        self.shutdown();
        self.fatal.get_or_insert(error);
        event_loop.exit();
    }

    fn shutdown(&mut self) {
        if let Some(renderer) = self.renderer.as_mut() {
            if let Err(e) = renderer.shutdown() {
                log::error!("Shutdown failed: {:?}", e);
            }
        }
    }

    fn redraw(&mut self) -> Result<()> {
        let (Some(renderer), Some(window)) = (self.renderer.as_mut(), self.window.as_ref()) else {
            return Ok(());
        };

        let size = window.inner_size();
        if renderer.draw_frame(size.width, size.height)? {
            self.update_fps();
        }
        Ok(())
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_resizable(self.config.window.resizable)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                let error = anyhow::Error::new(e).context("Failed to create window");
                return self.fail(event_loop, error);
            }
        };

        match self.init_renderer(&window) {
            Ok(renderer) => {
                self.renderer = Some(renderer);
                self.window = Some(window);
            }
            Err(e) => self.fail(event_loop, e.context("Failed to initialize Vulkan")),
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown();
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.request_rebuild();
                }
            }

            WindowEvent::RedrawRequested => {
                if let Err(e) = self.redraw() {
                    self.fail(event_loop, e);
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    self.shutdown();
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
