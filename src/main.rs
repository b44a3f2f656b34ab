// =============================================================================
// LEARNING VULKAN - textured, instanced cubes
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  App (winit event loop, input, FPS title)                       │
// │    └── Renderer                                                 │
// │          └── Vulkan Device + Swapchain + Depth                  │
// │                └── Two Drawables (clear pass, load pass)        │
// │                      └── Pre-recorded command buffers           │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Update each drawable's MVP uniform
// 2. Acquire swapchain image
// 3. Submit that image's pre-recorded commands, wait for the queue
// 4. Present rendered image to screen
//
// =============================================================================

use anyhow::{Context, Result};
use learning_vulkan::config::{self, Config};
use learning_vulkan::renderer::Renderer;
use std::sync::Arc;
use std::time::Instant;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Fullscreen, Window, WindowAttributes, WindowId};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = config::load_and_init_logging(config::CONFIG_PATH);

    log::info!(
        "{}: {}x{}, present mode {}, {} instances per drawable",
        config.window.title,
        config.window.width,
        config.window.height,
        config.graphics.present_mode,
        config.graphics.instance_count
    );

    let mut app = App::new(config);
    EventLoop::new()?.run_app(&mut app)?;
    Ok(())
}

// =============================================================================
// FPS COUNTER
// =============================================================================

/// Counts presented frames and reports the rate about once a second
struct FrameCounter {
    frames: u32,
    window_start: Instant,
    last_frame: Instant,
}

impl FrameCounter {
    fn new(now: Instant) -> Self {
        Self {
            frames: 0,
            window_start: now,
            last_frame: now,
        }
    }

    /// Record one frame. Returns `(fps, frame_ms)` when a full second has
    /// passed since the last report.
    fn tick(&mut self, now: Instant) -> Option<(f32, f32)> {
        let frame_ms = now.duration_since(self.last_frame).as_secs_f32() * 1000.0;
        self.last_frame = now;
        self.frames += 1;

        let elapsed = now.duration_since(self.window_start).as_secs_f32();
        if elapsed < 1.0 {
            return None;
        }

        let fps = self.frames as f32 / elapsed;
        self.frames = 0;
        self.window_start = now;
        Some((fps, frame_ms))
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// The renderer is declared first so it drops before the window its surface
/// was created from.
struct App {
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,
    config: Config,
    fullscreen: bool,
    counter: FrameCounter,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            renderer: None,
            window: None,
            fullscreen: config.window.fullscreen,
            config,
            counter: FrameCounter::new(Instant::now()),
        }
    }

    fn fullscreen_mode(enabled: bool) -> Option<Fullscreen> {
        enabled.then_some(Fullscreen::Borderless(None))
    }

    /// Open the window and bring up Vulkan on it
    fn start(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window_config = &self.config.window;
        let attributes = WindowAttributes::default()
            .with_title(window_config.title.as_str())
            .with_inner_size(PhysicalSize::new(window_config.width, window_config.height))
            .with_fullscreen(Self::fullscreen_mode(self.fullscreen));

        let window = Arc::new(
            event_loop
                .create_window(attributes)
                .context("Failed to create window")?,
        );
        let renderer = Renderer::new(&self.config, &window).context("Failed to initialize Vulkan")?;

        self.renderer = Some(renderer);
        self.window = Some(window);
        Ok(())
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(window) = &self.window {
            self.fullscreen = !self.fullscreen;
            window.set_fullscreen(Self::fullscreen_mode(self.fullscreen));
            log::info!("Fullscreen: {}", self.fullscreen);
            // The Resized event that follows triggers the rebuild
        }
    }

    fn frame_presented(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }
        if let (Some((fps, frame_ms)), Some(window)) = (self.counter.tick(Instant::now()), &self.window) {
            window.set_title(&format!("{} - {:.0} FPS ({:.2}ms)", self.config.window.title, fps, frame_ms));
        }
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(renderer) = &self.renderer {
            if let Err(e) = renderer.wait_idle() {
                log::error!("wait_idle failed: {:?}", e);
            }
        }
        event_loop.exit();
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
        if let Err(e) = self.start(event_loop) {
            log::error!("{:?}", e);
            event_loop.exit();
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Window closed");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(size) => {
                log::debug!("Resized to {}x{}", size.width, size.height);
                if let Some(renderer) = &mut self.renderer {
                    renderer.resize(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => {
                let result = match &mut self.renderer {
                    Some(renderer) => renderer.render(),
                    None => return,
                };
                match result {
                    Ok(true) => self.frame_presented(),
                    Ok(false) => {}
                    Err(e) => {
                        log::error!("Frame failed: {:?}", e);
                        self.shutdown(event_loop);
                    }
                }
            }

            WindowEvent::KeyboardInput { event: key, .. } if key.state.is_pressed() => {
                match key.physical_key {
                    PhysicalKey::Code(KeyCode::Escape) => self.shutdown(event_loop),
                    PhysicalKey::Code(KeyCode::F11) => self.toggle_fullscreen(),
                    _ => {}
                }
            }

            _ => {}
        }
    }

    /// Keep redrawing continuously
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn counter_reports_once_per_second() {
        let start = Instant::now();
        let mut counter = FrameCounter::new(start);

        for i in 1..60 {
            assert!(counter.tick(start + Duration::from_millis(i * 16)).is_none());
        }

        let (fps, frame_ms) = counter.tick(start + Duration::from_millis(1000)).unwrap();
        assert!((fps - 60.0).abs() < 0.5, "fps {}", fps);
        assert!((frame_ms - 56.0).abs() < 0.5, "frame {}", frame_ms);

        // Window restarts after a report
        assert!(counter.tick(start + Duration::from_millis(1016)).is_none());
    }
}
