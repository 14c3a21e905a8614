use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use cadence::{EventPump, PresentationTarget, WorkError};
use pixels::{Error as PixelsError, Pixels, SurfaceTexture};
use thiserror::Error;
use tracing::{info, warn};
use winit::dpi::LogicalSize;
use winit::error::OsError;
use winit::event::{ElementState, Event, WindowEvent};
use winit::event_loop::EventLoop;
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::window::{Window, WindowBuilder};

const CLEAR_COLOR: [u8; 4] = [20, 22, 28, 255];

/// Window plus its pixel buffer, shared between the event pump, the
/// presentation target and the draw units.
pub(crate) struct WindowSurface {
    window: Arc<Window>,
    pixels: Pixels<'static>,
    width: u32,
    height: u32,
    close_requested: bool,
}

pub(crate) type SharedSurface = Rc<RefCell<WindowSurface>>;

#[derive(Debug, Error)]
pub(crate) enum SurfaceError {
    #[error("failed to create application window: {0}")]
    CreateWindow(#[source] OsError),
    #[error("failed to initialize pixel surface: {0}")]
    CreatePixels(#[source] PixelsError),
}

impl WindowSurface {
    pub(crate) fn open(
        event_loop: &EventLoop<()>,
        title: &str,
        width: u32,
        height: u32,
    ) -> Result<Self, SurfaceError> {
        let window = Arc::new(
            WindowBuilder::new()
                .with_title(title)
                .with_inner_size(LogicalSize::new(width as f64, height as f64))
                .build(event_loop)
                .map_err(SurfaceError::CreateWindow)?,
        );
        let size = window.inner_size();
        let pixels = build_pixels(Arc::clone(&window), size.width, size.height)
            .map_err(SurfaceError::CreatePixels)?;
        Ok(Self {
            window,
            pixels,
            width: size.width,
            height: size.height,
            close_requested: false,
        })
    }

    pub(crate) fn width(&self) -> u32 {
        self.width
    }

    pub(crate) fn height(&self) -> u32 {
        self.height
    }

    pub(crate) fn frame_mut(&mut self) -> &mut [u8] {
        self.pixels.frame_mut()
    }

    pub(crate) fn set_title(&self, title: &str) {
        self.window.set_title(title);
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<(), PixelsError> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        self.pixels = build_pixels(Arc::clone(&self.window), width, height)?;
        self.width = width;
        self.height = height;
        Ok(())
    }

    fn request_close(&mut self, reason: &'static str) {
        if !self.close_requested {
            info!(reason, "shutdown_requested");
            self.close_requested = true;
        }
    }
}

fn build_pixels(
    window: Arc<Window>,
    width: u32,
    height: u32,
) -> Result<Pixels<'static>, PixelsError> {
    let surface = SurfaceTexture::new(width, height, window);
    Pixels::new(width, height, surface)
}

/// Presents the shared surface: clears before the draw units, renders after.
pub(crate) struct WindowTarget {
    surface: SharedSurface,
}

impl WindowTarget {
    pub(crate) fn new(surface: SharedSurface) -> Self {
        Self { surface }
    }
}

impl PresentationTarget for WindowTarget {
    fn label(&self) -> &str {
        "main_window"
    }

    fn should_close(&self) -> bool {
        self.surface.borrow().close_requested
    }

    fn make_current(&mut self) -> Result<(), WorkError> {
        let mut surface = self.surface.borrow_mut();
        for pixel in surface.frame_mut().chunks_exact_mut(4) {
            pixel.copy_from_slice(&CLEAR_COLOR);
        }
        Ok(())
    }

    fn present(&mut self) -> Result<(), WorkError> {
        self.surface
            .borrow()
            .pixels
            .render()
            .map_err(|error| WorkError::msg(format!("pixels render failed: {error}")))
    }
}

/// Drains pending winit events without blocking.
pub(crate) struct WinitPump {
    event_loop: EventLoop<()>,
    surface: SharedSurface,
}

impl WinitPump {
    pub(crate) fn new(event_loop: EventLoop<()>, surface: SharedSurface) -> Self {
        Self {
            event_loop,
            surface,
        }
    }
}

impl EventPump for WinitPump {
    fn poll_events(&mut self) {
        let surface = &self.surface;
        let window_id = surface.borrow().window.id();
        let status = self
            .event_loop
            .pump_events(Some(Duration::ZERO), |event, _window_target| {
                let Event::WindowEvent { window_id: id, event } = event else {
                    return;
                };
                if id != window_id {
                    return;
                }
                match event {
                    WindowEvent::CloseRequested => {
                        surface.borrow_mut().request_close("window_close");
                    }
                    WindowEvent::Resized(size) => {
                        let mut surface = surface.borrow_mut();
                        if let Err(error) = surface.resize(size.width, size.height) {
                            warn!(error = %error, "surface_resize_failed");
                            surface.request_close("surface_resize_failed");
                        }
                    }
                    WindowEvent::KeyboardInput { event, .. } => {
                        if event.state == ElementState::Pressed
                            && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                        {
                            surface.borrow_mut().request_close("escape_key");
                        }
                    }
                    _ => {}
                }
            });

        if let PumpStatus::Exit(code) = status {
            info!(code, "event_loop_exited");
            surface.borrow_mut().request_close("event_loop_exit");
        }
    }
}
