//! HDMI output window
//!
//! Shows the display sink's framebuffer using winit for window management and
//! softbuffer for software rendering. The SoC runs between redraws; a new picture is
//! presented every time the sink completes a frame.

use crate::core::{Soc, StopReason};
use softbuffer::{Context, Surface};
use std::num::NonZeroU32;
use std::rc::Rc;
use tracing::{error, info};
use winit::application::ApplicationHandler;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::Window;

// ================================================================================================
// Window Layout Constants
// ================================================================================================

/// Border size around the picture in pixels
const BORDER_SIZE: u32 = 4;

/// Border color in RGB format (dark grey: 0x333333)
const BORDER_COLOR: u32 = 0x333333;

// ================================================================================================
// Display Timing Constants
// ================================================================================================

/// Scheduler steps run per event loop iteration
const STEPS_PER_BATCH: usize = 20_000;

/// SoC display application
pub struct SocDisplay {
    soc: Soc,
    width: u32,
    height: u32,

    // Display state
    window: Option<Rc<Window>>,
    surface: Option<Surface<Rc<Window>, Rc<Window>>>,

    frames_presented: u64,
    failure: Option<String>,
}

impl SocDisplay {
    pub fn new(soc: Soc) -> Self {
        let width = soc.sink().width() as u32 + BORDER_SIZE * 2;
        let height = soc.sink().height() as u32 + BORDER_SIZE * 2;
        Self {
            soc,
            width,
            height,
            window: None,
            surface: None,
            frames_presented: 0,
            failure: None,
        }
    }

    fn open(&mut self, event_loop: &ActiveEventLoop) -> Result<(), String> {
        let window = Rc::new(
            event_loop
                .create_window(
                    Window::default_attributes()
                        .with_title(format!("tangsoc ({})", self.soc.config().board))
                        .with_inner_size(winit::dpi::PhysicalSize::new(self.width, self.height)),
                )
                .map_err(|e| e.to_string())?,
        );

        let context = Context::new(window.clone()).map_err(|e| e.to_string())?;
        let mut surface = Surface::new(&context, window.clone()).map_err(|e| e.to_string())?;
        let (Some(width), Some(height)) = (NonZeroU32::new(self.width), NonZeroU32::new(self.height))
        else {
            return Err("empty window".to_string());
        };
        surface.resize(width, height).map_err(|e| e.to_string())?;

        self.window = Some(window.clone());
        self.surface = Some(surface);

        // Kick off the first frame
        window.request_redraw();
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, message: String) {
        error!("display: {}", message);
        self.failure = Some(message);
        event_loop.exit();
    }

    fn log_final_state(&self) {
        let stats = self.soc.stats();
        info!("Frames: {} (presented {})", stats.frames, self.frames_presented);
        info!("Stats: {:?}", stats);
        info!("Elapsed: {:?}", self.soc.elapsed());
    }
}

impl ApplicationHandler for SocDisplay {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }
        if let Err(message) = self.open(event_loop) {
            self.fail(event_loop, message);
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                info!("=== Simulation Stopped ===");
                self.log_final_state();
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                if let Some(surface) = self.surface.as_mut()
                    && let Err(message) = Self::render(surface, &self.soc, self.width)
                {
                    self.fail(event_loop, message);
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let frames = self.soc.sink().frame_count();
        for _ in 0..STEPS_PER_BATCH {
            self.soc.step();
        }

        if let Some(reason) = self.soc.stop_condition() {
            info!("=== Stop Condition Reached: {:?} ===", reason);
            if let StopReason::Error(message) = reason {
                self.failure = Some(message);
            }
            self.log_final_state();
            event_loop.exit();
            return;
        }

        if self.soc.sink().frame_count() != frames
            && let Some(window) = self.window.as_ref()
        {
            window.request_redraw();
            self.frames_presented += 1;
        }
        event_loop.set_control_flow(ControlFlow::Poll);
    }
}

impl SocDisplay {
    fn render(
        surface: &mut Surface<Rc<Window>, Rc<Window>>,
        soc: &Soc,
        window_width: u32,
    ) -> Result<(), String> {
        let mut buffer = surface.buffer_mut().map_err(|e| e.to_string())?;

        // Fill with border color
        for pixel in buffer.iter_mut() {
            *pixel = BORDER_COLOR;
        }

        // The sink's framebuffer is already 0xRRGGBB
        let sink = soc.sink();
        for (y, row) in sink.framebuffer().chunks(sink.width()).enumerate() {
            let start = (y + BORDER_SIZE as usize) * window_width as usize + BORDER_SIZE as usize;
            if let Some(dst) = buffer.get_mut(start..start + row.len()) {
                dst.copy_from_slice(row);
            }
        }

        buffer.present().map_err(|e| e.to_string())
    }
}

pub fn run(soc: Soc) -> Result<(), Box<dyn std::error::Error>> {
    let event_loop = EventLoop::new()?;
    let mut app = SocDisplay::new(soc);
    event_loop.run_app(&mut app)?;
    match app.failure {
        Some(message) => Err(message.into()),
        None => Ok(()),
    }
}
