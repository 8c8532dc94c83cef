//! `Sample` trait definition.

use framekit_gpu::FrameOutcome;
use winit::event::WindowEvent;
use winit::window::Window;

use crate::hello::{HelloApi, HelloConfig};
use crate::runner::AppConfig;

/// A sample driven by [`run_app`](crate::run_app).
///
/// The runner owns the window and event loop; the sample owns all GPU state.
pub trait Sample: Sized {
    /// Create all GPU state for `window` and record static command buffers.
    fn init(window: &Window, config: &AppConfig) -> anyhow::Result<Self>;

    /// Render one frame.
    fn step(&mut self) -> anyhow::Result<FrameOutcome>;

    /// Wait for the GPU and release everything.
    fn shutdown(self) -> anyhow::Result<()>;

    /// Handle a window event. Return `true` if it was consumed.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }
}

impl Sample for HelloApi {
    fn init(window: &Window, config: &AppConfig) -> anyhow::Result<Self> {
        let hello = HelloApi::initialize(
            window,
            &HelloConfig {
                app_name: config.title.clone(),
                width: config.width,
                height: config.height,
                present_mode: config.present_mode,
                frames_in_flight: config.frames_in_flight,
                validation: config.validation,
            },
        )?;
        hello.record_frame_commands()?;
        Ok(hello)
    }

    fn step(&mut self) -> anyhow::Result<FrameOutcome> {
        self.step_frame()
    }

    fn shutdown(self) -> anyhow::Result<()> {
        HelloApi::shutdown(self)
    }
}
