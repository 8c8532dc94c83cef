//! Window creation, the winit event loop, and per-frame pacing around a [`Sample`].

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ash::vk;
use framekit_gpu::FrameOutcome;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::Sample;

/// Settings shared by the window, the device, and the frame loop.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Window title, also used as the Vulkan application name.
    pub title: String,
    /// Window size in physical pixels; the swapchain extent follows it.
    pub width: u32,
    pub height: u32,
    /// Frame pacing cap. `None` or `Some(0)` runs unthrottled.
    pub target_fps: Option<u32>,
    /// Requested present mode. FIFO is used when unsupported.
    pub present_mode: vk::PresentModeKHR,
    /// Frame slots in flight, independent of the swapchain image count.
    pub frames_in_flight: u32,
    /// Request `VK_LAYER_KHRONOS_validation`. On by default in debug builds.
    pub validation: bool,
    /// Exit after this many presented frames.
    pub max_frames: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "framekit".to_string(),
            width: 800,
            height: 600,
            target_fps: None,
            present_mode: vk::PresentModeKHR::IMMEDIATE,
            frames_in_flight: 2,
            validation: cfg!(debug_assertions),
            max_frames: None,
        }
    }
}

impl AppConfig {
    /// Defaults with a custom title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Set the requested present mode.
    pub fn with_present_mode(mut self, mode: vk::PresentModeKHR) -> Self {
        self.present_mode = mode;
        self
    }

    /// Set the number of frames in flight. Values below 1 are raised to 1.
    pub fn with_frames_in_flight(mut self, frames: u32) -> Self {
        self.frames_in_flight = frames.max(1);
        self
    }

    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Exit after `frames` presented frames.
    pub fn with_max_frames(mut self, frames: u64) -> Self {
        self.max_frames = Some(frames);
        self
    }

    fn target_frame_time(&self) -> Option<Duration> {
        self.target_fps
            .filter(|&fps| fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }
}

/// Frame counts and frame-time extremes gathered while running.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStats {
    fastest: Option<Duration>,
    slowest: Duration,
    elapsed: Duration,
    timed: u32,
    presented: u64,
    skipped: u64,
}

impl FrameStats {
    /// Record one frame that took `dt`.
    pub fn record(&mut self, dt: Duration, outcome: FrameOutcome) {
        match outcome {
            FrameOutcome::Presented { .. } => self.presented += 1,
            FrameOutcome::Skipped { .. } => self.skipped += 1,
        }

        if dt.is_zero() {
            return;
        }
        self.fastest = Some(self.fastest.map_or(dt, |f| f.min(dt)));
        self.slowest = self.slowest.max(dt);
        self.elapsed += dt;
        self.timed += 1;
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// `(min, max, avg)` FPS, or `None` before the first timed frame.
    ///
    /// The average is frames over total time, not a mean of per-frame rates.
    pub fn fps(&self) -> Option<(f64, f64, f64)> {
        let fastest = self.fastest?;
        let rate = |d: Duration| 1.0 / d.as_secs_f64();
        let avg = (self.elapsed / self.timed).as_secs_f64().recip();
        Some((rate(self.slowest), rate(fastest), avg))
    }

    fn log(&self) {
        match self.fps() {
            Some((min, max, avg)) => info!(
                presented = self.presented,
                skipped = self.skipped,
                "{min:.1} / {avg:.1} / {max:.1} fps (min / avg / max)"
            ),
            None => info!(presented = self.presented, skipped = self.skipped, "no timed frames"),
        }
    }
}

/// Install the global `tracing` subscriber.
///
/// Filtered by `RUST_LOG`, defaulting to `info`. Does nothing if a
/// subscriber is already installed.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

/// Run a [`Sample`] with the given configuration.
///
/// Initializes logging, creates the window, and runs the event loop until
/// the window closes, the frame limit is reached, or a frame fails. A fatal
/// error is returned after the sample has been shut down.
pub fn run_app<S: Sample + 'static>(config: AppConfig) -> anyhow::Result<()> {
    init_logging();

    info!(title = %config.title, "starting");

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<S> {
        config,
        state: None,
        fatal: None,
    };

    event_loop.run_app(&mut runner)?;

    match runner.fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// winit handler owning the sample once the event loop resumes.
struct AppRunner<S: Sample> {
    config: AppConfig,
    state: Option<AppState<S>>,
    fatal: Option<anyhow::Error>,
}

/// Live window and sample.
///
/// The sample is declared before the window so its surface is destroyed
/// while the window is still alive.
struct AppState<S: Sample> {
    sample: S,
    window: Arc<Window>,
    target_frame_time: Option<Duration>,
    max_frames: Option<u64>,
    last_frame: Instant,
    stats: FrameStats,
}

impl<S: Sample + 'static> ApplicationHandler for AppRunner<S> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Window and device ready");
            }
            Err(e) => {
                error!("Initialization failed: {e:#}");
                self.fatal = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        if let Some(state) = &mut self.state {
            if state.sample.on_event(&event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Window closed");
                self.stop(event_loop);
            }
            WindowEvent::RedrawRequested => {
                let Some(state) = &mut self.state else {
                    return;
                };
                match state.render_frame() {
                    Ok(true) => state.window.request_redraw(),
                    Ok(false) => {
                        info!("Frame limit reached");
                        self.stop(event_loop);
                    }
                    Err(e) => {
                        error!("Render error: {e:#}");
                        self.fatal = Some(e);
                        self.stop(event_loop);
                    }
                }
            }
            WindowEvent::Resized(size) => {
                if self.state.is_some() {
                    warn!(
                        "Window resized to {}x{}; the swapchain keeps its original extent",
                        size.width, size.height
                    );
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.window.request_redraw();
        }
    }
}

impl<S: Sample + 'static> AppRunner<S> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<S>> {
        let attributes = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height))
            .with_resizable(false);

        let window = Arc::new(event_loop.create_window(attributes)?);

        let size = window.inner_size();
        let config = AppConfig {
            width: size.width,
            height: size.height,
            ..self.config.clone()
        };
        let sample = S::init(&window, &config)?;

        Ok(AppState {
            sample,
            window,
            target_frame_time: self.config.target_frame_time(),
            max_frames: self.config.max_frames,
            last_frame: Instant::now(),
            stats: FrameStats::default(),
        })
    }

    /// Shut the sample down and leave the event loop.
    fn stop(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(state) = self.state.take() {
            if let Err(e) = state.shutdown() {
                error!("Shutdown error: {e:#}");
                if self.fatal.is_none() {
                    self.fatal = Some(e);
                }
            }
        }
        event_loop.exit();
    }
}

impl<S: Sample> AppState<S> {
    /// Render one frame. Returns `false` once the frame limit is reached.
    #[tracing::instrument(level = "trace", skip_all)]
    fn render_frame(&mut self) -> anyhow::Result<bool> {
        let frame_start = Instant::now();

        let outcome = self.sample.step()?;

        let now = Instant::now();
        self.stats.record(now.duration_since(self.last_frame), outcome);
        self.last_frame = now;

        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                thread::sleep(target - elapsed);
            }
        }

        Ok(self
            .max_frames
            .map_or(true, |limit| self.stats.presented() < limit))
    }

    fn shutdown(self) -> anyhow::Result<()> {
        self.stats.log();

        self.sample.shutdown()?;
        info!("Sample shut down");
        Ok(())
    }
}
