//! Windowing, logging, and the hello sample for framekit.
//!
//! [`run_app`] creates a window, installs a `tracing` subscriber, and drives
//! a [`Sample`] from the winit event loop until the window closes or the
//! configured frame limit is reached.
//!
//! # Example
//!
//! ```no_run
//! use framekit_app::{run_app, AppConfig, HelloApi};
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<HelloApi>(AppConfig::new("hello").with_max_frames(600))
//! }
//! ```

mod app;
pub mod hello;
mod runner;
pub mod scene;

pub use app::Sample;
pub use hello::{HelloApi, HelloConfig};
pub use runner::{init_logging, run_app, AppConfig, FrameStats};
pub use winit::event::WindowEvent;
