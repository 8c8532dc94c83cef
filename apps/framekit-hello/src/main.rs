//! framekit hello sample
//!
//! Clears the window, draws a textured triangle, and rotates it a little
//! every frame. Uniforms stream through one dynamic uniform buffer with a
//! slice per frame in flight.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p framekit-hello -- [OPTIONS]
//! ```
//!
//! ## Examples
//!
//! ```bash
//! # Three frames in flight, vsync
//! cargo run -p framekit-hello -- --frames-in-flight 3 --present-mode fifo
//!
//! # Unattended run that exits after 500 frames
//! cargo run -p framekit-hello -- --max-frames 500 --no-validation
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use anyhow::{bail, Context};
use ash::vk;
use framekit_app::{run_app, AppConfig, HelloApi};

const TITLE: &str = "framekit - Hello API";
const WIDTH: u32 = 800;
const HEIGHT: u32 = 600;

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_args(&args)? {
        Some(config) => run_app::<HelloApi>(config),
        None => {
            print_help();
            Ok(())
        }
    }
}

/// Parse command line arguments. Returns `None` when help was requested.
fn parse_args(args: &[String]) -> anyhow::Result<Option<AppConfig>> {
    let mut config = AppConfig::new(TITLE).with_size(WIDTH, HEIGHT);

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .with_context(|| format!("{name} requires a value"))
        };

        match arg.as_str() {
            "-h" | "--help" => return Ok(None),
            "--width" => config.width = parse_number("--width", value("--width")?)?,
            "--height" => config.height = parse_number("--height", value("--height")?)?,
            "--present-mode" => {
                config.present_mode = parse_present_mode(value("--present-mode")?)?;
            }
            "--frames-in-flight" => {
                let frames = parse_number("--frames-in-flight", value("--frames-in-flight")?)?;
                if frames == 0 {
                    bail!("--frames-in-flight must be at least 1");
                }
                config.frames_in_flight = frames;
            }
            "--max-frames" => {
                config.max_frames = Some(parse_number("--max-frames", value("--max-frames")?)?);
            }
            "--target-fps" => {
                config.target_fps = Some(parse_number("--target-fps", value("--target-fps")?)?);
            }
            "--validation" => config.validation = true,
            "--no-validation" => config.validation = false,
            other => bail!("unknown argument: {other} (see --help)"),
        }
    }

    Ok(Some(config))
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> anyhow::Result<T> {
    value
        .parse()
        .ok()
        .with_context(|| format!("invalid value for {name}: {value}"))
}

fn parse_present_mode(value: &str) -> anyhow::Result<vk::PresentModeKHR> {
    Ok(match value {
        "immediate" => vk::PresentModeKHR::IMMEDIATE,
        "mailbox" => vk::PresentModeKHR::MAILBOX,
        "fifo" => vk::PresentModeKHR::FIFO,
        "fifo-relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
        other => bail!("unknown present mode: {other}"),
    })
}

fn print_help() {
    eprintln!(
        "framekit Hello API sample

USAGE:
    cargo run -p framekit-hello -- [OPTIONS]

OPTIONS:
    --width <N>                 Window width (default: {WIDTH})
    --height <N>                Window height (default: {HEIGHT})
    --present-mode <MODE>       immediate | mailbox | fifo | fifo-relaxed
                                (default: immediate, falls back to fifo)
    --frames-in-flight <N>      Frame slots in flight (default: 2)
    --max-frames <N>            Exit after N presented frames
    --target-fps <N>            Limit the frame rate on the CPU side
    --validation                Enable Vulkan validation layers
    --no-validation             Disable Vulkan validation layers
                                (default: enabled in debug builds)
    -h, --help                  Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                    Set log level (e.g., info, debug, trace)"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn defaults_without_arguments() {
        let config = parse_args(&[]).unwrap().unwrap();
        assert_eq!(config.width, WIDTH);
        assert_eq!(config.height, HEIGHT);
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.present_mode, vk::PresentModeKHR::IMMEDIATE);
    }

    #[test]
    fn parses_all_options() {
        let config = parse_args(&args(&[
            "--width",
            "1024",
            "--height",
            "768",
            "--present-mode",
            "fifo-relaxed",
            "--frames-in-flight",
            "3",
            "--max-frames",
            "500",
            "--target-fps",
            "60",
            "--no-validation",
        ]))
        .unwrap()
        .unwrap();

        assert_eq!((config.width, config.height), (1024, 768));
        assert_eq!(config.present_mode, vk::PresentModeKHR::FIFO_RELAXED);
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.max_frames, Some(500));
        assert_eq!(config.target_fps, Some(60));
        assert!(!config.validation);
    }

    #[test]
    fn help_short_circuits() {
        assert!(parse_args(&args(&["--width", "10", "-h"])).unwrap().is_none());
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_args(&args(&["--frames-in-flight", "0"])).is_err());
        assert!(parse_args(&args(&["--width"])).is_err());
        assert!(parse_args(&args(&["--width", "wide"])).is_err());
        assert!(parse_args(&args(&["--present-mode", "vsync"])).is_err());
        assert!(parse_args(&args(&["--bogus"])).is_err());
    }
}
